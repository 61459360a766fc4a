//! Replicated songlist core: the three-phase-commit room state machine, its
//! heartbeat-fed failure detector, and the text wire grammar.
//!
//! # Architecture
//!
//! - [`RoomCore`]: pure state machine — every handler takes a monotonic
//!   `now_ms` and returns [`Effect`]s for the runtime to carry out
//! - [`wire`]: the space-separated text line grammar spoken between replicas
//!   and with the master driver
//! - [`RoomConfig`]: heartbeat rate, liveness window, bootstrap delay
//!
//! The core performs no I/O and reads no clocks, so the async runtime in
//! `songlist-room` and the Stateright model in `tests/model.rs` drive the
//! exact same transition logic.

#![warn(clippy::pedantic)]

pub mod config;
mod messages;
pub mod room;
mod types;
pub mod wire;

pub use config::RoomConfig;
pub use messages::{Effect, Input, MasterRequest, MasterResponse, PeerMessage, Timeout};
pub use room::{BeatEntry, CommitPhase, RoomCore};
pub use types::{CommitState, Decision, ReplicaId, Role, SongList, Update, Vote, vote_on};
