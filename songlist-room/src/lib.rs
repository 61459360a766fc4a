//! Tokio runtime for songlist replicas.
//!
//! ```text
//! LocalCluster (directory + router)
//!   ├─► RoomActor 0 (owns RoomCore)
//!   │     ├─► heartbeat task per peer
//!   │     └─► one-shot timeout tasks
//!   ├─► RoomActor 1 ...
//!   └─► master response channels
//! ```
//!
//! Each [`RoomActor`](actor) is a single mailbox loop over one `RoomCore`;
//! all waiting is expressed as self-addressed timers, so no handler ever
//! blocks. The [`cluster`] module wires mailboxes together through a router
//! that moves the encoded wire lines and provides replica kill plus line
//! filters for failure tests.

#![warn(clippy::pedantic)]

pub mod actor;
pub mod cluster;
mod heartbeat;

pub use actor::{RoomMsg, RoomStatus};
pub use cluster::{ClusterError, LocalCluster};
