//! Room protocol messages and the effects handlers emit.

use crate::types::{CommitState, Decision, ReplicaId, Role, SongList, Update, Vote};

/// Replica-to-replica messages. Each variant corresponds to one wire line
/// (see [`crate::wire`]).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerMessage {
    Heartbeat { role: Role, id: ReplicaId },
    VoteReq(Update),
    VoteReply(Vote),
    PreCommit,
    AckPreCommit,
    Decision(Decision),
    StateReq,
    StateReply(CommitState),
    FullStateReq,
    SongListSnapshot(SongList),
}

/// Requests injected by the external master driver.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MasterRequest {
    JoinMaster,
    Add { name: String, url: String },
    Delete { name: String },
    Get { name: String },
    RequestFullState,
}

/// Responses owed to the master driver.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MasterResponse {
    Coordinator(ReplicaId),
    AckCommit,
    AckAbort,
    Resp(Option<String>),
}

/// Self-addressed one-shot timers.
///
/// Commit-round timers carry the iteration they were scheduled under; a
/// mismatch on receipt means the round has moved on and the timer is dropped.
/// Timers are never cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timeout {
    DetermineCoordinator,
    VoteReply { iter: u64 },
    AckPreCommit { iter: u64 },
    PreCommit { iter: u64 },
    Commit { iter: u64 },
    StateReq { iter: u64 },
    StateReqReply { iter: u64 },
}

impl Timeout {
    /// The commit iteration this timer was scheduled under, if any.
    #[must_use]
    pub fn source_iter(self) -> Option<u64> {
        match self {
            Self::DetermineCoordinator => None,
            Self::VoteReply { iter }
            | Self::AckPreCommit { iter }
            | Self::PreCommit { iter }
            | Self::Commit { iter }
            | Self::StateReq { iter }
            | Self::StateReqReply { iter } => Some(iter),
        }
    }
}

/// Everything a room's mailbox can deliver.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Input {
    Peer { from: ReplicaId, msg: PeerMessage },
    Master(MasterRequest),
    Timeout(Timeout),
}

/// What a handler asks the runtime to do. The core never performs I/O
/// itself.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Effect {
    /// Deliver a protocol message to a peer.
    Send { to: ReplicaId, msg: PeerMessage },
    /// Deliver a response to the master driver, if one is attached.
    Master(MasterResponse),
    /// Post `timeout` back to this room's own mailbox after the configured
    /// delay.
    Schedule(Timeout),
    /// The announced role changed: tear down and restart the heartbeat
    /// schedule with `role`.
    Announce(Role),
    /// The room hit a state it cannot proceed from.
    Fatal(&'static str),
}
