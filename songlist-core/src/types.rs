//! Core type definitions shared between the async runtime and model checker.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Replica identity. Ordering is numeric; the election rule promotes the
/// lowest live id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(pub u32);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ReplicaId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Role announced through heartbeats.
///
/// Observers no longer vote; they still heartbeat and still serve `get`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Coordinator,
    Participant,
    Observer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Participant => "participant",
            Self::Observer => "observer",
        }
    }
}

/// A songlist mutation proposed by the master.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Update {
    Add { name: String, url: String },
    Delete { name: String },
}

impl Update {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Add { name, .. } | Self::Delete { name } => name,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Vote {
    Yes,
    No,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Decision {
    Commit,
    Abort,
}

/// Local progress of the current round, as reported to a new coordinator
/// running the termination protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommitState {
    Aborted,
    Uncertain,
    Committable,
    Committed,
}

impl CommitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::Uncertain => "uncertain",
            Self::Committable => "committable",
            Self::Committed => "committed",
        }
    }
}

/// The shared map every replica converges on.
pub type SongList = std::collections::BTreeMap<String, String>;

/// Application-level vote rule: a replica with numeric id `d` rejects an add
/// whose URL is longer than `d + 5` bytes. Deletes are always accepted.
#[must_use]
pub fn vote_on(update: &Update, id: ReplicaId) -> Vote {
    match update {
        Update::Add { url, .. } if url.len() as u64 > u64::from(id.0) + 5 => Vote::No,
        Update::Add { .. } | Update::Delete { .. } => Vote::Yes,
    }
}
