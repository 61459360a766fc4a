//! Pure room state machine — no I/O, no async, no clock reads.
//!
//! Every handler takes an explicit monotonic `now_ms` reading and returns the
//! [`Effect`]s the runtime must carry out. The same core drives the tokio
//! actor and the Stateright model.
//!
//! Handlers pattern-match on `(message, phase)` jointly; combinations that
//! make no protocol sense are logged and ignored rather than acted on. The
//! only unrecoverable condition is a vote request arriving before any
//! coordinator is known.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, trace, warn};

use crate::config::RoomConfig;
use crate::messages::{Effect, Input, MasterRequest, MasterResponse, PeerMessage, Timeout};
use crate::types::{CommitState, Decision, ReplicaId, Role, SongList, Update, Vote, vote_on};

/// A peer as last seen through its heartbeats.
///
/// Entries are never evicted; liveness is always a fresh comparison of
/// `now - last_seen` against the alive threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BeatEntry {
    pub role: Role,
    pub last_seen_ms: u64,
}

/// 3PC sub-state for the current commit iteration.
///
/// `up_set` is snapshotted when the round opens and never changes mid-round.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommitPhase {
    /// No role established yet.
    Start,
    /// Coordinator, idle.
    CoordWaiting,
    /// Vote requests broadcast; collecting yes votes.
    CoordInitCommit {
        update: Update,
        up_set: BTreeSet<ReplicaId>,
        votes: BTreeSet<ReplicaId>,
    },
    /// Pre-commit broadcast; collecting acknowledgements.
    CoordCommitable {
        update: Update,
        up_set: BTreeSet<ReplicaId>,
        acks: BTreeSet<ReplicaId>,
    },
    CoordCommitted,
    CoordAborted,
    /// Voted yes; waiting for pre-commit.
    ParticipantInitCommit {
        update: Update,
        up_set: BTreeSet<ReplicaId>,
    },
    /// Acknowledged pre-commit; waiting for the decision.
    ParticipantCommitable {
        update: Update,
        up_set: BTreeSet<ReplicaId>,
    },
    ParticipantCommitted,
    ParticipantAborted,
}

impl CommitPhase {
    /// The state reported to a new coordinator running the termination
    /// protocol. A replica that never opened the round can safely abort it,
    /// so the idle phases report `Aborted`.
    #[must_use]
    pub fn commit_state(&self) -> CommitState {
        match self {
            Self::Start | Self::CoordWaiting | Self::CoordAborted | Self::ParticipantAborted => {
                CommitState::Aborted
            }
            Self::CoordInitCommit { .. } | Self::ParticipantInitCommit { .. } => {
                CommitState::Uncertain
            }
            Self::CoordCommitable { .. } | Self::ParticipantCommitable { .. } => {
                CommitState::Committable
            }
            Self::CoordCommitted | Self::ParticipantCommitted => CommitState::Committed,
        }
    }

    fn in_flight_update(&self) -> Option<&Update> {
        match self {
            Self::CoordInitCommit { update, .. }
            | Self::CoordCommitable { update, .. }
            | Self::ParticipantInitCommit { update, .. }
            | Self::ParticipantCommitable { update, .. } => Some(update),
            _ => None,
        }
    }
}

/// Reply collection for the termination protocol, held by the new
/// coordinator between `statereq` broadcast and its reply timeout.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Termination {
    expected: BTreeSet<ReplicaId>,
    states: BTreeMap<ReplicaId, CommitState>,
}

/// The room state machine. Owned exclusively by whoever drives it; one input
/// is processed to completion before the next.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomCore {
    id: ReplicaId,
    role: Role,
    actors: BTreeSet<ReplicaId>,
    coordinator: Option<ReplicaId>,
    master_joined: bool,
    beatmap: BTreeMap<ReplicaId, BeatEntry>,
    phase: CommitPhase,
    iter: u64,
    songs: SongList,
    alive_threshold_ms: u64,
    termination: Option<Termination>,
}

impl RoomCore {
    #[must_use]
    pub fn new(id: ReplicaId, peers: impl IntoIterator<Item = ReplicaId>, config: &RoomConfig) -> Self {
        Self {
            id,
            role: Role::Participant,
            actors: peers.into_iter().filter(|&p| p != id).collect(),
            coordinator: None,
            master_joined: false,
            beatmap: BTreeMap::new(),
            phase: CommitPhase::Start,
            iter: 1,
            songs: SongList::new(),
            alive_threshold_ms: config.alive_threshold_ms(),
            termination: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn coordinator(&self) -> Option<ReplicaId> {
        self.coordinator
    }

    #[must_use]
    pub fn phase(&self) -> &CommitPhase {
        &self.phase
    }

    #[must_use]
    pub fn iter(&self) -> u64 {
        self.iter
    }

    #[must_use]
    pub fn songs(&self) -> &SongList {
        &self.songs
    }

    /// Peers this room heartbeats to.
    #[must_use]
    pub fn actors(&self) -> &BTreeSet<ReplicaId> {
        &self.actors
    }

    /// Effects to run once at startup.
    #[must_use]
    pub fn startup(&self) -> Vec<Effect> {
        vec![Effect::Schedule(Timeout::DetermineCoordinator)]
    }

    /// The submap of the beatmap whose heartbeats are fresh, optionally
    /// filtered to one role. This is the only definition of "up".
    #[must_use]
    pub fn alive(&self, now_ms: u64, role: Option<Role>) -> BTreeMap<ReplicaId, BeatEntry> {
        self.beatmap
            .iter()
            .filter(|(_, beat)| now_ms.saturating_sub(beat.last_seen_ms) < self.alive_threshold_ms)
            .filter(|(_, beat)| role.is_none_or(|r| beat.role == r))
            .map(|(&id, &beat)| (id, beat))
            .collect()
    }

    fn coordinator_alive(&self, now_ms: u64) -> bool {
        self.coordinator.is_some_and(|coord| {
            coord == self.id || self.alive(now_ms, None).contains_key(&coord)
        })
    }

    /// Process one mailbox input to completion.
    pub fn handle(&mut self, now_ms: u64, input: Input) -> Vec<Effect> {
        match input {
            Input::Peer { from, msg } => self.on_peer(now_ms, from, msg),
            Input::Master(req) => self.on_master(now_ms, req),
            Input::Timeout(timeout) => self.on_timeout(now_ms, timeout),
        }
    }

    fn on_peer(&mut self, now_ms: u64, from: ReplicaId, msg: PeerMessage) -> Vec<Effect> {
        match msg {
            PeerMessage::Heartbeat { role, id } => {
                self.beatmap.insert(
                    id,
                    BeatEntry {
                        role,
                        last_seen_ms: now_ms,
                    },
                );
                if role == Role::Coordinator {
                    self.coordinator = Some(id);
                }
                Vec::new()
            }
            PeerMessage::VoteReq(update) => self.on_vote_req(now_ms, from, update),
            PeerMessage::VoteReply(vote) => self.on_vote_reply(from, vote),
            PeerMessage::PreCommit => self.on_pre_commit(from),
            PeerMessage::AckPreCommit => self.on_ack_pre_commit(from),
            PeerMessage::Decision(decision) => self.on_decision(from, decision),
            PeerMessage::StateReq => {
                self.coordinator = Some(from);
                vec![Effect::Send {
                    to: from,
                    msg: PeerMessage::StateReply(self.phase.commit_state()),
                }]
            }
            PeerMessage::StateReply(state) => self.on_state_reply(from, state),
            PeerMessage::FullStateReq => vec![Effect::Send {
                to: from,
                msg: PeerMessage::SongListSnapshot(self.songs.clone()),
            }],
            PeerMessage::SongListSnapshot(songs) => self.on_song_list(from, songs),
        }
    }

    fn on_master(&mut self, now_ms: u64, req: MasterRequest) -> Vec<Effect> {
        match req {
            MasterRequest::JoinMaster => {
                self.master_joined = true;
                Vec::new()
            }
            req if !self.master_joined => {
                warn!(id = %self.id, ?req, "master request before join");
                Vec::new()
            }
            MasterRequest::Add { name, url } => self.on_update(now_ms, Update::Add { name, url }),
            MasterRequest::Delete { name } => self.on_update(now_ms, Update::Delete { name }),
            MasterRequest::Get { name } => vec![Effect::Master(MasterResponse::Resp(
                self.songs.get(&name).cloned(),
            ))],
            MasterRequest::RequestFullState => {
                if let Some((&peer, _)) = self.alive(now_ms, None).iter().next() {
                    vec![Effect::Send {
                        to: peer,
                        msg: PeerMessage::FullStateReq,
                    }]
                } else {
                    warn!(id = %self.id, "full state requested but no peer is up");
                    Vec::new()
                }
            }
        }
    }

    /// Coordinator entry point for a new round. Valid only between rounds.
    fn on_update(&mut self, now_ms: u64, update: Update) -> Vec<Effect> {
        if self.coordinator != Some(self.id)
            || !matches!(
                self.phase,
                CommitPhase::CoordWaiting | CommitPhase::CoordCommitted | CommitPhase::CoordAborted
            )
        {
            warn!(id = %self.id, phase = ?self.phase, "update request outside an idle coordinator phase");
            return Vec::new();
        }

        // Coordinator's own vote is no: the round aborts before any vote
        // request goes out, and the master is not told.
        if vote_on(&update, self.id) == Vote::No {
            debug!(id = %self.id, name = update.name(), "aborting locally, url too long");
            self.iter += 1;
            self.phase = CommitPhase::CoordAborted;
            return Vec::new();
        }

        let up_set: BTreeSet<ReplicaId> = self
            .alive(now_ms, Some(Role::Participant))
            .into_keys()
            .collect();
        debug!(id = %self.id, name = update.name(), up = up_set.len(), "opening commit round");

        let mut effects: Vec<Effect> = up_set
            .iter()
            .map(|&to| Effect::Send {
                to,
                msg: PeerMessage::VoteReq(update.clone()),
            })
            .collect();
        effects.push(Effect::Schedule(Timeout::VoteReply { iter: self.iter }));
        self.phase = CommitPhase::CoordInitCommit {
            update,
            up_set,
            votes: BTreeSet::new(),
        };
        effects
    }

    fn on_vote_reply(&mut self, from: ReplicaId, vote: Vote) -> Vec<Effect> {
        let CommitPhase::CoordInitCommit {
            update,
            up_set,
            votes,
        } = &mut self.phase
        else {
            warn!(id = %self.id, %from, "vote reply outside vote collection");
            return Vec::new();
        };
        if !up_set.contains(&from) {
            warn!(id = %self.id, %from, "vote reply from outside the up-set");
            return Vec::new();
        }

        match vote {
            Vote::Yes => {
                votes.insert(from);
                if votes.len() < up_set.len() {
                    return Vec::new();
                }
                let update = update.clone();
                let up_set = up_set.clone();
                let mut effects: Vec<Effect> = up_set
                    .iter()
                    .map(|&to| Effect::Send {
                        to,
                        msg: PeerMessage::PreCommit,
                    })
                    .collect();
                effects.push(Effect::Schedule(Timeout::AckPreCommit { iter: self.iter }));
                self.phase = CommitPhase::CoordCommitable {
                    update,
                    up_set,
                    acks: BTreeSet::new(),
                };
                effects
            }
            Vote::No => {
                debug!(id = %self.id, %from, "vote is no, aborting round");
                // The no-voter aborted itself; everyone else gets told.
                let mut effects: Vec<Effect> = up_set
                    .iter()
                    .filter(|&&peer| peer != from)
                    .map(|&to| Effect::Send {
                        to,
                        msg: PeerMessage::Decision(Decision::Abort),
                    })
                    .collect();
                effects.push(Effect::Master(MasterResponse::AckAbort));
                self.iter += 1;
                self.phase = CommitPhase::CoordAborted;
                self.set_role(Role::Observer, &mut effects);
                effects
            }
        }
    }

    fn on_ack_pre_commit(&mut self, from: ReplicaId) -> Vec<Effect> {
        let CommitPhase::CoordCommitable {
            update,
            up_set,
            acks,
        } = &mut self.phase
        else {
            warn!(id = %self.id, %from, "pre-commit ack outside ack collection");
            return Vec::new();
        };
        if !up_set.contains(&from) {
            warn!(id = %self.id, %from, "pre-commit ack from outside the up-set");
            return Vec::new();
        }

        acks.insert(from);
        // Completion is checked after the insert: the round closes on the
        // final ack.
        if acks.len() < up_set.len() {
            return Vec::new();
        }
        let update = update.clone();
        let targets = acks.clone();
        self.finish_commit(&update, &targets)
    }

    fn on_vote_req(&mut self, now_ms: u64, from: ReplicaId, update: Update) -> Vec<Effect> {
        if self.coordinator == Some(self.id) {
            warn!(id = %self.id, %from, "vote request while coordinating");
            return Vec::new();
        }
        let Some(coordinator) = self.coordinator else {
            error!(id = %self.id, %from, "vote request with no known coordinator");
            return vec![Effect::Fatal("vote request with no known coordinator")];
        };

        let vote = vote_on(&update, self.id);
        let mut effects = vec![Effect::Send {
            to: coordinator,
            msg: PeerMessage::VoteReply(vote),
        }];
        match vote {
            Vote::Yes => {
                let up_set = self.alive(now_ms, None).into_keys().collect();
                effects.push(Effect::Schedule(Timeout::PreCommit { iter: self.iter }));
                self.phase = CommitPhase::ParticipantInitCommit { update, up_set };
            }
            Vote::No => {
                debug!(id = %self.id, name = update.name(), "voting no");
                self.iter += 1;
                self.phase = CommitPhase::ParticipantAborted;
                self.set_role(Role::Observer, &mut effects);
            }
        }
        effects
    }

    fn on_pre_commit(&mut self, from: ReplicaId) -> Vec<Effect> {
        match &self.phase {
            CommitPhase::ParticipantInitCommit { update, up_set } => {
                let update = update.clone();
                let up_set = up_set.clone();
                self.coordinator = Some(from);
                self.phase = CommitPhase::ParticipantCommitable { update, up_set };
                vec![
                    Effect::Send {
                        to: from,
                        msg: PeerMessage::AckPreCommit,
                    },
                    Effect::Schedule(Timeout::Commit { iter: self.iter }),
                ]
            }
            // A re-sent pre-commit from a recovering coordinator: ack again.
            CommitPhase::ParticipantCommitable { .. } => {
                self.coordinator = Some(from);
                vec![
                    Effect::Send {
                        to: from,
                        msg: PeerMessage::AckPreCommit,
                    },
                    Effect::Schedule(Timeout::Commit { iter: self.iter }),
                ]
            }
            phase => {
                warn!(id = %self.id, %from, ?phase, "pre-commit outside a voted round");
                Vec::new()
            }
        }
    }

    fn on_decision(&mut self, from: ReplicaId, decision: Decision) -> Vec<Effect> {
        match (decision, &self.phase) {
            (Decision::Commit, CommitPhase::ParticipantCommitable { update, .. }) => {
                let update = update.clone();
                self.apply(&update);
                self.iter += 1;
                self.phase = CommitPhase::ParticipantCommitted;
                let mut effects = Vec::new();
                self.set_role(Role::Observer, &mut effects);
                effects
            }
            (Decision::Commit, CommitPhase::ParticipantCommitted | CommitPhase::CoordCommitted)
            | (Decision::Abort, CommitPhase::ParticipantAborted | CommitPhase::CoordAborted) => {
                trace!(id = %self.id, %from, ?decision, "duplicate decision");
                Vec::new()
            }
            (Decision::Abort, CommitPhase::ParticipantCommitted | CommitPhase::CoordCommitted) => {
                error!(id = %self.id, %from, "abort received after commit");
                Vec::new()
            }
            (Decision::Abort, _) => {
                self.iter += 1;
                self.phase = CommitPhase::ParticipantAborted;
                let mut effects = Vec::new();
                self.set_role(Role::Observer, &mut effects);
                effects
            }
            (Decision::Commit, phase) => {
                warn!(id = %self.id, %from, ?phase, "commit decision outside a commitable round");
                Vec::new()
            }
        }
    }

    fn on_state_reply(&mut self, from: ReplicaId, state: CommitState) -> Vec<Effect> {
        let Some(termination) = &mut self.termination else {
            warn!(id = %self.id, %from, "state reply without a pending termination");
            return Vec::new();
        };
        if !termination.expected.contains(&from) {
            warn!(id = %self.id, %from, "state reply from an unpolled replica");
            return Vec::new();
        }
        termination.states.insert(from, state);
        Vec::new()
    }

    fn on_song_list(&mut self, from: ReplicaId, songs: SongList) -> Vec<Effect> {
        if self.phase.in_flight_update().is_some() {
            warn!(id = %self.id, %from, "songlist snapshot during an open round");
            return Vec::new();
        }
        debug!(id = %self.id, %from, entries = songs.len(), "adopting songlist snapshot");
        self.songs = songs;
        Vec::new()
    }

    fn on_timeout(&mut self, now_ms: u64, timeout: Timeout) -> Vec<Effect> {
        if let Some(source_iter) = timeout.source_iter()
            && source_iter != self.iter
        {
            trace!(id = %self.id, ?timeout, iter = self.iter, "stale timeout");
            return Vec::new();
        }

        match timeout {
            Timeout::DetermineCoordinator => self.on_determine_coordinator(now_ms),
            Timeout::VoteReply { .. } => self.on_vote_reply_timeout(),
            Timeout::AckPreCommit { .. } => self.on_ack_pre_commit_timeout(),
            Timeout::PreCommit { .. } | Timeout::Commit { .. } => {
                self.on_wait_timeout(now_ms, timeout)
            }
            Timeout::StateReq { .. } => self.on_state_req_timeout(now_ms),
            Timeout::StateReqReply { .. } => self.on_state_req_reply_timeout(),
        }
    }

    /// Bootstrap: if nobody coordinates and no round appears to be in
    /// progress, this replica promotes itself.
    fn on_determine_coordinator(&mut self, now_ms: u64) -> Vec<Effect> {
        if self.coordinator.is_some() || !self.alive(now_ms, Some(Role::Participant)).is_empty() {
            return Vec::new();
        }
        debug!(id = %self.id, "no coordinator observed, taking over");
        self.coordinator = Some(self.id);
        self.phase = CommitPhase::CoordWaiting;
        let mut effects = Vec::new();
        self.set_role(Role::Coordinator, &mut effects);
        effects.push(Effect::Master(MasterResponse::Coordinator(self.id)));
        effects
    }

    fn on_vote_reply_timeout(&mut self) -> Vec<Effect> {
        let CommitPhase::CoordInitCommit {
            update,
            up_set,
            votes,
        } = &self.phase
        else {
            return Vec::new();
        };

        if votes.len() == up_set.len() {
            if up_set.is_empty() {
                // Sole live replica: nothing to wait for, commit locally.
                let update = update.clone();
                return self.finish_commit(&update, &BTreeSet::new());
            }
            // All votes arrived concurrently with the timer; the reply
            // handler already advanced the phase or is about to.
            return Vec::new();
        }

        debug!(id = %self.id, votes = votes.len(), up = up_set.len(), "votes missing, aborting round");
        let mut effects: Vec<Effect> = up_set
            .iter()
            .map(|&to| Effect::Send {
                to,
                msg: PeerMessage::Decision(Decision::Abort),
            })
            .collect();
        effects.push(Effect::Master(MasterResponse::AckAbort));
        self.iter += 1;
        self.phase = CommitPhase::CoordAborted;
        self.set_role(Role::Observer, &mut effects);
        effects
    }

    fn on_ack_pre_commit_timeout(&mut self) -> Vec<Effect> {
        let CommitPhase::CoordCommitable {
            update,
            up_set,
            acks,
        } = &self.phase
        else {
            return Vec::new();
        };
        if up_set.is_empty() {
            // Sole live replica: nothing to wait for, commit locally.
            let update = update.clone();
            return self.finish_commit(&update, &BTreeSet::new());
        }
        if acks.len() == up_set.len() {
            return Vec::new();
        }
        // Commit proceeds with exactly the replicas that acknowledged.
        debug!(id = %self.id, acks = acks.len(), up = up_set.len(), "acks missing, committing with responders");
        let update = update.clone();
        let targets = acks.clone();
        self.finish_commit(&update, &targets)
    }

    /// A waiting participant's timer fired. If the coordinator is still up
    /// the timer is re-armed; otherwise the election runs.
    fn on_wait_timeout(&mut self, now_ms: u64, timeout: Timeout) -> Vec<Effect> {
        let waiting = matches!(
            (timeout, &self.phase),
            (
                Timeout::PreCommit { .. },
                CommitPhase::ParticipantInitCommit { .. }
            ) | (
                Timeout::Commit { .. },
                CommitPhase::ParticipantCommitable { .. }
            )
        );
        if !waiting {
            return Vec::new();
        }
        if self.coordinator_alive(now_ms) {
            return vec![Effect::Schedule(timeout)];
        }
        debug!(id = %self.id, coordinator = ?self.coordinator, "coordinator lost, electing");
        self.run_election(now_ms)
    }

    fn on_state_req_timeout(&mut self, now_ms: u64) -> Vec<Effect> {
        if self.coordinator == Some(self.id) {
            return Vec::new();
        }
        if self.coordinator_alive(now_ms) {
            return vec![Effect::Schedule(Timeout::StateReq { iter: self.iter })];
        }
        debug!(id = %self.id, coordinator = ?self.coordinator, "elected coordinator lost, re-electing");
        self.run_election(now_ms)
    }

    /// Lowest live id among the participants (and this replica) wins.
    fn run_election(&mut self, now_ms: u64) -> Vec<Effect> {
        let live: BTreeSet<ReplicaId> = self
            .alive(now_ms, Some(Role::Participant))
            .into_keys()
            .collect();
        let winner = live.iter().copied().fold(self.id, Ord::min);
        let mut effects = Vec::new();

        if winner == self.id {
            debug!(id = %self.id, polling = live.len(), "won election, collecting states");
            self.coordinator = Some(self.id);
            self.set_role(Role::Coordinator, &mut effects);
            effects.push(Effect::Master(MasterResponse::Coordinator(self.id)));
            for &peer in &live {
                effects.push(Effect::Send {
                    to: peer,
                    msg: PeerMessage::StateReq,
                });
            }
            effects.push(Effect::Schedule(Timeout::StateReqReply { iter: self.iter }));
            self.termination = Some(Termination {
                expected: live,
                states: BTreeMap::new(),
            });
        } else {
            debug!(id = %self.id, %winner, "adopting election winner");
            self.coordinator = Some(winner);
            effects.push(Effect::Schedule(Timeout::StateReq { iter: self.iter }));
        }
        effects
    }

    /// Termination decision over the collected states plus this replica's
    /// own, in precedence order: any committed wins, then any aborted, then
    /// all-committable commits, and a mix containing uncertain replicas
    /// re-runs the pre-commit phase.
    fn on_state_req_reply_timeout(&mut self) -> Vec<Effect> {
        let Some(termination) = self.termination.take() else {
            return Vec::new();
        };
        let responders: BTreeSet<ReplicaId> = termination.states.keys().copied().collect();
        let mut states: Vec<CommitState> = termination.states.into_values().collect();
        states.push(self.phase.commit_state());

        if states.contains(&CommitState::Committed) {
            let update = self.phase.in_flight_update().cloned();
            return self.finish_termination_commit(update.as_ref(), &responders);
        }
        if states.contains(&CommitState::Aborted) {
            debug!(id = %self.id, "termination: some replica aborted");
            let mut effects: Vec<Effect> = responders
                .iter()
                .map(|&to| Effect::Send {
                    to,
                    msg: PeerMessage::Decision(Decision::Abort),
                })
                .collect();
            effects.push(Effect::Master(MasterResponse::AckAbort));
            self.iter += 1;
            self.phase = CommitPhase::CoordAborted;
            self.set_role(Role::Observer, &mut effects);
            return effects;
        }
        if states.iter().all(|&s| s == CommitState::Committable) {
            let update = self.phase.in_flight_update().cloned();
            return self.finish_termination_commit(update.as_ref(), &responders);
        }

        // Some replica is still uncertain: re-run pre-commit, then commit.
        let Some(update) = self.phase.in_flight_update().cloned() else {
            error!(id = %self.id, phase = ?self.phase, "termination with no update to finish");
            return Vec::new();
        };
        if responders.is_empty() {
            // Sole uncertain survivor: no one left to pre-commit.
            debug!(id = %self.id, "termination: committing alone");
            return self.finish_commit(&update, &BTreeSet::new());
        }
        debug!(id = %self.id, polled = responders.len(), "termination: re-running pre-commit");
        let mut effects: Vec<Effect> = responders
            .iter()
            .map(|&to| Effect::Send {
                to,
                msg: PeerMessage::PreCommit,
            })
            .collect();
        effects.push(Effect::Schedule(Timeout::AckPreCommit { iter: self.iter }));
        self.phase = CommitPhase::CoordCommitable {
            update,
            up_set: responders,
            acks: BTreeSet::new(),
        };
        effects
    }

    fn finish_termination_commit(
        &mut self,
        update: Option<&Update>,
        targets: &BTreeSet<ReplicaId>,
    ) -> Vec<Effect> {
        debug!(id = %self.id, notified = targets.len(), "termination: committing");
        match update {
            Some(update) => self.finish_commit(update, targets),
            None => {
                // Nothing in flight locally (the decision came entirely from
                // peers); relay it without touching the songlist.
                let mut effects: Vec<Effect> = targets
                    .iter()
                    .map(|&to| Effect::Send {
                        to,
                        msg: PeerMessage::Decision(Decision::Commit),
                    })
                    .collect();
                effects.push(Effect::Master(MasterResponse::AckCommit));
                self.iter += 1;
                self.phase = CommitPhase::CoordCommitted;
                effects
            }
        }
    }

    /// Close the round on the coordinator: tell `targets`, tell the master,
    /// mutate the songlist, bump the iteration.
    fn finish_commit(&mut self, update: &Update, targets: &BTreeSet<ReplicaId>) -> Vec<Effect> {
        let mut effects: Vec<Effect> = targets
            .iter()
            .map(|&to| Effect::Send {
                to,
                msg: PeerMessage::Decision(Decision::Commit),
            })
            .collect();
        effects.push(Effect::Master(MasterResponse::AckCommit));
        self.apply(update);
        self.iter += 1;
        self.phase = CommitPhase::CoordCommitted;
        effects
    }

    fn apply(&mut self, update: &Update) {
        match update {
            Update::Add { name, url } => {
                self.songs.insert(name.clone(), url.clone());
            }
            Update::Delete { name } => {
                // Deleting a missing key is a no-op.
                self.songs.remove(name);
            }
        }
    }

    fn set_role(&mut self, role: Role, effects: &mut Vec<Effect>) {
        if self.role != role {
            self.role = role;
            effects.push(Effect::Announce(role));
        }
    }
}
