//! The room actor: one mailbox, one `RoomCore`, effects interpreted against
//! tokio.
//!
//! The mailbox serializes peer lines, master requests and self-addressed
//! timers; each is processed to completion before the next is dequeued, so
//! the core needs no locking. Timers are spawned sleeps that post back into
//! the mailbox and are never cancelled — the core discards the stale ones by
//! their iteration tag.

use songlist_core::{
    CommitPhase, Effect, Input, MasterRequest, MasterResponse, ReplicaId, Role, RoomConfig,
    RoomCore, SongList, Timeout, wire,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cluster::Envelope;
use crate::heartbeat;

/// Messages a room's mailbox accepts.
#[derive(Debug)]
pub enum RoomMsg {
    /// A wire line from a peer.
    Line { from: ReplicaId, line: String },
    /// Attach the master driver's response channel and deliver `JoinMaster`.
    JoinMaster {
        responses: mpsc::UnboundedSender<MasterResponse>,
    },
    /// A request from the master driver.
    Master(MasterRequest),
    /// A timer posted back by the scheduler.
    Timeout(Timeout),
    /// Snapshot of the room, for tests and the REPL.
    Status { reply: oneshot::Sender<RoomStatus> },
}

/// Point-in-time view of a room.
#[derive(Clone, Debug)]
pub struct RoomStatus {
    pub id: ReplicaId,
    pub role: Role,
    pub coordinator: Option<ReplicaId>,
    pub phase: CommitPhase,
    pub iter: u64,
    pub songs: SongList,
}

pub(crate) struct RoomActor {
    core: RoomCore,
    config: RoomConfig,
    started: Instant,
    mailbox: mpsc::Receiver<RoomMsg>,
    self_tx: mpsc::Sender<RoomMsg>,
    router_tx: mpsc::UnboundedSender<Envelope>,
    master_tx: Option<mpsc::UnboundedSender<MasterResponse>>,
    beat_tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RoomActor {
    pub(crate) fn new(
        core: RoomCore,
        config: RoomConfig,
        mailbox: mpsc::Receiver<RoomMsg>,
        self_tx: mpsc::Sender<RoomMsg>,
        router_tx: mpsc::UnboundedSender<Envelope>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            core,
            config,
            started: Instant::now(),
            mailbox,
            self_tx,
            router_tx,
            master_tx: None,
            beat_tasks: Vec::new(),
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(id = %self.core.id(), "room started");
        self.restart_beats();
        let startup = self.core.startup();
        if self.interpret(startup) {
            return;
        }

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    debug!(id = %self.core.id(), "room cancelled");
                    break;
                }

                msg = self.mailbox.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle_msg(msg) {
                        break;
                    }
                }
            }
        }

        for task in self.beat_tasks.drain(..) {
            task.abort();
        }
    }

    fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    /// Returns true if the actor must stop.
    fn handle_msg(&mut self, msg: RoomMsg) -> bool {
        let now_ms = self.now_ms();
        let effects = match msg {
            RoomMsg::Line { from, line } => match wire::parse_peer(&line) {
                Ok(msg) => self.core.handle(now_ms, Input::Peer { from, msg }),
                Err(e) => {
                    warn!(id = %self.core.id(), %from, %e, %line, "unparseable line");
                    Vec::new()
                }
            },
            RoomMsg::JoinMaster { responses } => {
                self.master_tx = Some(responses);
                self.core.handle(now_ms, Input::Master(MasterRequest::JoinMaster))
            }
            RoomMsg::Master(req) => self.core.handle(now_ms, Input::Master(req)),
            RoomMsg::Timeout(timeout) => self.core.handle(now_ms, Input::Timeout(timeout)),
            RoomMsg::Status { reply } => {
                let _ = reply.send(RoomStatus {
                    id: self.core.id(),
                    role: self.core.role(),
                    coordinator: self.core.coordinator(),
                    phase: self.core.phase().clone(),
                    iter: self.core.iter(),
                    songs: self.core.songs().clone(),
                });
                Vec::new()
            }
        };
        self.interpret(effects)
    }

    /// Returns true if the actor must stop.
    fn interpret(&mut self, effects: Vec<Effect>) -> bool {
        for effect in effects {
            match effect {
                Effect::Send { to, msg } => {
                    let envelope = Envelope {
                        from: self.core.id(),
                        to,
                        line: wire::encode_peer(&msg),
                    };
                    let _ = self.router_tx.send(envelope);
                }
                Effect::Master(resp) => match &self.master_tx {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => debug!(id = %self.core.id(), ?resp, "no master attached, dropping response"),
                },
                Effect::Schedule(timeout) => self.schedule(timeout),
                Effect::Announce(role) => {
                    debug!(id = %self.core.id(), role = role.as_str(), "announcing role");
                    self.restart_beats();
                }
                Effect::Fatal(reason) => {
                    error!(id = %self.core.id(), reason, "room cannot proceed");
                    return true;
                }
            }
        }
        false
    }

    fn schedule(&self, timeout: Timeout) {
        let delay = match timeout {
            Timeout::DetermineCoordinator => self.config.determine_coordinator_after,
            _ => self.config.alive_threshold,
        };
        let self_tx = self.self_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = self_tx.send(RoomMsg::Timeout(timeout)).await;
                }
            }
        });
    }

    fn restart_beats(&mut self) {
        for task in self.beat_tasks.drain(..) {
            task.abort();
        }
        self.beat_tasks = heartbeat::spawn_beat_tasks(
            self.core.id(),
            self.core.role(),
            self.core.actors(),
            self.config.beat_rate,
            &self.router_tx,
            &self.cancel,
        );
    }
}
