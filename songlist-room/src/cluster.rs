//! In-process cluster: the replica directory, the line router, and failure
//! controls.
//!
//! Rooms never hold references to each other; they hand encoded wire lines to
//! the router, which resolves the destination id through its directory. Lines
//! to killed or unknown replicas are dropped, which is exactly what a dead
//! peer looks like to the protocol. Per sender-recipient pair, delivery is in
//! send order.

use std::collections::BTreeMap;
use std::fmt;

use error_stack::Report;
use songlist_core::{MasterRequest, MasterResponse, ReplicaId, RoomConfig, RoomCore};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::actor::{RoomActor, RoomMsg, RoomStatus};

const MAILBOX_DEPTH: usize = 256;

/// Marker error for cluster operations. Use
/// `error_stack::Report<ClusterError>` with context attachments for details.
#[derive(Debug)]
pub struct ClusterError;

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cluster operation failed")
    }
}

impl std::error::Error for ClusterError {}

/// One wire line in flight between two replicas.
#[derive(Clone, Debug)]
pub(crate) struct Envelope {
    pub(crate) from: ReplicaId,
    pub(crate) to: ReplicaId,
    pub(crate) line: String,
}

enum RouterControl {
    Register {
        id: ReplicaId,
        tx: mpsc::Sender<RoomMsg>,
    },
    Deregister {
        id: ReplicaId,
    },
    Block {
        from: ReplicaId,
        to: Option<ReplicaId>,
        prefix: String,
    },
}

struct RoomHandle {
    tx: mpsc::Sender<RoomMsg>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Directory of local rooms plus the router between them.
pub struct LocalCluster {
    config: RoomConfig,
    roster: Vec<ReplicaId>,
    rooms: BTreeMap<ReplicaId, RoomHandle>,
    router_tx: mpsc::UnboundedSender<Envelope>,
    control_tx: mpsc::UnboundedSender<RouterControl>,
    router_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LocalCluster {
    /// Set up the router for a fixed roster. No rooms are started yet; each
    /// replica joins with [`LocalCluster::spawn`].
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = u32>, config: RoomConfig) -> Self {
        let roster: Vec<ReplicaId> = ids.into_iter().map(ReplicaId).collect();
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let router_task = tokio::spawn(route(router_rx, control_rx, cancel.clone()));
        Self {
            config,
            roster,
            rooms: BTreeMap::new(),
            router_tx,
            control_tx,
            router_task,
            cancel,
        }
    }

    /// The full roster, whether or not each replica is currently running.
    #[must_use]
    pub fn roster(&self) -> &[ReplicaId] {
        &self.roster
    }

    /// Start the room for `id`.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not on the roster or is already running.
    pub fn spawn(&mut self, id: u32) -> Result<(), Report<ClusterError>> {
        let id = ReplicaId(id);
        if !self.roster.contains(&id) {
            return Err(Report::new(ClusterError).attach(format!("replica {id} not on the roster")));
        }
        if self.rooms.contains_key(&id) {
            return Err(Report::new(ClusterError).attach(format!("replica {id} already running")));
        }

        let (tx, mailbox) = mpsc::channel(MAILBOX_DEPTH);
        let cancel = self.cancel.child_token();
        let core = RoomCore::new(id, self.roster.iter().copied(), &self.config);
        let actor = RoomActor::new(
            core,
            self.config,
            mailbox,
            tx.clone(),
            self.router_tx.clone(),
            cancel.clone(),
        );

        let _ = self.control_tx.send(RouterControl::Register {
            id,
            tx: tx.clone(),
        });
        let task = tokio::spawn(actor.run());
        self.rooms.insert(id, RoomHandle { tx, cancel, task });
        debug!(%id, "replica spawned");
        Ok(())
    }

    /// Kill a running replica: its mailbox loop, heartbeats and pending
    /// timers all stop, and the router drops lines addressed to it.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not running.
    pub fn kill(&mut self, id: u32) -> Result<(), Report<ClusterError>> {
        let id = ReplicaId(id);
        let handle = self
            .rooms
            .remove(&id)
            .ok_or_else(|| Report::new(ClusterError).attach(format!("replica {id} not running")))?;
        handle.cancel.cancel();
        handle.task.abort();
        let _ = self.control_tx.send(RouterControl::Deregister { id });
        debug!(%id, "replica killed");
        Ok(())
    }

    /// Drop every line from `from` (optionally only to `to`) whose text
    /// starts with `prefix`. Test control for wedging a replica mid-round.
    pub fn block_lines(&self, from: u32, to: Option<u32>, prefix: &str) {
        let _ = self.control_tx.send(RouterControl::Block {
            from: ReplicaId(from),
            to: to.map(ReplicaId),
            prefix: prefix.to_string(),
        });
    }

    /// Attach a master response channel to `id` and deliver `JoinMaster`.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not running.
    pub async fn join_master(
        &self,
        id: u32,
        responses: mpsc::UnboundedSender<MasterResponse>,
    ) -> Result<(), Report<ClusterError>> {
        self.send(id, RoomMsg::JoinMaster { responses }).await
    }

    /// Deliver a master request to `id`.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not running.
    pub async fn master(&self, id: u32, req: MasterRequest) -> Result<(), Report<ClusterError>> {
        self.send(id, RoomMsg::Master(req)).await
    }

    /// Snapshot the room state of `id`.
    ///
    /// # Errors
    ///
    /// Fails when `id` is not running or stopped before replying.
    pub async fn status(&self, id: u32) -> Result<RoomStatus, Report<ClusterError>> {
        let (reply, rx) = oneshot::channel();
        self.send(id, RoomMsg::Status { reply }).await?;
        rx.await
            .map_err(|_| Report::new(ClusterError).attach(format!("replica {id} stopped")))
    }

    /// Ids of the replicas currently running.
    #[must_use]
    pub fn running(&self) -> Vec<ReplicaId> {
        self.rooms.keys().copied().collect()
    }

    /// Stop every room and the router.
    pub fn shutdown(self) {
        self.cancel.cancel();
        self.router_task.abort();
        for handle in self.rooms.into_values() {
            handle.task.abort();
        }
    }

    async fn send(&self, id: u32, msg: RoomMsg) -> Result<(), Report<ClusterError>> {
        let handle = self
            .rooms
            .get(&ReplicaId(id))
            .ok_or_else(|| Report::new(ClusterError).attach(format!("replica {id} not running")))?;
        handle
            .tx
            .send(msg)
            .await
            .map_err(|_| Report::new(ClusterError).attach(format!("replica {id} stopped")))
    }
}

async fn route(
    mut lines: mpsc::UnboundedReceiver<Envelope>,
    mut control: mpsc::UnboundedReceiver<RouterControl>,
    cancel: CancellationToken,
) {
    let mut rooms: BTreeMap<ReplicaId, mpsc::Sender<RoomMsg>> = BTreeMap::new();
    let mut blocked: Vec<(ReplicaId, Option<ReplicaId>, String)> = Vec::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            Some(ctrl) = control.recv() => match ctrl {
                RouterControl::Register { id, tx } => {
                    rooms.insert(id, tx);
                }
                RouterControl::Deregister { id } => {
                    rooms.remove(&id);
                }
                RouterControl::Block { from, to, prefix } => {
                    blocked.push((from, to, prefix));
                }
            },

            Some(envelope) = lines.recv() => {
                let dropped = blocked.iter().any(|(from, to, prefix)| {
                    *from == envelope.from
                        && to.is_none_or(|t| t == envelope.to)
                        && envelope.line.starts_with(prefix.as_str())
                });
                if dropped {
                    trace!(from = %envelope.from, to = %envelope.to, line = %envelope.line, "line blocked");
                    continue;
                }
                let Some(tx) = rooms.get(&envelope.to) else {
                    trace!(from = %envelope.from, to = %envelope.to, "line to absent replica");
                    continue;
                };
                let msg = RoomMsg::Line {
                    from: envelope.from,
                    line: envelope.line,
                };
                if tx.send(msg).await.is_err() {
                    rooms.remove(&envelope.to);
                }
            }
        }
    }
}
