//! Periodic heartbeat announcements.
//!
//! One interval task per peer, all broadcasting the same `<role> <id>` line.
//! Whenever the announced role changes the whole schedule is torn down and
//! rebuilt; the handles returned here are those cancellation points.

use std::collections::BTreeSet;
use std::time::Duration;

use songlist_core::{PeerMessage, ReplicaId, Role, wire};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::Envelope;

pub(crate) fn spawn_beat_tasks(
    id: ReplicaId,
    role: Role,
    peers: &BTreeSet<ReplicaId>,
    beat_rate: Duration,
    router_tx: &mpsc::UnboundedSender<Envelope>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let line = wire::encode_peer(&PeerMessage::Heartbeat { role, id });
    peers
        .iter()
        .map(|&to| {
            let line = line.clone();
            let router_tx = router_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(beat_rate);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;

                        () = cancel.cancelled() => break,

                        _ = interval.tick() => {
                            let envelope = Envelope {
                                from: id,
                                to,
                                line: line.clone(),
                            };
                            if router_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        })
        .collect()
}
