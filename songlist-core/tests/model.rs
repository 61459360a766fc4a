//! Stateright model checker tests for the 3PC room.
//!
//! The actors wrap the production `RoomCore` directly, so the checker
//! explores the actual transition logic: every interleaving of vote replies,
//! pre-commits, acknowledgements and decisions over an ordered network.
//! Timers (and therefore aborted-on-timeout paths and elections) are outside
//! the model; those paths are covered by the deterministic harness in
//! `termination.rs`.

use std::borrow::Cow;
use std::sync::Arc;

use songlist_core::{
    CommitPhase, Effect, Input, MasterRequest, PeerMessage, ReplicaId, Role, RoomConfig, RoomCore,
    Timeout,
};
use stateright::actor::{Actor, ActorModel, Id, Network, Out};
use stateright::{Checker, Model};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct RoomActor {
    id: u32,
    all: Vec<u32>,
    coordinator: u32,
    /// Injected by the master into the coordinator at startup.
    update: Option<(&'static str, &'static str)>,
}

fn replica_of(src: Id) -> ReplicaId {
    ReplicaId(u32::try_from(usize::from(src)).expect("model ids fit in u32"))
}

fn apply_effects(effects: Vec<Effect>, o: &mut Out<RoomActor>) {
    for effect in effects {
        match effect {
            Effect::Send { to, msg } => o.send(Id::from(to.0 as usize), msg),
            // Timers, role announcements and master acks are out of model.
            Effect::Schedule(_) | Effect::Announce(_) | Effect::Master(_) => {}
            Effect::Fatal(reason) => panic!("fatal effect in model: {reason}"),
        }
    }
}

impl Actor for RoomActor {
    type Msg = PeerMessage;
    type State = RoomCore;
    type Timer = ();
    type Storage = ();
    type Random = ();

    fn on_start(&self, _id: Id, _storage: &Option<Self::Storage>, o: &mut Out<Self>) -> Self::State {
        let mut core = RoomCore::new(
            ReplicaId(self.id),
            self.all.iter().map(|&id| ReplicaId(id)),
            &RoomConfig::default(),
        );
        core.handle(0, Input::Master(MasterRequest::JoinMaster));

        if self.id == self.coordinator {
            // Bootstrap before any participant heartbeat is visible.
            let effects = core.handle(0, Input::Timeout(Timeout::DetermineCoordinator));
            apply_effects(effects, o);
        }

        // Seed the failure detector: every peer is alive at time zero.
        for &peer in self.all.iter().filter(|&&peer| peer != self.id) {
            let role = if peer == self.coordinator {
                Role::Coordinator
            } else {
                Role::Participant
            };
            let effects = core.handle(
                0,
                Input::Peer {
                    from: ReplicaId(peer),
                    msg: PeerMessage::Heartbeat {
                        role,
                        id: ReplicaId(peer),
                    },
                },
            );
            apply_effects(effects, o);
        }

        if let Some((name, url)) = self.update
            && self.id == self.coordinator
        {
            let effects = core.handle(
                0,
                Input::Master(MasterRequest::Add {
                    name: name.to_string(),
                    url: url.to_string(),
                }),
            );
            apply_effects(effects, o);
        }

        core
    }

    fn on_msg(
        &self,
        _id: Id,
        state: &mut Cow<Self::State>,
        src: Id,
        msg: Self::Msg,
        o: &mut Out<Self>,
    ) {
        let mut core = state.as_ref().clone();
        let effects = core.handle(
            0,
            Input::Peer {
                from: replica_of(src),
                msg,
            },
        );
        *state.to_mut() = core;
        apply_effects(effects, o);
    }
}

fn committed(core: &RoomCore) -> bool {
    matches!(
        core.phase(),
        CommitPhase::CoordCommitted | CommitPhase::ParticipantCommitted
    )
}

fn aborted(core: &RoomCore) -> bool {
    matches!(
        core.phase(),
        CommitPhase::CoordAborted | CommitPhase::ParticipantAborted
    )
}

fn room_model(
    ids: &[u32],
    coordinator: u32,
    update: (&'static str, &'static str),
) -> ActorModel<RoomActor, (), ()> {
    let mut model = ActorModel::new((), ()).init_network(Network::new_ordered([]));
    for &id in ids {
        model = model.actor(RoomActor {
            id,
            all: ids.to_vec(),
            coordinator,
            update: (id == coordinator).then_some(update),
        });
    }

    model
        .property(stateright::Expectation::Always, "agreement", |_, state| {
            let lists: Vec<_> = state
                .actor_states
                .iter()
                .filter_map(|s: &Arc<RoomCore>| committed(s).then(|| s.songs()))
                .collect();
            lists.windows(2).all(|pair| pair[0] == pair[1])
        })
        .property(
            stateright::Expectation::Always,
            "no split decision",
            |_, state| {
                let any_committed = state.actor_states.iter().any(|s: &Arc<RoomCore>| committed(s));
                let any_aborted = state.actor_states.iter().any(|s: &Arc<RoomCore>| aborted(s));
                !(any_committed && any_aborted)
            },
        )
}

#[test]
fn check_unanimous_round_commits() {
    // Actor index must equal replica id for Id routing, so ids are 0..n.
    let model = room_model(&[0, 1, 2], 0, ("x", "ok")).property(
        stateright::Expectation::Eventually,
        "validity",
        |_, state| {
            state.actor_states.iter().all(|s: &Arc<RoomCore>| {
                committed(s) && s.songs().get("x").map(String::as_str) == Some("ok")
            })
        },
    );

    let checker = model.checker().threads(num_cpus::get()).spawn_bfs().join();
    checker.assert_properties();
    println!(
        "unanimous round: {} states explored",
        checker.unique_state_count()
    );
}

#[test]
fn check_rejected_round_never_commits() {
    // Six-byte URL: passes the coordinator (id 2) and participant 1, fails
    // participant 0, which votes no.
    let model = room_model(&[0, 1, 2], 2, ("y", "sixchr")).property(
        stateright::Expectation::Always,
        "no commit",
        |_, state| !state.actor_states.iter().any(|s: &Arc<RoomCore>| committed(s)),
    );

    let checker = model.checker().threads(num_cpus::get()).spawn_bfs().join();
    checker.assert_properties();
    println!(
        "rejected round: {} states explored",
        checker.unique_state_count()
    );
}
