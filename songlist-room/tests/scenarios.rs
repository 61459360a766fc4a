//! End-to-end scenarios against the real actor runtime. Tokio's paused clock
//! drives heartbeats, timeouts and elections deterministically, and the
//! cluster's line filters wedge a replica mid-round where a scenario kills
//! the coordinator between phases.

use std::time::Duration;

use songlist_core::{CommitPhase, MasterRequest, MasterResponse, ReplicaId, Role, RoomConfig};
use songlist_room::LocalCluster;
use tokio::sync::mpsc;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("songlist_core=debug,songlist_room=debug")
        }))
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

fn test_config() -> RoomConfig {
    RoomConfig {
        beat_rate: Duration::from_millis(50),
        alive_threshold: Duration::from_millis(400),
        determine_coordinator_after: Duration::from_millis(500),
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn add(name: &str, url: &str) -> MasterRequest {
    MasterRequest::Add {
        name: name.to_string(),
        url: url.to_string(),
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<MasterResponse>) -> Vec<MasterResponse> {
    let mut out = Vec::new();
    while let Ok(resp) = rx.try_recv() {
        out.push(resp);
    }
    out
}

/// Spawn `ids[0]`, wait for it to bootstrap as coordinator, then spawn the
/// rest and let heartbeats propagate. The master joins every replica.
async fn boot(ids: &[u32]) -> (LocalCluster, mpsc::UnboundedReceiver<MasterResponse>) {
    let mut cluster = LocalCluster::new(ids.iter().copied(), test_config());
    let (master_tx, mut master_rx) = mpsc::unbounded_channel();

    cluster.spawn(ids[0]).unwrap();
    cluster.join_master(ids[0], master_tx.clone()).await.unwrap();
    sleep_ms(600).await;
    assert_eq!(
        drain(&mut master_rx),
        vec![MasterResponse::Coordinator(ReplicaId(ids[0]))]
    );

    for &id in &ids[1..] {
        cluster.spawn(id).unwrap();
        cluster.join_master(id, master_tx.clone()).await.unwrap();
    }
    sleep_ms(200).await;
    (cluster, master_rx)
}

#[tokio::test(start_paused = true)]
async fn lone_coordinator_commits() {
    let _guard = init_tracing();
    let (cluster, mut master_rx) = boot(&[0]).await;

    cluster.master(0, add("a", "short")).await.unwrap();
    // The vote-reply timer fires with an empty up-set and commits locally.
    sleep_ms(500).await;

    assert_eq!(drain(&mut master_rx), vec![MasterResponse::AckCommit]);
    let status = cluster.status(0).await.unwrap();
    assert_eq!(status.phase, CommitPhase::CoordCommitted);
    assert_eq!(status.songs.get("a").map(String::as_str), Some("short"));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn overlong_url_aborts_silently() {
    let _guard = init_tracing();
    let (cluster, mut master_rx) = boot(&[0]).await;

    // 10 bytes > 0 + 5: the coordinator's own vote fails and the master
    // hears nothing.
    cluster.master(0, add("a", "toolongurl")).await.unwrap();
    sleep_ms(500).await;

    assert_eq!(drain(&mut master_rx), Vec::new());
    let status = cluster.status(0).await.unwrap();
    assert_eq!(status.phase, CommitPhase::CoordAborted);
    assert!(status.songs.is_empty());
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn two_replicas_commit_the_same_list() {
    let _guard = init_tracing();
    let (cluster, mut master_rx) = boot(&[0, 1]).await;

    cluster.master(0, add("x", "ok")).await.unwrap();
    sleep_ms(100).await;

    // Exactly one ack for the round.
    assert_eq!(drain(&mut master_rx), vec![MasterResponse::AckCommit]);

    let coordinator = cluster.status(0).await.unwrap();
    let participant = cluster.status(1).await.unwrap();
    assert_eq!(coordinator.phase, CommitPhase::CoordCommitted);
    assert_eq!(participant.phase, CommitPhase::ParticipantCommitted);
    assert_eq!(participant.role, Role::Observer);
    assert_eq!(coordinator.songs, participant.songs);
    assert_eq!(coordinator.songs.get("x").map(String::as_str), Some("ok"));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn participant_no_vote_aborts_the_round() {
    let _guard = init_tracing();
    // Coordinator id 2 accepts a six-byte URL, participant id 0 rejects it.
    let (cluster, mut master_rx) = boot(&[2, 0]).await;

    cluster.master(2, add("y", "sixchr")).await.unwrap();
    sleep_ms(100).await;

    assert_eq!(drain(&mut master_rx), vec![MasterResponse::AckAbort]);

    let coordinator = cluster.status(2).await.unwrap();
    let participant = cluster.status(0).await.unwrap();
    assert_eq!(coordinator.phase, CommitPhase::CoordAborted);
    assert_eq!(coordinator.role, Role::Observer);
    assert_eq!(participant.phase, CommitPhase::ParticipantAborted);
    assert_eq!(participant.role, Role::Observer);
    assert!(coordinator.songs.is_empty());
    assert!(participant.songs.is_empty());
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn election_finishes_a_wedged_commit() {
    let _guard = init_tracing();
    let (mut cluster, mut master_rx) = boot(&[0, 1, 2]).await;

    // The coordinator's commit never leaves it: both participants are left
    // committable when it dies.
    cluster.block_lines(0, None, "commit");
    cluster.master(0, add("x", "ok")).await.unwrap();
    sleep_ms(100).await;

    assert_eq!(drain(&mut master_rx), vec![MasterResponse::AckCommit]);
    assert!(matches!(
        cluster.status(1).await.unwrap().phase,
        CommitPhase::ParticipantCommitable { .. }
    ));
    assert!(matches!(
        cluster.status(2).await.unwrap().phase,
        CommitPhase::ParticipantCommitable { .. }
    ));

    cluster.kill(0).unwrap();
    sleep_ms(2000).await;

    let responses = drain(&mut master_rx);
    assert!(responses.contains(&MasterResponse::Coordinator(ReplicaId(1))));
    assert!(responses.contains(&MasterResponse::AckCommit));

    let new_coordinator = cluster.status(1).await.unwrap();
    let follower = cluster.status(2).await.unwrap();
    assert_eq!(new_coordinator.role, Role::Coordinator);
    assert_eq!(new_coordinator.phase, CommitPhase::CoordCommitted);
    assert_eq!(follower.phase, CommitPhase::ParticipantCommitted);
    assert_eq!(follower.coordinator, Some(ReplicaId(1)));
    assert_eq!(new_coordinator.songs, follower.songs);
    assert_eq!(new_coordinator.songs.get("x").map(String::as_str), Some("ok"));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn lone_survivor_finishes_the_round() {
    let _guard = init_tracing();
    let (mut cluster, mut master_rx) = boot(&[0, 1]).await;

    // The pre-commit never arrives: the only participant is still uncertain
    // when the coordinator dies, wins its own election with no live peers,
    // and has to close the round from its own state.
    cluster.block_lines(0, None, "precommit");
    cluster.master(0, add("x", "ok")).await.unwrap();
    sleep_ms(100).await;
    assert!(matches!(
        cluster.status(1).await.unwrap().phase,
        CommitPhase::ParticipantInitCommit { .. }
    ));

    cluster.kill(0).unwrap();
    sleep_ms(2000).await;

    let responses = drain(&mut master_rx);
    assert!(responses.contains(&MasterResponse::Coordinator(ReplicaId(1))));
    assert!(responses.contains(&MasterResponse::AckCommit));

    let survivor = cluster.status(1).await.unwrap();
    assert_eq!(survivor.role, Role::Coordinator);
    assert_eq!(survivor.phase, CommitPhase::CoordCommitted);
    assert_eq!(survivor.songs.get("x").map(String::as_str), Some("ok"));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn lowest_id_wins_the_election() {
    let _guard = init_tracing();
    let (mut cluster, mut master_rx) = boot(&[1, 2, 4]).await;

    // No pre-commit ever goes out: both participants are left uncertain when
    // the coordinator dies, so the new coordinator re-runs the last phases.
    cluster.block_lines(1, None, "precommit");
    cluster.master(1, add("w", "u")).await.unwrap();
    sleep_ms(100).await;
    assert!(matches!(
        cluster.status(2).await.unwrap().phase,
        CommitPhase::ParticipantInitCommit { .. }
    ));
    assert!(matches!(
        cluster.status(4).await.unwrap().phase,
        CommitPhase::ParticipantInitCommit { .. }
    ));

    cluster.kill(1).unwrap();
    sleep_ms(2000).await;

    let responses = drain(&mut master_rx);
    assert!(responses.contains(&MasterResponse::Coordinator(ReplicaId(2))));
    assert!(responses.contains(&MasterResponse::AckCommit));

    let winner = cluster.status(2).await.unwrap();
    let follower = cluster.status(4).await.unwrap();
    assert_eq!(winner.role, Role::Coordinator);
    assert_eq!(winner.coordinator, Some(ReplicaId(2)));
    assert_eq!(winner.phase, CommitPhase::CoordCommitted);
    assert_eq!(follower.coordinator, Some(ReplicaId(2)));
    assert_eq!(follower.phase, CommitPhase::ParticipantCommitted);
    assert_eq!(winner.songs, follower.songs);
    assert_eq!(winner.songs.get("w").map(String::as_str), Some("u"));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn late_replica_pulls_the_full_state() {
    let _guard = init_tracing();
    let mut cluster = LocalCluster::new([0, 3], test_config());
    let (master_tx, mut master_rx) = mpsc::unbounded_channel();

    cluster.spawn(0).unwrap();
    cluster.join_master(0, master_tx.clone()).await.unwrap();
    sleep_ms(600).await;
    cluster.master(0, add("a", "urla")).await.unwrap();
    sleep_ms(500).await;
    assert_eq!(
        drain(&mut master_rx),
        vec![
            MasterResponse::Coordinator(ReplicaId(0)),
            MasterResponse::AckCommit
        ]
    );

    // The late joiner pulls the songlist from whichever peer is up.
    cluster.spawn(3).unwrap();
    cluster.join_master(3, master_tx.clone()).await.unwrap();
    sleep_ms(200).await;
    cluster
        .master(3, MasterRequest::RequestFullState)
        .await
        .unwrap();
    sleep_ms(100).await;

    let status = cluster.status(3).await.unwrap();
    assert_eq!(status.songs.get("a").map(String::as_str), Some("urla"));

    cluster
        .master(
            3,
            MasterRequest::Get {
                name: "a".to_string(),
            },
        )
        .await
        .unwrap();
    sleep_ms(50).await;
    assert_eq!(
        drain(&mut master_rx),
        vec![MasterResponse::Resp(Some("urla".to_string()))]
    );
    cluster.shutdown();
}
