//! End-to-end tests of the daemon over the in-memory backend.
//!
//! Run with: `cargo test -p readsided --test daemon_test`

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use readside_domain::{AggregateEventTag, HelloEvent, UserGreeting, WorkerId};
use readside_eventlog::{EventWriter, MemoryEventLog};
use readside_projector::{PartitionStatus, ProjectorState};
use readside_store::{GreetingRepository, MemoryCoordinator, MemoryStore, PartitionCoordinator};
use readsided::{Config, Daemon, DaemonError, DaemonResult, PartitionBoard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Helpers
// =============================================================================

struct Cluster {
    tags: AggregateEventTag,
    log: Arc<MemoryEventLog>,
    store: Arc<MemoryStore>,
    coordinator: Arc<MemoryCoordinator>,
}

struct RunningDaemon {
    board: PartitionBoard,
    shutdown: CancellationToken,
    handle: JoinHandle<DaemonResult<()>>,
}

impl Cluster {
    fn new() -> Self {
        let tags = Config::test().projection.tags().unwrap();
        Self {
            log: Arc::new(MemoryEventLog::new(tags.clone())),
            tags,
            store: Arc::new(MemoryStore::new()),
            coordinator: Arc::new(MemoryCoordinator::new()),
        }
    }

    fn start(&self, worker: &str, max_partitions: usize) -> RunningDaemon {
        let mut config = Config::test();
        config.projection.worker_id = WorkerId::new(worker).unwrap();
        config.projection.max_partitions = max_partitions;

        let daemon = Daemon::new(
            config,
            self.log.clone(),
            self.store.clone(),
            self.coordinator.clone(),
        )
        .unwrap();

        RunningDaemon {
            board: daemon.board(),
            shutdown: daemon.shutdown_token(),
            handle: tokio::spawn(daemon.run_until(std::future::pending())),
        }
    }

    async fn greetings(&self) -> Vec<UserGreeting> {
        self.store.all_greetings().await.unwrap()
    }

    /// A user id whose events land on a different tag than `other`.
    fn user_on_other_tag(&self, other: &str) -> String {
        (0..)
            .map(|i| format!("user-{}", i))
            .find(|id| self.tags.tag_for(id) != self.tags.tag_for(other))
            .unwrap()
    }
}

impl RunningDaemon {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }

    fn status_of(&self, tags: &AggregateEventTag, id: &str) -> PartitionStatus {
        self.board.get(&tags.tag_for(id)).unwrap().status()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 10s");
}

fn greeting(id: &str, message: &str) -> UserGreeting {
    UserGreeting::new(id, message)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_daemon_projects_every_tag_and_releases_on_shutdown() {
    let cluster = Cluster::new();
    let daemon = cluster.start("worker-a", 2);

    for event in [
        HelloEvent::greeting_changed("alice", "hi"),
        HelloEvent::greeting_changed("bob", "hey"),
        HelloEvent::hello_said("carol"),
        HelloEvent::greeting_changed("alice", "hello"),
        HelloEvent::greeting_changed("dave", "yo"),
        HelloEvent::greeting_cleared("bob"),
    ] {
        cluster.log.append(event).await.unwrap();
    }

    let expected = vec![greeting("alice", "hello"), greeting("dave", "yo")];
    eventually(|| async { cluster.greetings().await == expected }).await;

    daemon.stop().await;
    assert!(cluster.coordinator.leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_two_workers_share_the_tag_set() {
    let cluster = Cluster::new();
    let a = cluster.start("worker-a", 1);
    let b = cluster.start("worker-b", 1);

    let other = cluster.user_on_other_tag("alice");
    cluster.log.append(HelloEvent::greeting_changed("alice", "hi")).await.unwrap();
    cluster.log.append(HelloEvent::greeting_changed(other.as_str(), "hey")).await.unwrap();

    let mut expected = vec![greeting("alice", "hi"), greeting(&other, "hey")];
    expected.sort_by(|x, y| x.id.cmp(&y.id));
    eventually(|| async { cluster.greetings().await == expected }).await;

    let leases = cluster.coordinator.leases().await.unwrap();
    assert_eq!(leases.len(), 2);
    assert_ne!(leases[0].worker_id, leases[1].worker_id);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_second_worker_resumes_from_committed_offset() {
    let cluster = Cluster::new();
    let first = cluster.start("worker-a", 2);

    cluster.log.append(HelloEvent::greeting_changed("alice", "hi")).await.unwrap();
    eventually(|| async { cluster.greetings().await == vec![greeting("alice", "hi")] }).await;
    first.stop().await;

    cluster.log.append(HelloEvent::greeting_changed("alice", "hello")).await.unwrap();
    let second = cluster.start("worker-b", 2);
    eventually(|| async { cluster.greetings().await == vec![greeting("alice", "hello")] }).await;

    // Only the new event was applied by the second worker.
    eventually(|| async { second.status_of(&cluster.tags, "alice").events_applied == 1 }).await;
    let applied: u64 = second.board.statuses().iter().map(|s| s.events_applied).sum();
    assert_eq!(applied, 1);

    second.stop().await;
}

#[tokio::test]
async fn test_faulted_partition_is_isolated_and_restartable() {
    let cluster = Cluster::new();
    let daemon = cluster.start("worker-a", 2);
    let healthy = cluster.user_on_other_tag("mallory");
    let poisoned_tag = cluster.tags.tag_for("mallory");

    cluster.log.append(HelloEvent::greeting_changed("mallory", "x".repeat(300))).await.unwrap();
    cluster.log.append(HelloEvent::greeting_changed(healthy.as_str(), "fine")).await.unwrap();

    eventually(|| async {
        daemon.status_of(&cluster.tags, "mallory").state == ProjectorState::Faulted
    })
    .await;
    eventually(|| async { cluster.greetings().await == vec![greeting(&healthy, "fine")] }).await;

    let faulted = daemon.status_of(&cluster.tags, "mallory");
    assert_eq!(faulted.offset, None);
    assert!(faulted.last_error.unwrap().contains("mallory"));
    assert_ne!(daemon.status_of(&cluster.tags, &healthy).state, ProjectorState::Faulted);

    // The faulted partition keeps its lease.
    let leases = cluster.coordinator.leases().await.unwrap();
    assert!(leases.iter().any(|l| l.tag == poisoned_tag));

    // Healthy partitions cannot be restarted.
    let err = daemon.board.restart(&cluster.tags.tag_for(&healthy)).unwrap_err();
    assert!(matches!(err, DaemonError::PartitionNotFaulted { .. }));

    // A restart replays the poisoned event, which faults again.
    let retries_before = faulted.retries;
    // Accepted once the worker holds the faulted lease.
    eventually(|| async { daemon.board.restart(&poisoned_tag).is_ok() }).await;
    eventually(|| async {
        let status = daemon.status_of(&cluster.tags, "mallory");
        status.state == ProjectorState::Faulted && status.retries > retries_before
    })
    .await;

    daemon.stop().await;
    assert!(cluster.coordinator.leases().await.unwrap().is_empty());
}
