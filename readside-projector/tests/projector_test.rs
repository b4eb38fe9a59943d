//! Projector state machine against in-memory stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use readside_domain::{EventKind, HelloEvent, Offset, Tag, UserGreeting, WorkerId};
use readside_eventlog::{EventLog, MemoryEventLog, SubscribeOptions};
use readside_projector::handlers::greetings::handle_greeting_message_changed;
use readside_projector::{
    greetings_registry, prepare, HandlerError, HandlerRegistry, HoldOutcome, PartitionOutcome,
    Projector, ProjectorConfig, ProjectorState, RetryPolicy, StopReason,
};
use readside_store::{
    AcquireOutcome, GreetingRepository, MemoryCoordinator, MemoryStore, OffsetStore,
    PartitionCoordinator, Store,
};
use readside_testkit::{seed_events, single_tag_log, wait_for, FlakyEventLog, ScriptedStore};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Harness
// =============================================================================

fn worker(id: &str) -> WorkerId {
    WorkerId::new(id).unwrap()
}

fn config() -> ProjectorConfig {
    ProjectorConfig {
        worker_id: worker("w1"),
        lease_ttl: Duration::from_secs(5),
        renew_interval: Duration::from_millis(500),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        subscribe: SubscribeOptions { batch_size: 16, poll_interval: Duration::from_millis(20) },
    }
}

fn projector(
    tag: &Tag,
    log: Arc<dyn EventLog>,
    store: Arc<dyn Store>,
    coordinator: Arc<dyn PartitionCoordinator>,
    registry: HandlerRegistry,
    config: ProjectorConfig,
) -> Arc<Projector> {
    Arc::new(Projector::new(tag.clone(), log, store, coordinator, Arc::new(registry), config))
}

fn spawn_run(
    projector: &Arc<Projector>,
    cancel: &CancellationToken,
) -> JoinHandle<readside_projector::Result<PartitionOutcome>> {
    let projector = projector.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { projector.run(&cancel).await })
}

fn offset(v: i64) -> Option<Offset> {
    Some(Offset::new(v).unwrap())
}

/// Registry whose greeting handler fails its first `failures` calls
fn failing_registry(failures: usize) -> (HandlerRegistry, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventKind::GreetingMessageChanged, move |env| {
            if counter.fetch_add(1, Ordering::SeqCst) < failures {
                return Err(HandlerError::Failed("injected handler failure".to_string()));
            }
            handle_greeting_message_changed(env)
        })
        .unwrap();
    (registry, calls)
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_last_greeting_wins_and_cancel_releases_lease() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    prepare(store.as_ref()).await?;

    seed_events(
        log.as_ref(),
        [HelloEvent::greeting_changed("alice", "hi"), HelloEvent::greeting_changed("alice", "hello")],
    )
    .await?;

    let projector =
        projector(&tag, log, store.clone(), coordinator.clone(), greetings_registry()?, config());
    let mut status = projector.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&projector, &cancel);

    let live = wait_for(&mut status, |s| s.state == ProjectorState::Live).await?;
    assert_eq!(live.offset, offset(2));
    assert_eq!(live.owner, Some(worker("w1")));
    assert_eq!(live.events_applied, 2);
    assert_eq!(store.all_greetings().await?, vec![UserGreeting::new("alice", "hello")]);
    assert_eq!(coordinator.leases().await?.len(), 1);

    cancel.cancel();
    assert_eq!(run.await??, PartitionOutcome::Stopped(StopReason::Cancelled));
    assert!(coordinator.leases().await?.is_empty());
    assert_eq!(projector.status().state, ProjectorState::Stopped(StopReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_live_events_are_applied_after_catch_up() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());

    let projector =
        projector(&tag, log.clone(), store.clone(), coordinator, greetings_registry()?, config());
    let mut status = projector.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&projector, &cancel);

    wait_for(&mut status, |s| s.state == ProjectorState::Live).await?;
    seed_events(
        log.as_ref(),
        [HelloEvent::greeting_changed("bob", "yo"), HelloEvent::greeting_cleared("bob")],
    )
    .await?;

    wait_for(&mut status, |s| s.offset == offset(2)).await?;
    assert_eq!(store.find_greeting("bob").await?, None);

    cancel.cancel();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn test_unhandled_events_are_skipped_but_advance_offset() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());

    seed_events(
        log.as_ref(),
        [HelloEvent::hello_said("alice"), HelloEvent::greeting_changed("alice", "hi")],
    )
    .await?;

    let projector = projector(
        &tag,
        log,
        store.clone(),
        Arc::new(MemoryCoordinator::new()),
        greetings_registry()?,
        config(),
    );
    let mut status = projector.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&projector, &cancel);

    let done = wait_for(&mut status, |s| s.offset == offset(2)).await?;
    assert_eq!(done.events_skipped, 1);
    assert_eq!(done.events_applied, 1);
    assert_eq!(store.load(&tag).await?, offset(2));

    cancel.cancel();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_from_committed_offset() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    seed_events(log.as_ref(), [HelloEvent::greeting_changed("alice", "hi")]).await?;

    let first = projector(
        &tag,
        log.clone(),
        store.clone(),
        coordinator.clone(),
        greetings_registry()?,
        config(),
    );
    let mut status = first.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&first, &cancel);
    wait_for(&mut status, |s| s.offset == offset(1)).await?;
    cancel.cancel();
    run.await??;

    seed_events(log.as_ref(), [HelloEvent::greeting_changed("carol", "hey")]).await?;

    let second =
        projector(&tag, log, store.clone(), coordinator, greetings_registry()?, config());
    let mut status = second.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&second, &cancel);

    let done = wait_for(&mut status, |s| s.state == ProjectorState::Live).await?;
    assert_eq!(done.offset, offset(2));
    // Only the new event was applied by the second projector.
    assert_eq!(done.events_applied, 1);
    assert_eq!(store.greeting_count().await, 2);

    cancel.cancel();
    run.await??;
    Ok(())
}

// =============================================================================
// Ownership
// =============================================================================

#[tokio::test]
async fn test_busy_partition_is_not_processed() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    seed_events(log.as_ref(), [HelloEvent::greeting_changed("alice", "hi")]).await?;

    coordinator.acquire(&tag, &worker("w2"), Duration::from_secs(30)).await?;

    let projector =
        projector(&tag, log, store.clone(), coordinator, greetings_registry()?, config());
    let outcome = projector.run(&CancellationToken::new()).await?;

    assert_eq!(outcome, PartitionOutcome::Busy { holder: worker("w2") });
    assert_eq!(projector.status().state, ProjectorState::Idle);
    assert_eq!(store.load(&tag).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_stale_offset_stops_without_retrying_commit() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(ScriptedStore::new(MemoryStore::new()));
    let coordinator = Arc::new(MemoryCoordinator::new());
    store.taken_over_at(Offset::new(2)?);

    seed_events(
        log.as_ref(),
        [
            HelloEvent::greeting_changed("alice", "hi"),
            HelloEvent::greeting_changed("alice", "hello"),
            HelloEvent::greeting_changed("alice", "hey"),
        ],
    )
    .await?;

    let projector =
        projector(&tag, log, store.clone(), coordinator.clone(), greetings_registry()?, config());
    let outcome = projector.run(&CancellationToken::new()).await?;

    assert_eq!(outcome, PartitionOutcome::Stopped(StopReason::StaleOffset));
    assert_eq!(store.commits(), 2, "the stale commit must not be re-attempted");
    assert_eq!(store.load(&tag).await?, offset(1));
    assert_eq!(store.inner().find_greeting("alice").await?, Some(UserGreeting::new("alice", "hi")));
    assert_eq!(projector.status().retries, 0);
    assert!(coordinator.leases().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lost_lease_stops_and_tag_can_be_claimed_elsewhere() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let coordinator = Arc::new(MemoryCoordinator::new());

    // The lease lapses before the first renewal.
    let config = ProjectorConfig {
        lease_ttl: Duration::from_millis(50),
        renew_interval: Duration::from_millis(200),
        ..config()
    };
    let projector = projector(
        &tag,
        log,
        Arc::new(MemoryStore::new()),
        coordinator.clone(),
        greetings_registry()?,
        config,
    );
    let outcome = projector.run(&CancellationToken::new()).await?;

    assert_eq!(outcome, PartitionOutcome::Stopped(StopReason::LeaseLost));
    assert!(matches!(
        coordinator.acquire(&tag, &worker("w2"), Duration::from_secs(5)).await?,
        AcquireOutcome::Acquired(_)
    ));
    Ok(())
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_handler_failure_faults_with_offset_preserved_then_restarts() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());

    seed_events(
        log.as_ref(),
        [
            HelloEvent::hello_said("alice"),
            HelloEvent::greeting_changed("alice", "hi"),
            HelloEvent::greeting_changed("bob", "yo"),
        ],
    )
    .await?;

    // Three attempts per event: the first run exhausts them on offset 2.
    let (registry, calls) = failing_registry(4);
    let projector =
        projector(&tag, log, store.clone(), coordinator.clone(), registry, config());
    let cancel = CancellationToken::new();

    let PartitionOutcome::Faulted { lease, error } = projector.run(&cancel).await? else {
        panic!("handler failures past the budget must fault the partition");
    };
    assert!(error.contains("injected handler failure"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.load(&tag).await?, offset(1));
    assert_eq!(store.greeting_count().await, 0);

    let status = projector.status();
    assert_eq!(status.state, ProjectorState::Faulted);
    assert_eq!(status.retries, 2);
    assert!(status.last_error.is_some());

    // A faulted partition keeps its lease.
    assert!(matches!(
        coordinator.acquire(&tag, &worker("w2"), Duration::from_secs(5)).await?,
        AcquireOutcome::Busy { .. }
    ));

    let (restart, requested) = oneshot::channel();
    restart.send(()).unwrap();
    assert_eq!(projector.hold_faulted(lease, &cancel, requested).await, HoldOutcome::Restart);

    // One more injected failure is absorbed by the retry budget.
    let mut status = projector.watch_status();
    let run = spawn_run(&projector, &cancel);
    wait_for(&mut status, |s| s.offset == offset(3)).await?;
    assert_eq!(store.greeting_count().await, 2);

    cancel.cancel();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn test_hold_faulted_releases_lease_on_cancel() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let coordinator = Arc::new(MemoryCoordinator::new());
    seed_events(log.as_ref(), [HelloEvent::greeting_changed("alice", "hi")]).await?;

    let (registry, _) = failing_registry(usize::MAX);
    let projector = projector(
        &tag,
        log,
        Arc::new(MemoryStore::new()),
        coordinator.clone(),
        registry,
        config(),
    );
    let cancel = CancellationToken::new();

    let PartitionOutcome::Faulted { lease, .. } = projector.run(&cancel).await? else {
        panic!("expected fault");
    };

    cancel.cancel();
    let (_restart, requested) = oneshot::channel();
    let outcome = projector.hold_faulted(lease, &cancel, requested).await;
    assert_eq!(outcome, HoldOutcome::Stopped(StopReason::Cancelled));
    assert!(coordinator.leases().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_hold_faulted_ignores_dropped_restart_sender() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let coordinator = Arc::new(MemoryCoordinator::new());
    seed_events(log.as_ref(), [HelloEvent::greeting_changed("alice", "hi")]).await?;

    let (registry, _) = failing_registry(usize::MAX);
    let config = ProjectorConfig { renew_interval: Duration::from_millis(20), ..config() };
    let projector =
        projector(&tag, log, Arc::new(MemoryStore::new()), coordinator.clone(), registry, config);
    let cancel = CancellationToken::new();

    let PartitionOutcome::Faulted { lease, .. } = projector.run(&cancel).await? else {
        panic!("expected fault");
    };

    let (restart, requested) = oneshot::channel::<()>();
    drop(restart);
    let hold = {
        let projector = projector.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { projector.hold_faulted(lease, &cancel, requested).await })
    };

    // Still faulted and renewing well past several renew intervals.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(projector.status().state, ProjectorState::Faulted);
    assert_eq!(coordinator.leases().await?.len(), 1);

    cancel.cancel();
    assert_eq!(hold.await?, HoldOutcome::Stopped(StopReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_store_failures_are_retried_atomically() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    seed_events(log.as_ref(), [HelloEvent::greeting_changed("alice", "hi")]).await?;

    store.fail_commit_after(0);

    let projector = projector(
        &tag,
        log,
        store.clone(),
        Arc::new(MemoryCoordinator::new()),
        greetings_registry()?,
        config(),
    );
    let mut status = projector.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&projector, &cancel);

    let done = wait_for(&mut status, |s| s.offset == offset(1)).await?;
    assert_eq!(done.retries, 1);
    assert_eq!(done.events_applied, 1);
    assert_eq!(store.find_greeting("alice").await?, Some(UserGreeting::new("alice", "hi")));

    cancel.cancel();
    run.await??;
    Ok(())
}

#[tokio::test]
async fn test_store_outage_longer_than_retry_budget_never_faults() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(ScriptedStore::new(MemoryStore::new()));
    seed_events(log.as_ref(), [HelloEvent::greeting_changed("alice", "hi")]).await?;

    // Twice the per-event budget of three attempts.
    store.fail_next_commits(6);

    let projector = projector(
        &tag,
        log,
        store.clone(),
        Arc::new(MemoryCoordinator::new()),
        greetings_registry()?,
        config(),
    );
    let mut status = projector.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&projector, &cancel);

    let done = wait_for(&mut status, |s| {
        s.state == ProjectorState::Faulted || s.offset == offset(1)
    })
    .await?;
    assert_ne!(done.state, ProjectorState::Faulted, "outage faulted: {:?}", done.last_error);
    assert_eq!(done.offset, offset(1));
    assert_eq!(store.commits(), 7);
    assert_eq!(
        store.inner().find_greeting("alice").await?,
        Some(UserGreeting::new("alice", "hi"))
    );

    cancel.cancel();
    assert_eq!(run.await??, PartitionOutcome::Stopped(StopReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_transient_log_errors_never_fault() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    seed_events(
        log.as_ref(),
        [HelloEvent::greeting_changed("alice", "hi"), HelloEvent::greeting_changed("bob", "yo")],
    )
    .await?;

    // More consecutive failures than the per-event retry budget.
    let flaky = Arc::new(FlakyEventLog::new(log));
    flaky.fail_next_reads(5);

    let projector = projector(
        &tag,
        flaky.clone(),
        store.clone(),
        Arc::new(MemoryCoordinator::new()),
        greetings_registry()?,
        config(),
    );
    let mut status = projector.watch_status();
    let cancel = CancellationToken::new();
    let run = spawn_run(&projector, &cancel);

    let live = wait_for(&mut status, |s| s.state == ProjectorState::Live).await?;
    assert_eq!(live.offset, offset(2));
    assert!(flaky.reads() > 5);
    assert_eq!(store.greeting_count().await, 2);

    cancel.cancel();
    assert_eq!(run.await??, PartitionOutcome::Stopped(StopReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_offset_beyond_log_head_faults() -> anyhow::Result<()> {
    let (log, tag) = single_tag_log();
    let store = Arc::new(MemoryStore::new());
    // Committed progress the log does not know about.
    store.commit(&tag, None, Offset::new(5)?, Default::default()).await?;

    let projector = projector(
        &tag,
        log,
        store,
        Arc::new(MemoryCoordinator::new()),
        greetings_registry()?,
        config(),
    );
    let outcome = projector.run(&CancellationToken::new()).await?;

    assert!(matches!(outcome, PartitionOutcome::Faulted { ref error, .. } if error.contains("Invalid offset")));
    Ok(())
}

#[tokio::test]
async fn test_prepare_is_idempotent() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    prepare(&store).await?;
    prepare(&store).await?;
    assert!(store.schema_ready());
    Ok(())
}

#[tokio::test]
async fn test_memory_log_is_shared_across_projectors_of_different_tags() -> anyhow::Result<()> {
    use readside_domain::AggregateEventTag;

    let tags = AggregateEventTag::sharded("HelloEvent", 4)?;
    let log = Arc::new(MemoryEventLog::new(tags.clone()));
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());

    let users = ["alice", "bob", "carol", "dave", "erin", "frank", "grace"];
    seed_events(
        log.as_ref(),
        users.iter().map(|u| HelloEvent::greeting_changed(*u, format!("hi {}", u))),
    )
    .await?;

    let cancel = CancellationToken::new();
    let registry = Arc::new(greetings_registry()?);
    let mut runs = Vec::new();
    let mut watchers = Vec::new();
    for tag in tags.all_tags() {
        let projector = Arc::new(Projector::new(
            tag,
            log.clone(),
            store.clone(),
            coordinator.clone(),
            registry.clone(),
            config(),
        ));
        watchers.push(projector.watch_status());
        runs.push(spawn_run(&projector, &cancel));
    }

    for status in &mut watchers {
        wait_for(status, |s| s.state == ProjectorState::Live).await?;
    }
    assert_eq!(store.greeting_count().await, users.len());
    assert_eq!(coordinator.leases().await?.len(), 4);

    cancel.cancel();
    for run in runs {
        run.await??;
    }
    Ok(())
}
