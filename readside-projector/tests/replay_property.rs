//! Crash-and-replay property.
//!
//! For any event sequence and any set of crash points, the read model after
//! recovery equals applying every event once, in offset order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use readside_domain::{HelloEvent, UserGreeting, WorkerId};
use readside_eventlog::{EventLog, SubscribeOptions};
use readside_projector::{
    greetings_registry, PartitionOutcome, Projector, ProjectorConfig, ProjectorState, RetryPolicy,
};
use readside_store::{GreetingRepository, MemoryCoordinator, MemoryStore, OffsetStore};
use readside_testkit::{hello_event_strategy, seed_events, single_tag_log, wait_for};
use tokio_util::sync::CancellationToken;

fn expected_read_model(events: &[HelloEvent]) -> Vec<UserGreeting> {
    let mut rows = BTreeMap::new();
    for event in events {
        match event {
            HelloEvent::GreetingMessageChanged { name, message, .. } => {
                rows.insert(name.clone(), UserGreeting::new(name.clone(), message.clone()));
            },
            HelloEvent::GreetingCleared { name, .. } => {
                rows.remove(name);
            },
            HelloEvent::HelloSaid { .. } => {},
        }
    }
    rows.into_values().collect()
}

fn config(run: usize) -> ProjectorConfig {
    ProjectorConfig {
        worker_id: WorkerId::new(format!("worker-{}", run)).unwrap(),
        lease_ttl: Duration::from_secs(5),
        renew_interval: Duration::from_secs(1),
        // A single attempt turns every injected failure into a crash.
        retry: RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
        subscribe: SubscribeOptions { batch_size: 4, poll_interval: Duration::from_millis(10) },
    }
}

async fn crash_and_replay(
    events: Vec<HelloEvent>,
    crash_after: Vec<usize>,
) -> anyhow::Result<(Vec<UserGreeting>, Option<i64>)> {
    let (log, tag) = single_tag_log();
    let head = seed_events(log.as_ref(), events).await?.len() as i64;
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(greetings_registry()?);

    // Every crash point is followed by a clean run that drains the log.
    let plan = crash_after.into_iter().map(Some).chain(std::iter::once(None));

    for (run, crash) in plan.enumerate() {
        match crash {
            Some(successes) => store.fail_commit_after(successes),
            None => store.disarm(),
        }

        // A crashed worker's lease is gone with it: each run gets a fresh coordinator.
        let projector = Arc::new(Projector::new(
            tag.clone(),
            log.clone() as Arc<dyn EventLog>,
            store.clone(),
            Arc::new(MemoryCoordinator::new()),
            registry.clone(),
            config(run),
        ));
        let mut status = projector.watch_status();
        let cancel = CancellationToken::new();
        let handle = {
            let projector = projector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { projector.run(&cancel).await })
        };

        wait_for(&mut status, |s| {
            s.state == ProjectorState::Faulted || s.offset.map(|o| o.value()) == Some(head)
        })
        .await?;
        cancel.cancel();

        let outcome = handle.await??;
        if crash.is_none() {
            anyhow::ensure!(
                !matches!(outcome, PartitionOutcome::Faulted { .. }),
                "clean run faulted: {:?}",
                outcome
            );
        }
    }

    let offset = store.load(&tag).await?.map(|o| o.value());
    Ok((store.all_greetings().await?, offset))
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

    #[test]
    fn prop_read_model_survives_crashes(
        events in prop::collection::vec(hello_event_strategy(), 1..24),
        crash_after in prop::collection::vec(0usize..8, 0..4),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let expected = expected_read_model(&events);
        let head = events.len() as i64;

        let (actual, offset) = rt.block_on(crash_and_replay(events, crash_after)).unwrap();

        prop_assert_eq!(actual, expected);
        prop_assert_eq!(offset, Some(head));
    }
}
