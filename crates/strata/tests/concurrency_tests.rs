//! Concurrency tests
//!
//! Exercises the per-session lock in the session store, the exclusive
//! section of the active buffer, and at-most-once claims in the queue under
//! a multi-threaded runtime.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;

use strata::config::Config;
use strata::consolidation::{Disposition, Shutdown, Trigger};
use strata::memory::{MemoryItem, SessionId};
use strata::storage::PutOutcome;
use strata::system::MemorySystem;
use strata::testing::{ManualClock, MockEmbedder};

fn system(config: Config) -> Arc<MemorySystem> {
    Arc::new(
        MemorySystem::builder(config)
            .clock(Arc::new(ManualClock::default()))
            .embedder(Arc::new(MockEmbedder::new(256)))
            .build()
            .expect("Failed to build memory system"),
    )
}

fn session(s: &str) -> SessionId {
    SessionId::try_from(s).expect("valid session id")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_puts_insert_once() {
    let system = system(Config::default());

    let tasks = (0..16).map(|_| {
        let system = system.clone();
        tokio::spawn(async move {
            system
                .session()
                .put(
                    MemoryItem::new("the same observation").with_session(session("shared")),
                    Duration::minutes(5),
                )
                .await
                .unwrap()
        })
    });
    let outcomes: Vec<PutOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let inserted: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            PutOutcome::Inserted(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(inserted.len(), 1, "novelty check and insert must be atomic");
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, PutOutcome::Inserted(_)) || *o == PutOutcome::Merged { into: inserted[0] })
    );

    let item = system.session().snapshot(inserted[0]).await.unwrap();
    assert_eq!(item.access_count, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_write_in_parallel() {
    let system = system(Config::default());

    let tasks = (0..8).flat_map(|s| {
        (0..10).map(move |i| (s, i))
    })
    .map(|(s, i)| {
        let system = system.clone();
        tokio::spawn(async move {
            system
                .session()
                .put(
                    MemoryItem::new(format!("session {s} item {i}"))
                        .with_session(session(&format!("s{s}"))),
                    Duration::minutes(5),
                )
                .await
                .unwrap()
        })
    });
    join_all(tasks).await;

    assert_eq!(system.session().len(), 80);
    for s in 0..8 {
        assert_eq!(system.session().session_len(&session(&format!("s{s}"))).await, 10);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_buffer_bounds_hold_under_contention() {
    let mut config = Config::default();
    config.active.capacity = 5;
    config.active.token_budget = 40;
    let system = system(config);
    let buffer = Arc::new(system.active_buffer(None));

    let tasks = (0..50).map(|i| {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            buffer
                .write(MemoryItem::new(format!("note {i:02} {}", "x".repeat(i % 20))).with_importance((i % 10) as f32 / 10.0))
                .await
                .unwrap();
            assert!(buffer.len().await <= 5);
            assert!(buffer.token_usage().await <= 40);
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(buffer.len().await, 5);
    assert_eq!(system.queue().len(), 45);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drains_claim_each_item_once() {
    let system = system(Config::default());
    for i in 0..40 {
        let item = MemoryItem::new(format!("evicted item {i}")).with_valence(1.0);
        system.queue().enqueue_held(item, Trigger::Evicted);
    }

    let drains = (0..4).map(|_| {
        let system = system.clone();
        tokio::spawn(async move { system.pipeline().drain(&Shutdown::never()).await })
    });
    let reports: Vec<_> = join_all(drains)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let mut seen = HashSet::new();
    for report in &reports {
        for outcome in &report.outcomes {
            assert!(seen.insert(outcome.id), "{} processed twice", outcome.id);
        }
    }
    assert_eq!(seen.len(), 40);

    let promoted: usize = reports
        .iter()
        .map(|r| r.count(|d| *d == Disposition::Promoted))
        .sum();
    assert_eq!(promoted, 40);
    assert_eq!(system.persistent().len().await, 40);
    assert!(system.queue().is_empty());
}
