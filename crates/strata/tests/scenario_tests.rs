//! End-to-end scenarios across tiers
//!
//! Each test drives a full memory system with a manual clock and a mock
//! embedder, so TTL expiry, backoff and sweeps are deterministic:
//! - eviction under pressure
//! - TTL-triggered discard
//! - episodic promotion with replay
//! - backend outage recovery
//! - restart over durable indexes

use std::sync::Arc;

use chrono::Duration;

use strata::affect::AffectiveSignal;
use strata::clock::Clock;
use strata::config::Config;
use strata::consolidation::{Disposition, Shutdown, Trigger};
use strata::memory::scoring::{self, ScoreInputs};
use strata::memory::{ItemId, MemoryItem, SessionId, Tier};
use strata::storage::{CompositeQuery, PersistentFilter, PutOutcome};
use strata::system::{MemorySystem, TierIndexes};
use strata::testing::{ManualClock, MockEmbedder};

// =============================================================================
// Fixtures
// =============================================================================

struct Harness {
    system: MemorySystem,
    clock: Arc<ManualClock>,
    embedder: Arc<MockEmbedder>,
}

fn harness_with(config: Config) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let embedder = Arc::new(MockEmbedder::new(128));
    let system = MemorySystem::builder(config)
        .clock(clock.clone())
        .embedder(embedder.clone())
        .build()
        .expect("Failed to build memory system");
    Harness {
        system,
        clock,
        embedder,
    }
}

fn harness() -> Harness {
    harness_with(Config::default())
}

fn session(s: &str) -> SessionId {
    SessionId::try_from(s).expect("valid session id")
}

async fn put(h: &Harness, item: MemoryItem, ttl: Duration) -> ItemId {
    match h.system.session().put(item, ttl).await.expect("put failed") {
        PutOutcome::Inserted(id) => id,
        other => panic!("expected insert, got {other:?}"),
    }
}

/// Number of tiers currently holding `id`
async fn homes(h: &Harness, id: ItemId) -> usize {
    [
        h.system.session().contains(id),
        h.system.persistent().contains(id).await,
        h.system.episodic().contains(id).await,
    ]
    .into_iter()
    .filter(|held| *held)
    .count()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_eviction_under_pressure() {
    let mut config = Config::default();
    config.active.capacity = 3;
    let h = harness_with(config);
    let buffer = h.system.active_buffer(Some(session("s1")));

    let a = MemoryItem::new("note A").with_importance(0.9);
    let b = MemoryItem::new("note B").with_importance(0.2);
    let c = MemoryItem::new("note C").with_importance(0.5);
    let d = MemoryItem::new("note D").with_importance(0.7);
    let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);

    for item in [a, b, c] {
        buffer.write(item).await.unwrap();
    }
    assert!(h.system.queue().is_empty());

    buffer.write(d).await.unwrap();
    assert_eq!(buffer.len().await, 3);
    assert!(buffer.read(b_id).await.is_none());
    for id in [a_id, c_id, d_id] {
        assert!(buffer.read(id).await.is_some());
    }
    assert_eq!(h.system.queue().len(), 1);

    // The buffer's working score does not carry over; B scores 0.3 on its own.
    let report = h.system.pipeline().drain(&Shutdown::never()).await;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.disposition(b_id), Some(Disposition::Discarded));
    assert_eq!(homes(&h, b_id).await, 0);
    assert!(h.system.queue().is_empty());
}

#[tokio::test]
async fn test_evicting_a_retrieved_session_item_leaves_one_copy() {
    let h = harness();
    let id = put(
        &h,
        MemoryItem::new("the staging database moved regions")
            .with_session(session("s1"))
            .with_valence(0.9),
        Duration::minutes(10),
    )
    .await;

    let buffer = h.system.active_buffer(Some(session("s1")));
    let working = h.system.session().get(id).await.unwrap();
    buffer.write(working).await.unwrap();
    buffer.evict(id).await.unwrap();

    let report = h.system.pipeline().drain(&Shutdown::never()).await;
    assert_eq!(report.disposition(id), Some(Disposition::Promoted));
    assert!(h.system.persistent().contains(id).await);
    assert!(!h.system.session().contains(id));
    assert_eq!(homes(&h, id).await, 1);

    h.clock.advance(Duration::minutes(10));
    let report = h.system.pipeline().sweep(&Shutdown::never()).await;
    assert_eq!(report.disposition(id), None, "nothing left to expire");
    assert_eq!(homes(&h, id).await, 1);
}

#[tokio::test]
async fn test_ttl_expiry_discards_unimportant_items() {
    let h = harness();
    let id = put(
        &h,
        MemoryItem::new("the user said hi").with_session(session("s1")),
        Duration::minutes(1),
    )
    .await;

    let report = h.system.pipeline().sweep(&Shutdown::never()).await;
    assert!(report.disposition(id).is_none(), "not expired yet");
    assert!(h.system.session().contains(id));

    h.clock.advance(Duration::minutes(1));
    let report = h.system.pipeline().sweep(&Shutdown::never()).await;
    assert_eq!(report.disposition(id), Some(Disposition::Discarded));
    assert_eq!(homes(&h, id).await, 0);
}

#[tokio::test]
async fn test_episodic_promotion_and_replay() {
    let h = harness();
    let s = session("incident");
    let tx = h.system.affect_channel(8);

    let mut ids = Vec::new();
    for (i, text) in ["pager fired", "database failover", "root cause found"]
        .iter()
        .enumerate()
    {
        let created = h.clock.now() + Duration::seconds(i as i64);
        let event = format!("evt-{i}");
        tx.send(AffectiveSignal::new(event.clone(), -1.0, 1.0, h.clock.now()))
            .await
            .unwrap();
        ids.push(
            put(
                &h,
                MemoryItem::new(*text)
                    .with_session(s.clone())
                    .with_source_task("task-7")
                    .with_event(event)
                    .with_created_at(created),
                Duration::seconds(30),
            )
            .await,
        );
    }
    drop(tx);

    for _ in 0..100 {
        if h.system.affect().len() == 3 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.system.affect().len(), 3);

    h.clock.advance(Duration::seconds(31));
    let report = h.system.pipeline().sweep(&Shutdown::never()).await;
    for id in &ids {
        assert_eq!(report.disposition(*id), Some(Disposition::Archived));
        assert_eq!(homes(&h, *id).await, 1);
    }

    let replayed: Vec<ItemId> = h.system.episodic().replay(&s).await.iter().map(|i| i.id).collect();
    assert_eq!(replayed, ids);

    let hits = h
        .system
        .episodic()
        .query_composite(
            &CompositeQuery::new(1)
                .in_session(s.clone())
                .similar_to(h.embedder.vector_for("database failover")),
        )
        .await
        .unwrap();
    assert_eq!(hits[0].item.id, ids[1]);
    assert_eq!(hits[0].item.tier, Tier::Episodic);
}

#[tokio::test]
async fn test_backend_outage_recovery() {
    let h = harness();
    h.embedder.set_available(false);

    let id = put(
        &h,
        MemoryItem::new("customer prefers email over phone")
            .with_session(session("s1"))
            .with_valence(0.8),
        Duration::seconds(10),
    )
    .await;
    assert!(h.system.session().snapshot(id).await.unwrap().needs_embedding());

    h.clock.advance(Duration::seconds(10));
    let report = h.system.pipeline().sweep(&Shutdown::never()).await;
    assert!(matches!(report.disposition(id), Some(Disposition::Retry { attempts: 1, .. })));
    assert_eq!(homes(&h, id).await, 1);

    h.embedder.set_available(true);
    h.clock.advance(h.system.config().consolidation.backoff(1));
    let report = h.system.pipeline().sweep(&Shutdown::never()).await;
    assert_eq!(report.disposition(id), Some(Disposition::Promoted));
    assert_eq!(homes(&h, id).await, 1);

    let hits = h
        .system
        .persistent()
        .semantic_search(
            &h.embedder.vector_for("customer prefers email over phone"),
            3,
            &PersistentFilter::new(),
        )
        .await
        .unwrap();
    assert_eq!(hits[0].item.id, id);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_novelty_merge_in_session() {
    let h = harness();
    let first = put(
        &h,
        MemoryItem::new("deploys are frozen on fridays").with_session(session("s1")),
        Duration::minutes(5),
    )
    .await;

    let outcome = h
        .system
        .session()
        .put(
            MemoryItem::new("deploys are frozen on fridays").with_session(session("s1")),
            Duration::minutes(5),
        )
        .await
        .unwrap();
    assert_eq!(outcome, PutOutcome::Merged { into: first });
    assert_eq!(h.system.session().len(), 1);
}

#[tokio::test]
async fn test_promotion_score_is_the_formula_result() {
    let h = harness();
    let scoring_config = h.system.config().scoring;

    let inflated = put(
        &h,
        MemoryItem::new("says it is crucial")
            .with_session(session("s1"))
            .with_importance(0.95),
        Duration::seconds(10),
    )
    .await;
    let earned = put(
        &h,
        MemoryItem::new("on-call rotation changes on monday")
            .with_session(session("s2"))
            .with_valence(0.8),
        Duration::seconds(10),
    )
    .await;

    h.clock.advance(Duration::seconds(10));
    let report = h.system.pipeline().sweep(&Shutdown::never()).await;
    assert_eq!(report.disposition(inflated), Some(Disposition::Discarded));
    assert_eq!(homes(&h, inflated).await, 0);
    assert_eq!(report.disposition(earned), Some(Disposition::Promoted));

    let expected = scoring::importance(
        &ScoreInputs {
            access_count: 0,
            affective_valence: 0.8,
            novelty: 1.0,
        },
        &scoring_config,
    );
    let stored = h.system.persistent().snapshot(earned).await.unwrap();
    assert!((stored.importance_score - expected).abs() < 1e-6);
}

#[tokio::test]
async fn test_long_term_tiers_survive_a_restart() {
    let indexes = TierIndexes::in_memory();
    let clock = Arc::new(ManualClock::default());
    let embedder = Arc::new(MockEmbedder::new(128));
    let start = || {
        MemorySystem::builder(Config::default())
            .clock(clock.clone())
            .embedder(embedder.clone())
            .indexes(indexes.clone())
            .build()
            .expect("Failed to build memory system")
    };

    let first = start();
    let fact = "production deploys need two approvals";
    let PutOutcome::Inserted(id) = first
        .session()
        .put(
            MemoryItem::new(fact).with_session(session("s1")).with_valence(0.9),
            Duration::seconds(5),
        )
        .await
        .unwrap()
    else {
        panic!("expected insert");
    };
    clock.advance(Duration::seconds(5));
    let report = first.pipeline().sweep(&Shutdown::never()).await;
    assert_eq!(report.disposition(id), Some(Disposition::Promoted));
    drop(first);

    let second = start();
    assert!(second.persistent().is_empty().await);
    assert_eq!(second.restore().await.unwrap(), 1);
    assert!(second.persistent().contains(id).await);

    let repeat = MemoryItem::new(fact).with_valence(0.9);
    let repeat_id = repeat.id;
    second.queue().enqueue_held(repeat, Trigger::Evicted);
    let report = second.pipeline().drain(&Shutdown::never()).await;
    assert_eq!(
        report.disposition(repeat_id),
        Some(Disposition::Merged { into: id })
    );
    assert!(second.pipeline().stuck_items().is_empty());
}

#[tokio::test]
async fn test_retrieval_never_lowers_importance() {
    let h = harness();
    let id = put(
        &h,
        MemoryItem::new("frequently needed").with_session(session("s1")),
        Duration::minutes(5),
    )
    .await;

    let mut last = h.system.session().snapshot(id).await.unwrap().importance_score;
    for _ in 0..20 {
        let item = h.system.session().get(id).await.unwrap();
        assert!(item.importance_score >= last);
        assert!(item.importance_score <= 1.0);
        last = item.importance_score;
    }
}

#[tokio::test]
async fn test_no_item_lives_in_two_tiers() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..12 {
        let mut item = MemoryItem::new(format!("fact number {i}"))
            .with_session(session(if i % 2 == 0 { "even" } else { "odd" }))
            .with_valence(if i % 3 == 0 { 0.9 } else { 0.0 });
        if i % 4 == 0 {
            item = item.with_source_task("t");
        }
        ids.push(put(&h, item, Duration::seconds(5 + i)).await);
    }

    for _ in 0..4 {
        h.clock.advance(Duration::seconds(5));
        h.system.pipeline().sweep(&Shutdown::never()).await;
        for id in &ids {
            assert!(homes(&h, *id).await <= 1, "{id} found in more than one tier");
        }
    }
    assert!(h.system.session().is_empty());
}
