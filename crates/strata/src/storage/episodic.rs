//! Episodic store
//!
//! An append-only log ordered by `(created_at, id)` with a semantic index on
//! the side. Appends never reorder anything; only `importance_score` and
//! `access_count` change after an item is logged.
//!
//! Index rows carry the full item so the log can be rebuilt with
//! [`EpisodicStore::restore`]; score changes are written back to the row.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Promoted, ScoredItem};
use crate::clock::Clock;
use crate::config::{Config, ScoringConfig};
use crate::embedding::{EmbeddingPort, ensure_embedding};
use crate::error::{Result, StrataError};
use crate::index::{IndexFilter, IndexHit, IndexMetadata, SimilarityIndex};
use crate::memory::scoring;
use crate::memory::session_id::SessionId;
use crate::memory::types::{ItemId, MemoryItem, Tier};

/// Semantic candidates fetched per requested result before composite ranking
const CANDIDATE_MULTIPLIER: usize = 3;

/// Neighbours fetched for the novelty check; rows without a logged item are skipped.
const NOVELTY_NEIGHBOURS: usize = 4;

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(StrataError::Validation(format!(
                "Time range ends ({end}) before it starts ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// What/where/when query over the episodic log
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeQuery {
    pub session_id: Option<SessionId>,
    pub time_range: Option<TimeRange>,
    pub query_vector: Option<Vec<f32>>,
    pub top_k: usize,
}

impl CompositeQuery {
    pub fn new(top_k: usize) -> Self {
        Self {
            session_id: None,
            time_range: None,
            query_vector: None,
            top_k,
        }
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn similar_to(mut self, vector: Vec<f32>) -> Self {
        self.query_vector = Some(vector);
        self
    }

    fn matches(&self, item: &MemoryItem) -> bool {
        self.session_id
            .as_ref()
            .is_none_or(|s| item.session_id.as_ref() == Some(s))
            && self.time_range.is_none_or(|r| r.contains(item.created_at))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EpisodeKey {
    created_at: DateTime<Utc>,
    id: ItemId,
}

impl EpisodeKey {
    fn of(item: &MemoryItem) -> Self {
        Self {
            created_at: item.created_at,
            id: item.id,
        }
    }

    /// Smallest key at `at`
    fn floor(at: DateTime<Utc>) -> Self {
        Self {
            created_at: at,
            id: ItemId::from(Uuid::nil()),
        }
    }
}

#[derive(Debug, Default)]
struct EpisodeLog {
    entries: BTreeMap<EpisodeKey, MemoryItem>,
    by_id: HashMap<ItemId, EpisodeKey>,
}

impl EpisodeLog {
    fn get_mut(&mut self, id: &ItemId) -> Option<&mut MemoryItem> {
        let key = self.by_id.get(id)?;
        self.entries.get_mut(key)
    }

    fn in_range(&self, range: Option<TimeRange>) -> Box<dyn Iterator<Item = &MemoryItem> + Send + '_> {
        match range {
            Some(r) => Box::new(
                self.entries
                    .range(EpisodeKey::floor(r.start)..EpisodeKey::floor(r.end))
                    .map(|(_, item)| item),
            ),
            None => Box::new(self.entries.values()),
        }
    }
}

pub struct EpisodicStore {
    index: Arc<dyn SimilarityIndex>,
    embedder: Arc<dyn EmbeddingPort>,
    clock: Arc<dyn Clock>,
    scoring: ScoringConfig,
    embed_timeout: Duration,
    max_content_bytes: usize,
    log: RwLock<EpisodeLog>,
}

impl EpisodicStore {
    pub fn new(
        index: Arc<dyn SimilarityIndex>,
        embedder: Arc<dyn EmbeddingPort>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            index,
            embedder,
            clock,
            scoring: config.scoring,
            embed_timeout: config.embedding.timeout(),
            max_content_bytes: config.storage.max_content_bytes,
            log: RwLock::new(EpisodeLog::default()),
        }
    }

    /// Append a promoted item to the log.
    ///
    /// The item must carry its session, source task and creation time.
    /// Appending an id that is already logged only refreshes its importance
    /// and access count.
    pub async fn append(&self, promoted: Promoted) -> Result<()> {
        let mut item = promoted.into_inner();
        item.validate(self.max_content_bytes)?;
        if !item.has_episodic_triple() {
            return Err(StrataError::Validation(format!(
                "Episodic item {} needs session id, source task id and creation time",
                item.id
            )));
        }
        if item.importance_score < self.scoring.promotion_threshold {
            return Err(StrataError::Validation(format!(
                "Item {} scored {:.3}, below promotion threshold {:.3}",
                item.id, item.importance_score, self.scoring.promotion_threshold
            )));
        }

        {
            let mut log = self.log.write().await;
            if let Some(existing) = log.get_mut(&item.id) {
                let mut refreshed = existing.clone();
                refreshed.importance_score = item.importance_score;
                refreshed.access_count = existing.access_count.max(item.access_count);
                self.write_row(&refreshed).await?;
                *existing = refreshed;
                return Ok(());
            }
        }

        item.tier = Tier::Episodic;
        item.ttl = None;
        ensure_embedding(self.embedder.as_ref(), &mut item, self.embed_timeout).await?;
        self.write_row(&item).await?;

        debug!(
            "Archived {} for session {:?} at {}",
            item.id, item.session_id, item.created_at
        );
        let key = EpisodeKey::of(&item);
        let mut log = self.log.write().await;
        log.by_id.insert(item.id, key);
        log.entries.insert(key, item);
        Ok(())
    }

    /// Exact session/time filters first, then rank by
    /// `similarity * importance * recency_decay(created_at)`.
    /// Returned items are reconsolidated.
    pub async fn query_composite(&self, query: &CompositeQuery) -> Result<Vec<ScoredItem>> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();

        let candidates: Vec<(ItemId, f32)> = match &query.query_vector {
            Some(vector) => {
                let filter = IndexFilter {
                    session_id: query.session_id.clone(),
                    source_task_id: None,
                    created_after: query.time_range.map(|r| r.start),
                    created_before: query.time_range.map(|r| r.end),
                };
                self.index
                    .query(vector, query.top_k.saturating_mul(CANDIDATE_MULTIPLIER), &filter)
                    .await?
                    .into_iter()
                    .map(|hit| (hit.id, hit.score))
                    .collect()
            }
            None => {
                let log = self.log.read().await;
                log.in_range(query.time_range)
                    .filter(|item| query.matches(item))
                    .map(|item| (item.id, 1.0))
                    .collect()
            }
        };

        let mut log = self.log.write().await;
        let mut ranked: Vec<(f32, ScoredItem)> = candidates
            .into_iter()
            .filter_map(|(id, similarity)| {
                let item = log.get_mut(&id)?;
                if !query.matches(item) {
                    return None;
                }
                let recency = scoring::recency_decay(now - item.created_at, &self.scoring);
                let rank = similarity.max(0.0) * item.importance_score * recency;
                Some((
                    rank,
                    ScoredItem {
                        item: item.clone(),
                        similarity,
                    },
                ))
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.item.id.cmp(&b.1.item.id))
        });
        ranked.truncate(query.top_k);

        let mut results = Vec::with_capacity(ranked.len());
        for (_, mut scored) in ranked {
            if let Some(item) = log.get_mut(&scored.item.id) {
                scoring::reconsolidate(item, &self.scoring, now);
                scored.item = item.clone();
            }
            results.push(scored);
        }
        drop(log);

        let touched: Vec<MemoryItem> = results.iter().map(|r| r.item.clone()).collect();
        self.write_back(&touched).await;
        Ok(results)
    }

    /// Reload every logged item whose index row carries a record. Items
    /// already present are kept. Returns the number of items loaded.
    pub async fn restore(&self) -> Result<usize> {
        let entries = self.index.scan().await?;
        let mut log = self.log.write().await;
        let mut restored = 0;
        for entry in entries {
            let mut item = match entry.metadata.decode_record() {
                Ok(Some(item)) if item.id == entry.id && item.has_episodic_triple() => item,
                Ok(_) => {
                    warn!("Index row {} has no usable record; skipped", entry.id);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to decode record {}: {e}", entry.id);
                    continue;
                }
            };
            if log.by_id.contains_key(&item.id) {
                continue;
            }
            item.tier = Tier::Episodic;
            item.ttl = None;
            let key = EpisodeKey::of(&item);
            log.by_id.insert(item.id, key);
            log.entries.insert(key, item);
            restored += 1;
        }
        info!("Restored {restored} episodes from {}", self.index.collection());
        Ok(restored)
    }

    /// Every item of a session in creation order. Not counted as a retrieval.
    pub async fn replay(&self, session_id: &SessionId) -> Vec<MemoryItem> {
        self.log
            .read()
            .await
            .entries
            .values()
            .filter(|item| item.session_id.as_ref() == Some(session_id))
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self, id: ItemId) -> Option<MemoryItem> {
        let log = self.log.read().await;
        let key = log.by_id.get(&id)?;
        log.entries.get(key).cloned()
    }

    pub async fn contains(&self, id: ItemId) -> bool {
        self.log.read().await.by_id.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.read().await.entries.is_empty()
    }

    /// Closest logged item in `session_id` other than `exclude`.
    pub(crate) async fn nearest_other(
        &self,
        vector: &[f32],
        session_id: &SessionId,
        exclude: ItemId,
    ) -> Result<Option<IndexHit>> {
        let filter = IndexFilter::new().with_session(session_id.clone());
        let hits = self.index.query(vector, NOVELTY_NEIGHBOURS, &filter).await?;
        let log = self.log.read().await;
        Ok(hits
            .into_iter()
            .find(|hit| hit.id != exclude && log.by_id.contains_key(&hit.id)))
    }

    pub(crate) async fn merge_duplicate(&self, id: ItemId, now: DateTime<Utc>) -> Result<()> {
        let mut log = self.log.write().await;
        let item = log
            .get_mut(&id)
            .ok_or_else(|| StrataError::NotFound(format!("Episodic item {id}")))?;
        let mut merged = item.clone();
        scoring::merge_boost(&mut merged, &self.scoring, now);
        self.write_row(&merged).await?;
        *item = merged;
        Ok(())
    }

    pub(crate) async fn decay(&self, factor: f32) -> usize {
        let decayed: Vec<MemoryItem> = {
            let mut log = self.log.write().await;
            log.entries
                .values_mut()
                .map(|item| {
                    item.set_importance(item.importance_score * factor);
                    item.clone()
                })
                .collect()
        };
        self.write_back(&decayed).await;
        decayed.len()
    }

    async fn write_row(&self, item: &MemoryItem) -> Result<()> {
        let vector = item
            .fresh_embedding()
            .ok_or_else(|| StrataError::Validation(format!("Item {} has no embedding", item.id)))?;
        self.index
            .upsert(item.id, vector, IndexMetadata::with_record(item)?)
            .await
    }

    async fn write_back(&self, items: &[MemoryItem]) {
        for item in items {
            if let Err(e) = self.write_row(item).await {
                warn!("Failed to write back {}: {e}", item.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndex;
    use crate::testing::{ManualClock, MockEmbedder};

    struct Fixture {
        store: EpisodicStore,
        embedder: Arc<MockEmbedder>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let embedder = Arc::new(MockEmbedder::new(64));
        let clock = Arc::new(ManualClock::default());
        let store = EpisodicStore::new(
            Arc::new(InMemoryIndex::new(Tier::Episodic.collection())),
            embedder.clone(),
            clock.clone(),
            &Config::default(),
        );
        Fixture {
            store,
            embedder,
            clock,
        }
    }

    fn session(s: &str) -> SessionId {
        SessionId::try_from(s).unwrap()
    }

    fn episode(content: &str, s: &str, at: DateTime<Utc>, score: f32) -> MemoryItem {
        MemoryItem::new(content)
            .with_session(session(s))
            .with_source_task("t1")
            .with_created_at(at)
            .with_importance(score)
    }

    mod append {
        use super::*;

        #[tokio::test]
        async fn requires_triple() {
            let f = fixture();
            let item = MemoryItem::new("no task").with_session(session("s1")).with_importance(0.9);
            let err = f.store.append(Promoted::new(item)).await.unwrap_err();
            assert!(matches!(err, StrataError::Validation(_)));
            assert!(f.store.is_empty().await);
        }

        #[tokio::test]
        async fn reappend_only_updates_scores() {
            let f = fixture();
            let now = f.clock.now();
            let item = episode("deployed v2", "s1", now, 0.6);
            let id = item.id;
            f.store.append(Promoted::new(item.clone())).await.unwrap();

            let mut again = item;
            again.importance_score = 0.7;
            again.update_content("rewritten");
            f.store.append(Promoted::new(again)).await.unwrap();

            let stored = f.store.snapshot(id).await.unwrap();
            assert_eq!(stored.content().render(), "deployed v2");
            assert!((stored.importance_score - 0.7).abs() < 1e-6);
            assert_eq!(f.store.len().await, 1);
        }
    }

    mod replay {
        use super::*;

        #[tokio::test]
        async fn strict_temporal_order_within_session() {
            let f = fixture();
            let t0 = f.clock.now();
            let later = episode("second", "s1", t0 + chrono::Duration::seconds(5), 0.9);
            let earlier = episode("first", "s1", t0, 0.5);
            let other = episode("elsewhere", "s2", t0 + chrono::Duration::seconds(1), 0.9);

            for item in [later, other, earlier] {
                f.store.append(Promoted::new(item)).await.unwrap();
            }

            let replayed = f.store.replay(&session("s1")).await;
            let contents: Vec<_> = replayed.iter().map(|i| i.content().render().to_string()).collect();
            assert_eq!(contents, vec!["first", "second"]);
            assert!(replayed.iter().all(|i| i.access_count == 0));
        }
    }

    mod composite {
        use super::*;

        #[tokio::test]
        async fn filters_by_time_range_and_session() {
            let f = fixture();
            let t0 = f.clock.now() - chrono::Duration::hours(3);
            for (i, s) in ["s1", "s1", "s2"].iter().enumerate() {
                let at = t0 + chrono::Duration::hours(i as i64);
                f.store
                    .append(Promoted::new(episode(&format!("event {i}"), s, at, 0.8)))
                    .await
                    .unwrap();
            }

            let range = TimeRange::new(t0 + chrono::Duration::minutes(30), f.clock.now()).unwrap();
            let query = CompositeQuery::new(10).in_session(session("s1")).within(range);
            let results = f.store.query_composite(&query).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].item.content().render(), "event 1");
            assert_eq!(results[0].item.access_count, 1);
        }

        #[tokio::test]
        async fn ranks_by_similarity_importance_and_recency() {
            let f = fixture();
            let now = f.clock.now();
            let target = episode("incident postmortem", "s1", now, 0.6);
            let target_id = target.id;
            f.store.append(Promoted::new(target)).await.unwrap();
            f.store
                .append(Promoted::new(episode("lunch order", "s1", now, 0.9)))
                .await
                .unwrap();

            let query = CompositeQuery::new(1)
                .similar_to(f.embedder.vector_for("incident postmortem"));
            let results = f.store.query_composite(&query).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].item.id, target_id);
            assert!((results[0].similarity - 1.0).abs() < 1e-5);
        }

        #[tokio::test]
        async fn without_vector_prefers_recent_and_important() {
            let f = fixture();
            let now = f.clock.now();
            let old = episode("old", "s1", now - chrono::Duration::days(30), 0.9);
            let fresh = episode("fresh", "s1", now, 0.9);
            let fresh_id = fresh.id;
            f.store.append(Promoted::new(old)).await.unwrap();
            f.store.append(Promoted::new(fresh)).await.unwrap();

            let results = f.store.query_composite(&CompositeQuery::new(2)).await.unwrap();
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].item.id, fresh_id);
        }

        #[tokio::test]
        async fn restore_rebuilds_log_in_order() {
            let index: Arc<dyn SimilarityIndex> =
                Arc::new(InMemoryIndex::new(Tier::Episodic.collection()));
            let first = EpisodicStore::new(
                index.clone(),
                Arc::new(MockEmbedder::new(64)),
                Arc::new(ManualClock::default()),
                &Config::default(),
            );
            let t0 = Utc::now();
            for (i, text) in ["alarm", "rollback", "all clear"].iter().enumerate() {
                let at = t0 + chrono::Duration::seconds(i as i64);
                first
                    .append(Promoted::new(episode(text, "s1", at, 0.8)))
                    .await
                    .unwrap();
            }

            let second = EpisodicStore::new(
                index,
                Arc::new(MockEmbedder::new(64)),
                Arc::new(ManualClock::default()),
                &Config::default(),
            );
            assert_eq!(second.restore().await.unwrap(), 3);
            let contents: Vec<_> = second
                .replay(&session("s1"))
                .await
                .iter()
                .map(|i| i.content().render().to_string())
                .collect();
            assert_eq!(contents, vec!["alarm", "rollback", "all clear"]);
        }

        #[test]
        fn time_range_rejects_inverted_bounds() {
            let now = Utc::now();
            assert!(TimeRange::new(now, now - chrono::Duration::seconds(1)).is_err());
            let r = TimeRange::new(now, now + chrono::Duration::seconds(1)).unwrap();
            assert!(r.contains(now));
            assert!(!r.contains(now + chrono::Duration::seconds(1)));
        }
    }
}
