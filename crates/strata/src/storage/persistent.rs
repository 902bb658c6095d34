//! Persistent store (long-term memory)
//!
//! Only items that cleared the consolidation gate land here, delivered as
//! [`Promoted`] values. Every retrieval strengthens the retrieved item.
//!
//! The index row of each item carries the whole item, so [`PersistentStore::restore`]
//! rebuilds the store from a durable index after a restart. Every change to
//! an item is written back to its row.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Promoted, ScoredItem};
use crate::clock::Clock;
use crate::config::{Config, ScoringConfig};
use crate::embedding::{EmbeddingPort, ensure_embedding};
use crate::error::{Result, StrataError};
use crate::index::{IndexFilter, IndexHit, IndexMetadata, SimilarityIndex};
use crate::memory::scoring;
use crate::memory::session_id::SessionId;
use crate::memory::types::{ItemId, MemoryItem, Tier};

/// Candidates fetched per requested result when a post-filter applies
const CANDIDATE_MULTIPLIER: usize = 3;

/// Neighbours fetched for the novelty check; rows without a live item are skipped.
const NOVELTY_NEIGHBOURS: usize = 4;

/// Structured constraints for [`PersistentStore::semantic_search`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistentFilter {
    pub session_id: Option<SessionId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_importance: Option<f32>,
}

impl PersistentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn with_min_importance(mut self, min: f32) -> Self {
        self.min_importance = Some(min);
        self
    }

    fn index_filter(&self) -> IndexFilter {
        IndexFilter {
            session_id: self.session_id.clone(),
            source_task_id: None,
            created_after: self.created_after,
            created_before: self.created_before,
        }
    }
}

pub struct PersistentStore {
    index: Arc<dyn SimilarityIndex>,
    embedder: Arc<dyn EmbeddingPort>,
    clock: Arc<dyn Clock>,
    scoring: ScoringConfig,
    embed_timeout: Duration,
    max_content_bytes: usize,
    items: RwLock<HashMap<ItemId, MemoryItem>>,
}

impl PersistentStore {
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
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a promoted item. Re-embeds stale or missing vectors
    /// before writing; replaying the same item leaves the same state.
    pub async fn upsert(&self, promoted: Promoted) -> Result<()> {
        let mut item = promoted.into_inner();
        item.validate(self.max_content_bytes)?;
        if item.importance_score < self.scoring.promotion_threshold {
            return Err(StrataError::Validation(format!(
                "Item {} scored {:.3}, below promotion threshold {:.3}",
                item.id, item.importance_score, self.scoring.promotion_threshold
            )));
        }

        item.tier = Tier::Persistent;
        item.ttl = None;
        ensure_embedding(self.embedder.as_ref(), &mut item, self.embed_timeout).await?;

        self.write_row(&item).await?;

        debug!("Persisted {} (importance {:.3})", item.id, item.importance_score);
        self.items.write().await.insert(item.id, item);
        Ok(())
    }

    /// Reload every item whose index row carries a record. Items already
    /// present are kept as they are. Returns the number of items loaded.
    pub async fn restore(&self) -> Result<usize> {
        let entries = self.index.scan().await?;
        let mut items = self.items.write().await;
        let mut restored = 0;
        for entry in entries {
            let mut item = match entry.metadata.decode_record() {
                Ok(Some(item)) if item.id == entry.id => item,
                Ok(_) => {
                    warn!("Index row {} has no usable record; skipped", entry.id);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to decode record {}: {e}", entry.id);
                    continue;
                }
            };
            item.tier = Tier::Persistent;
            item.ttl = None;
            if let std::collections::hash_map::Entry::Vacant(slot) = items.entry(item.id) {
                slot.insert(item);
                restored += 1;
            }
        }
        info!("Restored {restored} items from {}", self.index.collection());
        Ok(restored)
    }

    /// Fetch an item by id. Counts as a retrieval.
    pub async fn get(&self, id: ItemId) -> Option<MemoryItem> {
        let item = {
            let mut items = self.items.write().await;
            let item = items.get_mut(&id)?;
            scoring::reconsolidate(item, &self.scoring, self.clock.now());
            item.clone()
        };
        self.write_back(std::slice::from_ref(&item)).await;
        Some(item)
    }

    /// Read an item without touching its access statistics.
    pub async fn snapshot(&self, id: ItemId) -> Option<MemoryItem> {
        self.items.read().await.get(&id).cloned()
    }

    /// Nearest items matching `filter`. Each returned item is reconsolidated.
    pub async fn semantic_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &PersistentFilter,
    ) -> Result<Vec<ScoredItem>> {
        let fetch = if filter.min_importance.is_some() {
            top_k.saturating_mul(CANDIDATE_MULTIPLIER)
        } else {
            top_k
        };
        let hits = self
            .index
            .query(query_vector, fetch, &filter.index_filter())
            .await?;

        let now = self.clock.now();
        let mut results = Vec::with_capacity(top_k.min(hits.len()));
        {
            let mut items = self.items.write().await;
            for hit in hits {
                if results.len() == top_k {
                    break;
                }
                let Some(item) = items.get_mut(&hit.id) else {
                    continue;
                };
                if filter
                    .min_importance
                    .is_some_and(|min| item.importance_score < min)
                {
                    continue;
                }
                scoring::reconsolidate(item, &self.scoring, now);
                results.push(ScoredItem {
                    item: item.clone(),
                    similarity: hit.score,
                });
            }
        }

        let touched: Vec<MemoryItem> = results.iter().map(|r| r.item.clone()).collect();
        self.write_back(&touched).await;
        Ok(results)
    }

    pub async fn contains(&self, id: ItemId) -> bool {
        self.items.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.items.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Closest stored item other than `exclude`. Index rows with no item
    /// behind them are ignored.
    pub(crate) async fn nearest_other(
        &self,
        vector: &[f32],
        exclude: ItemId,
    ) -> Result<Option<IndexHit>> {
        let hits = self
            .index
            .query(vector, NOVELTY_NEIGHBOURS, &IndexFilter::new())
            .await?;
        let items = self.items.read().await;
        Ok(hits
            .into_iter()
            .find(|hit| hit.id != exclude && items.contains_key(&hit.id)))
    }

    /// Fold a discarded near-duplicate into an existing item.
    pub(crate) async fn merge_duplicate(&self, id: ItemId, now: DateTime<Utc>) -> Result<()> {
        let mut items = self.items.write().await;
        let mut merged = items
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("Persistent item {id}")))?;
        scoring::merge_boost(&mut merged, &self.scoring, now);
        self.write_row(&merged).await?;
        items.insert(id, merged);
        Ok(())
    }

    /// Multiply every importance score by `factor`. Returns the item count.
    pub(crate) async fn decay(&self, factor: f32) -> usize {
        let decayed: Vec<MemoryItem> = {
            let mut items = self.items.write().await;
            items
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

    /// Best-effort row refresh after a score change. A failure only leaves the
    /// durable copy with older statistics.
    async fn write_back(&self, items: &[MemoryItem]) {
        for item in items {
            if let Err(e) = self.write_row(item).await {
                warn!("Failed to write back {}: {e}", item.id);
            }
        }
    }
}
