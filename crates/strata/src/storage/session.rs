//! Session store (short-term memory)
//!
//! Items live per session behind a per-session async mutex, so the novelty
//! lookup and the conditional insert that follows it are atomic with respect
//! to other writers in the same session while unrelated sessions proceed in
//! parallel. Nothing is deleted here except through the consolidation
//! pipeline, which holds the same lock while it decides an item's fate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::ScoredItem;
use crate::clock::Clock;
use crate::config::{Config, ScoringConfig};
use crate::embedding::{EmbeddingPort, ensure_embedding};
use crate::error::{Result, StrataError};
use crate::index::{IndexFilter, IndexMetadata, SimilarityIndex};
use crate::memory::scoring::{self, ScoreInputs};
use crate::memory::session_id::SessionId;
use crate::memory::types::{Content, ItemId, MemoryItem, Tier};

/// Neighbours fetched for the novelty check. One extra in case the item's own
/// previous vector comes back first on a re-put.
const NOVELTY_NEIGHBOURS: usize = 2;

/// Result of [`SessionStore::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted(ItemId),
    /// A near-duplicate already existed; it was boosted instead
    Merged { into: ItemId },
}

/// Items belonging to one session
#[derive(Debug, Default)]
pub(crate) struct SessionShard {
    items: HashMap<ItemId, MemoryItem>,
}

impl SessionShard {
    pub(crate) fn get(&self, id: &ItemId) -> Option<&MemoryItem> {
        self.items.get(id)
    }
}

pub struct SessionStore {
    index: Arc<dyn SimilarityIndex>,
    embedder: Arc<dyn EmbeddingPort>,
    clock: Arc<dyn Clock>,
    scoring: ScoringConfig,
    embed_timeout: Duration,
    max_content_bytes: usize,
    shards: DashMap<SessionId, Arc<Mutex<SessionShard>>>,
    owners: DashMap<ItemId, SessionId>,
}

impl SessionStore {
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
            shards: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Store an item in its session with the given time-to-live.
    ///
    /// Runs the novelty check first: if another item in the same session is
    /// more similar than `novelty_threshold`, that item is boosted and the
    /// new one is not stored.
    pub async fn put(&self, mut item: MemoryItem, ttl: chrono::Duration) -> Result<PutOutcome> {
        if ttl <= chrono::Duration::zero() {
            return Err(StrataError::Validation(
                "Session items require a positive ttl".to_string(),
            ));
        }
        item.validate(self.max_content_bytes)?;
        let session_id = item.session_id.clone().ok_or_else(|| {
            StrataError::Validation(format!("Item {} has no session id", item.id))
        })?;

        let now = self.clock.now();
        item.tier = Tier::Session;
        item.ttl = Some(now + ttl);
        item.ephemeral = false;

        let embedded = match ensure_embedding(self.embedder.as_ref(), &mut item, self.embed_timeout)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_retryable() => {
                warn!("Storing {} without embedding: {e}", item.id);
                false
            }
            Err(e) => return Err(e),
        };

        let shard = self.shard(&session_id);
        let mut shard = shard.lock().await;

        if let Some(owner) = self.owners.get(&item.id).map(|r| r.value().clone()) {
            if owner != session_id {
                return Err(StrataError::Validation(format!(
                    "Item {} already belongs to session {owner}",
                    item.id
                )));
            }
        }

        let mut novelty = 0.0;
        if embedded {
            let vector = item.fresh_embedding().unwrap_or_default();
            let filter = IndexFilter::new().with_session(session_id.clone());
            let hits = self.index.query(vector, NOVELTY_NEIGHBOURS, &filter).await?;
            let nearest = hits
                .into_iter()
                .find(|hit| hit.id != item.id && shard.items.contains_key(&hit.id));

            if let Some(hit) = nearest {
                if scoring::is_near_duplicate(hit.score, &self.scoring) {
                    if let Some(existing) = shard.items.get_mut(&hit.id) {
                        scoring::merge_boost(existing, &self.scoring, now);
                        debug!(
                            "Merged {} into {} (similarity {:.3})",
                            item.id, hit.id, hit.score
                        );
                        return Ok(PutOutcome::Merged { into: hit.id });
                    }
                }
                novelty = scoring::novelty_from_similarity(Some(hit.score));
            } else {
                novelty = scoring::novelty_from_similarity(None);
            }
        }

        item.set_importance(scoring::importance(
            &ScoreInputs::for_item(&item, novelty),
            &self.scoring,
        ));

        match item.fresh_embedding() {
            Some(vector) => {
                self.index
                    .upsert(item.id, vector, IndexMetadata::for_item(&item))
                    .await?
            }
            None if shard.items.contains_key(&item.id) => {
                self.index.delete(item.id).await?;
            }
            None => {}
        }

        let id = item.id;
        self.owners.insert(id, session_id);
        shard.items.insert(id, item);
        Ok(PutOutcome::Inserted(id))
    }

    /// Fetch an item by id. Counts as a retrieval.
    pub async fn get(&self, id: ItemId) -> Option<MemoryItem> {
        let session_id = self.owners.get(&id).map(|r| r.value().clone())?;
        let shard = self.existing_shard(&session_id)?;
        let mut shard = shard.lock().await;
        let item = shard.items.get_mut(&id)?;
        scoring::reconsolidate(item, &self.scoring, self.clock.now());
        Some(item.clone())
    }

    /// Read an item without touching its access statistics.
    pub async fn snapshot(&self, id: ItemId) -> Option<MemoryItem> {
        let session_id = self.owners.get(&id).map(|r| r.value().clone())?;
        let shard = self.existing_shard(&session_id)?;
        let shard = shard.lock().await;
        shard.items.get(&id).cloned()
    }

    /// Nearest items within one session. Each returned item is reconsolidated.
    pub async fn semantic_search(
        &self,
        session_id: &SessionId,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredItem>> {
        let Some(shard) = self.existing_shard(session_id) else {
            return Ok(Vec::new());
        };
        let mut shard = shard.lock().await;

        let filter = IndexFilter::new().with_session(session_id.clone());
        let hits = self.index.query(query_vector, top_k, &filter).await?;
        let now = self.clock.now();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.metadata.session_id.as_ref() != Some(session_id) {
                warn!(
                    "Index {} returned {} from another session for {session_id}; dropped",
                    self.index.collection(),
                    hit.id
                );
                continue;
            }
            if let Some(item) = shard.items.get_mut(&hit.id) {
                scoring::reconsolidate(item, &self.scoring, now);
                results.push(ScoredItem {
                    item: item.clone(),
                    similarity: hit.score,
                });
            }
        }
        Ok(results)
    }

    /// Items whose ttl elapsed at or before `before`, ordered by deadline.
    pub async fn scan_expiring(&self, before: DateTime<Utc>) -> Vec<MemoryItem> {
        let shards: Vec<Arc<Mutex<SessionShard>>> =
            self.shards.iter().map(|e| Arc::clone(e.value())).collect();

        let mut expiring = Vec::new();
        for shard in shards {
            let shard = shard.lock().await;
            expiring.extend(shard.items.values().filter(|i| i.is_expired(before)).cloned());
        }
        expiring.sort_by(|a, b| a.ttl.cmp(&b.ttl).then_with(|| a.id.cmp(&b.id)));
        expiring
    }

    /// Replace an item's content before it is consolidated. The embedding is
    /// recomputed when the port is reachable and left stale otherwise.
    pub async fn update_content(&self, id: ItemId, content: impl Into<Content>) -> Result<()> {
        let content = content.into();
        let session_id = self
            .owners
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StrataError::NotFound(format!("Session item {id}")))?;
        let shard = self
            .existing_shard(&session_id)
            .ok_or_else(|| StrataError::NotFound(format!("Session {session_id}")))?;
        let mut shard = shard.lock().await;
        let item = shard
            .items
            .get_mut(&id)
            .ok_or_else(|| StrataError::NotFound(format!("Session item {id}")))?;

        let mut updated = item.clone();
        updated.update_content(content);
        updated.validate(self.max_content_bytes)?;

        match ensure_embedding(self.embedder.as_ref(), &mut updated, self.embed_timeout).await {
            Ok(()) => {
                if let Some(vector) = updated.fresh_embedding() {
                    self.index
                        .upsert(id, vector, IndexMetadata::for_item(&updated))
                        .await?;
                }
            }
            Err(e) if e.is_retryable() => {
                warn!("Embedding for {id} left stale: {e}");
            }
            Err(e) => return Err(e),
        }

        *item = updated;
        Ok(())
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.owners.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub async fn session_len(&self, session_id: &SessionId) -> usize {
        match self.existing_shard(session_id) {
            Some(shard) => shard.lock().await.items.len(),
            None => 0,
        }
    }

    /// Session currently holding `id`.
    pub(crate) fn owner(&self, id: ItemId) -> Option<SessionId> {
        self.owners.get(&id).map(|r| r.value().clone())
    }

    /// Take the session's lock for the duration of a consolidation decision.
    pub(crate) async fn lock_session(
        &self,
        session_id: &SessionId,
    ) -> Option<OwnedMutexGuard<SessionShard>> {
        let shard = self.existing_shard(session_id)?;
        Some(shard.lock_owned().await)
    }

    /// Remove an item while holding its session's lock. The index entry goes
    /// first so a failure leaves the item in place for the next attempt.
    pub(crate) async fn prune_locked(
        &self,
        shard: &mut SessionShard,
        id: ItemId,
    ) -> Result<Option<MemoryItem>> {
        self.index.delete(id).await?;
        let removed = shard.items.remove(&id);
        if removed.is_some() {
            self.owners.remove(&id);
        }
        Ok(removed)
    }

    fn shard(&self, session_id: &SessionId) -> Arc<Mutex<SessionShard>> {
        Arc::clone(
            self.shards
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionShard::default())))
                .value(),
        )
    }

    fn existing_shard(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionShard>>> {
        self.shards.get(session_id).map(|e| Arc::clone(e.value()))
    }
}
