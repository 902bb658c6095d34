//! Active buffer (working memory)
//!
//! A small in-process map bounded by item count and aggregate token size.
//! When a write would overflow either bound, the lowest-ranked residents are
//! evicted first and handed to an [`EvictionSink`], normally the
//! consolidation queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::persistent::{PersistentFilter, PersistentStore};
use super::session::SessionStore;
use crate::clock::Clock;
use crate::config::{ActiveConfig, Config, ScoringConfig};
use crate::embedding::{EMBEDDING_BACKEND, EmbeddingPort, embed_bounded};
use crate::error::{Result, StrataError};
use crate::memory::scoring;
use crate::memory::session_id::SessionId;
use crate::memory::types::{ItemId, MemoryItem, Tier};

const SESSION_BACKEND: &str = "session";
const PERSISTENT_BACKEND: &str = "persistent";

/// Receives items pushed out of an active buffer
pub trait EvictionSink: Send + Sync {
    fn dispatch(&self, item: MemoryItem);
}

/// Tiers an active buffer pulls from during [`ActiveBuffer::assemble`]
#[derive(Clone)]
pub struct AssemblySources {
    pub session: Arc<SessionStore>,
    pub persistent: Arc<PersistentStore>,
    pub embedder: Arc<dyn EmbeddingPort>,
}

/// Result of [`ActiveBuffer::assemble`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    /// Ranked best-first
    pub items: Vec<MemoryItem>,
    pub tokens: usize,
    /// True when at least one backend failed or timed out
    pub partial: bool,
    /// Backends that failed or timed out
    pub degraded: Vec<&'static str>,
}

impl AssembledContext {
    fn degrade(&mut self, backend: &'static str) {
        self.partial = true;
        if !self.degraded.contains(&backend) {
            self.degraded.push(backend);
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    items: HashMap<ItemId, MemoryItem>,
    tokens: usize,
}

pub struct ActiveBuffer {
    config: ActiveConfig,
    scoring: ScoringConfig,
    max_content_bytes: usize,
    embed_timeout: Duration,
    session_id: Option<SessionId>,
    sources: Option<AssemblySources>,
    sink: Arc<dyn EvictionSink>,
    clock: Arc<dyn Clock>,
    state: RwLock<BufferState>,
}

impl ActiveBuffer {
    pub fn new(config: &Config, sink: Arc<dyn EvictionSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.active,
            scoring: config.scoring,
            max_content_bytes: config.storage.max_content_bytes,
            embed_timeout: config.embedding.timeout(),
            session_id: None,
            sources: None,
            sink,
            clock,
            state: RwLock::new(BufferState::default()),
        }
    }

    /// Session searched during assembly
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_sources(mut self, sources: AssemblySources) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Read a resident item. Does not count as a retrieval.
    pub async fn read(&self, id: ItemId) -> Option<MemoryItem> {
        self.state.read().await.items.get(&id).cloned()
    }

    /// Insert or replace an item, evicting the lowest-ranked residents until
    /// it fits both the item count and the token budget.
    pub async fn write(&self, mut item: MemoryItem) -> Result<()> {
        item.validate(self.max_content_bytes)?;
        let size = item.size_tokens();
        if size > self.config.token_budget {
            return Err(StrataError::Validation(format!(
                "Item {} needs {size} tokens, buffer budget is {}",
                item.id, self.config.token_budget
            )));
        }
        item.tier = Tier::Active;

        let victims = {
            let mut state = self.state.write().await;

            let replaced = state.items.get(&item.id).map(MemoryItem::size_tokens);
            let mut count = state.items.len() - usize::from(replaced.is_some());
            let mut tokens = state.tokens - replaced.unwrap_or(0);

            let mut ranked: Vec<&MemoryItem> =
                state.items.values().filter(|r| r.id != item.id).collect();
            ranked.sort_by(|a, b| eviction_order(a, b));

            let mut victims = Vec::new();
            for resident in ranked {
                if self.fits(count, tokens, size) {
                    break;
                }
                victims.push(resident.id);
                count -= 1;
                tokens -= resident.size_tokens();
            }

            if !self.fits(count, tokens, size) {
                error!(
                    "Active buffer cannot hold {} ({size} tokens) with capacity {} and budget {}",
                    item.id, self.config.capacity, self.config.token_budget
                );
                return Err(StrataError::CapacityExceeded(format!(
                    "Item {} does not fit in an empty buffer",
                    item.id
                )));
            }

            let victims: Vec<MemoryItem> = victims
                .iter()
                .filter_map(|id| state.items.remove(id))
                .collect();
            if let Some(old) = state.items.insert(item.id, item) {
                state.tokens -= old.size_tokens();
            }
            state.tokens = state.tokens + size - victims.iter().map(MemoryItem::size_tokens).sum::<usize>();
            victims
        };

        for victim in victims {
            self.dispatch(victim);
        }
        Ok(())
    }

    /// Remove a resident and hand it to the sink.
    pub async fn evict(&self, id: ItemId) -> Option<MemoryItem> {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.items.remove(&id)?;
            state.tokens -= removed.size_tokens();
            removed
        };
        self.dispatch(removed.clone());
        Some(removed)
    }

    /// Evict every resident.
    pub async fn clear(&self) -> usize {
        let drained: Vec<MemoryItem> = {
            let mut state = self.state.write().await;
            state.tokens = 0;
            state.items.drain().map(|(_, item)| item).collect()
        };
        let count = drained.len();
        for item in drained {
            self.dispatch(item);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    pub async fn token_usage(&self) -> usize {
        self.state.read().await.tokens
    }

    /// Residents ranked best-first by importance and recency.
    pub async fn items(&self) -> Vec<MemoryItem> {
        let now = self.clock.now();
        let mut items: Vec<MemoryItem> = self.state.read().await.items.values().cloned().collect();
        items.sort_by(|a, b| {
            let ra = self.assembly_rank(a, now);
            let rb = self.assembly_rank(b, now);
            rb.total_cmp(&ra).then_with(|| a.id.cmp(&b.id))
        });
        items
    }

    /// Build a context for `query` from residents plus session and
    /// persistent hits, packed into `token_budget`.
    ///
    /// Backend failures and timeouts degrade the result instead of failing
    /// it: residents are always returned.
    pub async fn assemble(&self, query: &str, token_budget: usize) -> AssembledContext {
        let mut context = AssembledContext::default();
        let mut candidates: HashMap<ItemId, MemoryItem> = self
            .state
            .read()
            .await
            .items
            .iter()
            .map(|(id, item)| (*id, item.clone()))
            .collect();

        if let Some(sources) = &self.sources {
            let retrieved = self.retrieve(sources, query, &mut context).await;
            for item in retrieved {
                candidates.entry(item.id).or_insert(item);
            }
        }

        let now = self.clock.now();
        let mut ranked: Vec<(f32, MemoryItem)> = candidates
            .into_values()
            .map(|item| (self.assembly_rank(&item, now), item))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

        for (_, item) in ranked {
            let size = item.size_tokens();
            if context.tokens + size > token_budget {
                continue;
            }
            context.tokens += size;
            context.items.push(item);
        }

        if context.partial {
            warn!(
                "Assembled partial context ({} items) without {:?}",
                context.items.len(),
                context.degraded
            );
        }
        context
    }

    async fn retrieve(
        &self,
        sources: &AssemblySources,
        query: &str,
        context: &mut AssembledContext,
    ) -> Vec<MemoryItem> {
        let deadline = self.config.assemble_timeout();
        let embed_deadline = deadline.min(self.embed_timeout);

        let vector = match embed_bounded(sources.embedder.as_ref(), query, embed_deadline).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!("Query embedding failed during assembly: {e}");
                context.degrade(EMBEDDING_BACKEND);
                return Vec::new();
            }
        };

        let top_k = self.config.top_k;
        let mut retrieved = Vec::new();
        let mut relevant = 0;

        if let Some(session_id) = &self.session_id {
            let search = sources.session.semantic_search(session_id, &vector, top_k);
            match tokio::time::timeout(deadline, search).await {
                Ok(Ok(hits)) => {
                    relevant = hits
                        .iter()
                        .filter(|h| h.similarity >= self.config.relevance_threshold)
                        .count();
                    retrieved.extend(hits.into_iter().map(|h| h.item));
                }
                Ok(Err(e)) => {
                    warn!("Session search failed during assembly: {e}");
                    context.degrade(SESSION_BACKEND);
                }
                Err(_) => {
                    warn!("Session search timed out after {}ms", deadline.as_millis());
                    context.degrade(SESSION_BACKEND);
                }
            }
        }

        if relevant < top_k {
            let filter = PersistentFilter::new();
            let search = sources.persistent.semantic_search(&vector, top_k, &filter);
            match tokio::time::timeout(deadline, search).await {
                Ok(Ok(hits)) => retrieved.extend(hits.into_iter().map(|h| h.item)),
                Ok(Err(e)) => {
                    warn!("Persistent search failed during assembly: {e}");
                    context.degrade(PERSISTENT_BACKEND);
                }
                Err(_) => {
                    warn!("Persistent search timed out after {}ms", deadline.as_millis());
                    context.degrade(PERSISTENT_BACKEND);
                }
            }
        }

        debug!("Assembly retrieved {} items ({relevant} relevant in session)", retrieved.len());
        retrieved
    }

    fn fits(&self, count: usize, tokens: usize, size: usize) -> bool {
        count < self.config.capacity && tokens + size <= self.config.token_budget
    }

    fn assembly_rank(&self, item: &MemoryItem, now: chrono::DateTime<chrono::Utc>) -> f32 {
        item.importance_score * scoring::recency_decay(now - item.last_accessed_at, &self.scoring)
    }

    fn dispatch(&self, item: MemoryItem) {
        if item.ephemeral {
            debug!("Dropped ephemeral item {}", item.id);
        } else {
            debug!("Evicted {} (importance {:.3})", item.id, item.importance_score);
            self.sink.dispatch(item);
        }
    }
}

/// Lowest importance first, then oldest, then id.
fn eviction_order(a: &MemoryItem, b: &MemoryItem) -> std::cmp::Ordering {
    a.importance_score
        .total_cmp(&b.importance_score)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndex;
    use crate::storage::Promoted;
    use crate::testing::{CollectingSink, ManualClock, MockEmbedder, ToggleIndex};

    fn config(capacity: usize, token_budget: usize) -> Config {
        let mut config = Config::default();
        config.active.capacity = capacity;
        config.active.token_budget = token_budget;
        config
    }

    fn buffer(capacity: usize, token_budget: usize) -> (ActiveBuffer, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let buffer = ActiveBuffer::new(
            &config(capacity, token_budget),
            sink.clone(),
            Arc::new(ManualClock::default()),
        );
        (buffer, sink)
    }

    mod write {
        use super::*;

        #[tokio::test]
        async fn evicts_lowest_importance_at_capacity() {
            let (buffer, sink) = buffer(3, 1000);
            let low = MemoryItem::new("low").with_importance(0.1);
            let low_id = low.id;
            buffer.write(low).await.unwrap();
            buffer.write(MemoryItem::new("mid").with_importance(0.5)).await.unwrap();
            buffer.write(MemoryItem::new("high").with_importance(0.9)).await.unwrap();

            buffer.write(MemoryItem::new("new").with_importance(0.4)).await.unwrap();

            assert_eq!(buffer.len().await, 3);
            assert!(buffer.read(low_id).await.is_none());
            assert_eq!(sink.ids(), vec![low_id]);
        }

        #[tokio::test]
        async fn ties_break_by_created_at_then_id() {
            let (buffer, sink) = buffer(2, 1000);
            let now = chrono::Utc::now();
            let older = MemoryItem::new("older")
                .with_importance(0.5)
                .with_created_at(now - chrono::Duration::seconds(10));
            let older_id = older.id;
            buffer.write(MemoryItem::new("newer").with_importance(0.5).with_created_at(now))
                .await
                .unwrap();
            buffer.write(older).await.unwrap();

            buffer.write(MemoryItem::new("third").with_importance(0.5)).await.unwrap();
            assert_eq!(sink.ids(), vec![older_id]);
        }

        #[tokio::test]
        async fn token_budget_forces_multiple_evictions() {
            let (buffer, sink) = buffer(10, 10);
            buffer.write(MemoryItem::new("a".repeat(16)).with_importance(0.2)).await.unwrap();
            buffer.write(MemoryItem::new("b".repeat(16)).with_importance(0.3)).await.unwrap();
            assert_eq!(buffer.token_usage().await, 8);

            buffer.write(MemoryItem::new("c".repeat(36)).with_importance(0.9)).await.unwrap();
            assert_eq!(sink.len(), 2);
            assert_eq!(buffer.len().await, 1);
            assert_eq!(buffer.token_usage().await, 9);
        }

        #[tokio::test]
        async fn rewrite_replaces_in_place() {
            let (buffer, sink) = buffer(2, 1000);
            let mut item = MemoryItem::new("v1").with_importance(0.5);
            buffer.write(item.clone()).await.unwrap();
            buffer.write(MemoryItem::new("other").with_importance(0.1)).await.unwrap();

            item.update_content("version two");
            buffer.write(item.clone()).await.unwrap();

            assert!(sink.is_empty(), "replacing must not evict");
            let stored = buffer.read(item.id).await.unwrap();
            assert_eq!(stored.content().render(), "version two");
            assert_eq!(buffer.token_usage().await, 3 + 2);
        }

        #[tokio::test]
        async fn ephemeral_items_are_dropped_not_dispatched() {
            let (buffer, sink) = buffer(1, 1000);
            buffer.write(MemoryItem::new("scratch").ephemeral()).await.unwrap();
            buffer.write(MemoryItem::new("keeper").with_importance(0.5)).await.unwrap();
            assert!(sink.is_empty());
            assert_eq!(buffer.len().await, 1);
        }

        #[tokio::test]
        async fn oversized_item_is_rejected() {
            let (buffer, _) = buffer(4, 2);
            let err = buffer.write(MemoryItem::new("x".repeat(40))).await.unwrap_err();
            assert!(matches!(err, StrataError::Validation(_)));
            assert!(buffer.is_empty().await);
        }

        #[tokio::test]
        async fn zero_capacity_reports_capacity_exceeded() {
            let (buffer, _) = buffer(0, 100);
            let err = buffer.write(MemoryItem::new("x")).await.unwrap_err();
            assert!(matches!(err, StrataError::CapacityExceeded(_)));
        }
    }

    mod evict {
        use super::*;

        #[tokio::test]
        async fn explicit_evict_dispatches() {
            let (buffer, sink) = buffer(4, 100);
            let item = MemoryItem::new("bye");
            let id = item.id;
            buffer.write(item).await.unwrap();

            assert!(buffer.evict(id).await.is_some());
            assert!(buffer.evict(id).await.is_none());
            assert_eq!(sink.ids(), vec![id]);
            assert_eq!(buffer.token_usage().await, 0);
        }

        #[tokio::test]
        async fn clear_dispatches_non_ephemeral() {
            let (buffer, sink) = buffer(4, 100);
            buffer.write(MemoryItem::new("one")).await.unwrap();
            buffer.write(MemoryItem::new("two").ephemeral()).await.unwrap();
            assert_eq!(buffer.clear().await, 2);
            assert_eq!(sink.len(), 1);
            assert!(buffer.is_empty().await);
        }
    }

    mod assemble {
        use super::*;

        struct Fixture {
            buffer: ActiveBuffer,
            session: Arc<SessionStore>,
            persistent: Arc<PersistentStore>,
            embedder: Arc<MockEmbedder>,
            persistent_index: Arc<ToggleIndex>,
        }

        fn fixture() -> Fixture {
            let config = Config::default();
            let clock = Arc::new(ManualClock::default());
            let embedder = Arc::new(MockEmbedder::new(32));
            let session = Arc::new(SessionStore::new(
                Arc::new(InMemoryIndex::new(Tier::Session.collection())),
                embedder.clone(),
                clock.clone(),
                &config,
            ));
            let persistent_index = Arc::new(ToggleIndex::new(InMemoryIndex::new(
                Tier::Persistent.collection(),
            )));
            let persistent = Arc::new(PersistentStore::new(
                persistent_index.clone(),
                embedder.clone(),
                clock.clone(),
                &config,
            ));
            let buffer = ActiveBuffer::new(&config, Arc::new(CollectingSink::default()), clock)
                .with_session(SessionId::try_from("s1").unwrap())
                .with_sources(AssemblySources {
                    session: session.clone(),
                    persistent: persistent.clone(),
                    embedder: embedder.clone(),
                });
            Fixture {
                buffer,
                session,
                persistent,
                embedder,
                persistent_index,
            }
        }

        #[tokio::test]
        async fn merges_tiers_and_dedupes_residents() {
            let f = fixture();
            let resident = MemoryItem::new("resident note").with_importance(0.9);
            f.buffer.write(resident.clone()).await.unwrap();
            f.session
                .put(
                    MemoryItem::new("session note").with_session(SessionId::try_from("s1").unwrap()),
                    chrono::Duration::minutes(5),
                )
                .await
                .unwrap();
            f.persistent
                .upsert(Promoted::new(MemoryItem::new("long-term fact").with_importance(0.8)))
                .await
                .unwrap();

            let context = f.buffer.assemble("session note", 1000).await;
            assert!(!context.partial);
            assert_eq!(context.items.len(), 3);
            assert_eq!(context.items[0].id, resident.id);
            assert_eq!(
                context.tokens,
                context.items.iter().map(MemoryItem::size_tokens).sum::<usize>()
            );
        }

        #[tokio::test]
        async fn respects_token_budget() {
            let f = fixture();
            f.buffer.write(MemoryItem::new("a".repeat(40)).with_importance(0.9)).await.unwrap();
            f.buffer.write(MemoryItem::new("b".repeat(8)).with_importance(0.1)).await.unwrap();

            let context = f.buffer.assemble("anything", 5).await;
            assert_eq!(context.items.len(), 1);
            assert_eq!(context.tokens, 2);
        }

        #[tokio::test]
        async fn embedding_outage_returns_residents() {
            let f = fixture();
            f.buffer.write(MemoryItem::new("still here")).await.unwrap();
            f.embedder.set_available(false);

            let context = f.buffer.assemble("query", 1000).await;
            assert!(context.partial);
            assert_eq!(context.degraded, vec![EMBEDDING_BACKEND]);
            assert_eq!(context.items.len(), 1);
        }

        #[tokio::test]
        async fn persistent_outage_is_reported() {
            let f = fixture();
            f.persistent_index.set_available(false);

            let context = f.buffer.assemble("query", 1000).await;
            assert!(context.partial);
            assert_eq!(context.degraded, vec![PERSISTENT_BACKEND]);
        }
    }
}
