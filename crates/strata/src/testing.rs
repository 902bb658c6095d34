//! Test utilities for strata - deterministic doubles for the external ports
//!
//! - [`MockEmbedder`]: hash-derived vectors, pinned vectors, availability toggle
//! - [`ManualClock`]: a clock that only moves when told to
//! - [`ToggleIndex`]: wraps any index and can be switched off
//! - [`CollectingSink`]: records everything an active buffer evicts

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::embedding::{EMBEDDING_BACKEND, EmbeddingPort};
use crate::error::{Result, StrataError};
use crate::index::{IndexEntry, IndexFilter, IndexHit, IndexMetadata, SimilarityIndex};
use crate::memory::types::{ItemId, MemoryItem};
use crate::storage::EvictionSink;

/// Mock embedding port for fast tests that don't need real ML.
/// Produces deterministic vectors in [-1, 1] from a hash of the input text.
#[derive(Debug)]
pub struct MockEmbedder {
    dimension: usize,
    pinned: HashMap<String, Vec<f32>>,
    available: AtomicBool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            pinned: HashMap::new(),
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer `vector` for `text`. Lets tests place items at a known
    /// similarity to each other.
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.pinned.insert(text.into(), vector);
        self
    }

    /// While unavailable every call fails with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `embed` calls so far, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The vector this mock returns for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(vector) = self.pinned.get(text) {
            return vector.clone();
        }

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        (0..self.dimension)
            .map(|i| {
                // splitmix64 over seed + index
                let mut x = seed.wrapping_add((i as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15));
                x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
                x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
                x ^= x >> 31;
                let normalized = (x as f64 / u64::MAX as f64) as f32;
                (normalized * 2.0) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingPort for MockEmbedder {
    async fn embed(&self, content: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(StrataError::unavailable(EMBEDDING_BACKEND, "mock embedder offline"));
        }
        Ok(self.vector_for(content))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Clock that starts at construction time and advances only on request
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Index wrapper whose backend can be switched off, and whose deletes can
/// be failed separately to simulate a crash between write and prune.
pub struct ToggleIndex {
    inner: Arc<dyn SimilarityIndex>,
    available: AtomicBool,
    fail_deletes: AtomicBool,
}

impl ToggleIndex {
    pub fn new(inner: impl SimilarityIndex + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            available: AtomicBool::new(true),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StrataError::unavailable("index", format!("{} offline", self.inner.collection())))
        }
    }
}

#[async_trait]
impl SimilarityIndex for ToggleIndex {
    async fn upsert(&self, id: ItemId, vector: &[f32], metadata: IndexMetadata) -> Result<()> {
        self.check()?;
        self.inner.upsert(id, vector, metadata).await
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>> {
        self.check()?;
        self.inner.query(vector, top_k, filter).await
    }

    async fn delete(&self, id: ItemId) -> Result<bool> {
        self.check()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StrataError::unavailable("index", "delete rejected"));
        }
        self.inner.delete(id).await
    }

    async fn scan(&self) -> Result<Vec<IndexEntry>> {
        self.check()?;
        self.inner.scan().await
    }

    fn collection(&self) -> &str {
        self.inner.collection()
    }
}

/// Eviction sink that keeps what it receives
#[derive(Debug, Default)]
pub struct CollectingSink {
    items: Mutex<Vec<MemoryItem>>,
}

impl CollectingSink {
    pub fn ids(&self) -> Vec<ItemId> {
        self.lock().iter().map(|item| item.id).collect()
    }

    pub fn take(&self) -> Vec<MemoryItem> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MemoryItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EvictionSink for CollectingSink {
    fn dispatch(&self, item: MemoryItem) {
        self.lock().push(item);
    }
}
