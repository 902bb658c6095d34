//! Similarity index contract
//!
//! Each tier owns one logical collection. Tiers and the consolidation
//! pipeline depend only on [`SimilarityIndex`]; [`InMemoryIndex`] and
//! [`LanceIndex`] are the shipped backends.

pub mod filter;
pub mod lance;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::memory::session_id::SessionId;
use crate::memory::types::{ItemId, MemoryItem};

pub use filter::IndexFilter;
pub use lance::LanceIndex;
pub use memory::InMemoryIndex;

/// Structured fields stored next to each vector and matched by [`IndexFilter`]
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMetadata {
    pub session_id: Option<SessionId>,
    pub source_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Serialized item for tiers that reload their contents from the index
    pub record: Option<String>,
}

impl IndexMetadata {
    pub fn for_item(item: &MemoryItem) -> Self {
        Self {
            session_id: item.session_id.clone(),
            source_task_id: item.source_task_id.clone(),
            created_at: item.created_at,
            record: None,
        }
    }

    /// Metadata that also carries the whole item as JSON.
    pub fn with_record(item: &MemoryItem) -> Result<Self> {
        Ok(Self {
            record: Some(serde_json::to_string(item)?),
            ..Self::for_item(item)
        })
    }

    /// Decode the carried item, if any.
    pub fn decode_record(&self) -> Result<Option<MemoryItem>> {
        self.record
            .as_deref()
            .map(serde_json::from_str::<MemoryItem>)
            .transpose()
            .map_err(Into::into)
    }
}

/// A single nearest-neighbour match
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: ItemId,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
    pub metadata: IndexMetadata,
}

/// One stored row, as returned by [`SimilarityIndex::scan`]
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: ItemId,
    pub metadata: IndexMetadata,
}

/// Nearest-neighbour search over vectors with metadata filters
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Insert or replace the vector stored under `id`.
    async fn upsert(&self, id: ItemId, vector: &[f32], metadata: IndexMetadata) -> Result<()>;

    /// Up to `top_k` hits matching `filter`, best first. Equal scores are
    /// ordered by id.
    async fn query(&self, vector: &[f32], top_k: usize, filter: &IndexFilter)
    -> Result<Vec<IndexHit>>;

    /// Remove `id`. Returns whether it was present; a missing id is not an error.
    async fn delete(&self, id: ItemId) -> Result<bool>;

    /// Every stored row, in no particular order.
    async fn scan(&self) -> Result<Vec<IndexEntry>>;

    /// Collection name, for logging
    fn collection(&self) -> &str;
}

/// Sort hits best-first with id as the tie-break.
pub(crate) fn rank_hits(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
}
