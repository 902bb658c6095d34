use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{IndexEntry, IndexFilter, IndexHit, IndexMetadata, SimilarityIndex, rank_hits};
use crate::error::Result;
use crate::memory::scoring::cosine_similarity;
use crate::memory::types::{ItemId, validate_vector};

/// Exact brute-force cosine index held in process memory.
pub struct InMemoryIndex {
    collection: String,
    entries: RwLock<HashMap<ItemId, (Vec<f32>, IndexMetadata)>>,
}

impl InMemoryIndex {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    async fn upsert(&self, id: ItemId, vector: &[f32], metadata: IndexMetadata) -> Result<()> {
        validate_vector(vector)?;
        self.entries
            .write()
            .await
            .insert(id, (vector.to_vec(), metadata));
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut hits: Vec<IndexHit> = entries
            .iter()
            .filter(|(_, (_, metadata))| filter.matches(metadata))
            .map(|(id, (stored, metadata))| IndexHit {
                id: *id,
                score: cosine_similarity(vector, stored),
                metadata: metadata.clone(),
            })
            .collect();
        drop(entries);

        rank_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, id: ItemId) -> Result<bool> {
        Ok(self.entries.write().await.remove(&id).is_some())
    }

    async fn scan(&self) -> Result<Vec<IndexEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, (_, metadata))| IndexEntry {
                id: *id,
                metadata: metadata.clone(),
            })
            .collect())
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}
