use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};

use super::{EMBEDDING_BACKEND, EmbeddingPort};
use crate::error::{Result, StrataError};

pub const EMBEDDING_DIMENSION: usize = 384;

/// Local ONNX embedding model (multilingual-e5-small) via fastembed.
///
/// Inference is CPU-bound, so calls run on the blocking pool.
#[derive(Clone)]
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(InitOptions::new(FastEmbedModel::MultilingualE5Small))
            .map_err(|e| StrataError::unavailable(EMBEDDING_BACKEND, e.to_string()))?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl EmbeddingPort for FastEmbedder {
    async fn embed(&self, content: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = content.to_string();

        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|_| {
                StrataError::unavailable(EMBEDDING_BACKEND, "embedding model lock poisoned")
            })?;
            let embeddings = model
                .embed(vec![text], None)
                .map_err(|e| StrataError::unavailable(EMBEDDING_BACKEND, e.to_string()))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| StrataError::unavailable(EMBEDDING_BACKEND, "No embedding returned"))
        })
        .await
        .map_err(|e| StrataError::unavailable(EMBEDDING_BACKEND, format!("embedding task failed: {e}")))?
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }

    fn name(&self) -> &'static str {
        "fastembed"
    }
}
