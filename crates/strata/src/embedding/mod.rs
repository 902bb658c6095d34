//! Embedding port
//!
//! Every tier that supports semantic retrieval turns content into vectors
//! through [`EmbeddingPort`]. A port that cannot produce a vector reports
//! [`StrataError::BackendUnavailable`]; it never answers with a zero vector.

mod local;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, StrataError};
use crate::memory::types::{MemoryItem, validate_vector};

pub use local::{EMBEDDING_DIMENSION, FastEmbedder};

pub const EMBEDDING_BACKEND: &str = "embedding";

/// Trait for embedding backends
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    /// Embed a single piece of content.
    async fn embed(&self, content: &str) -> Result<Vec<f32>>;

    /// Dimension of the vectors this port produces
    fn dimension(&self) -> usize;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Embed with a deadline and reject degenerate vectors.
pub async fn embed_bounded(
    port: &dyn EmbeddingPort,
    content: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let vector = tokio::time::timeout(timeout, port.embed(content))
        .await
        .map_err(|_| {
            StrataError::unavailable(
                EMBEDDING_BACKEND,
                format!("{} timed out after {}ms", port.name(), timeout.as_millis()),
            )
        })??;

    if vector.len() != port.dimension() {
        return Err(StrataError::unavailable(
            EMBEDDING_BACKEND,
            format!(
                "{} returned {} dimensions, expected {}",
                port.name(),
                vector.len(),
                port.dimension()
            ),
        ));
    }

    validate_vector(&vector).map_err(|e| {
        StrataError::unavailable(EMBEDDING_BACKEND, format!("{}: {e}", port.name()))
    })?;

    Ok(vector)
}

/// Compute the item's embedding if it is absent or stale.
pub async fn ensure_embedding(
    port: &dyn EmbeddingPort,
    item: &mut MemoryItem,
    timeout: Duration,
) -> Result<()> {
    if item.needs_embedding() {
        let vector = embed_bounded(port, &item.content().render(), timeout).await?;
        item.set_embedding(vector);
    }
    Ok(())
}
