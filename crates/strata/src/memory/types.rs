//! Memory item types shared by every tier
//!
//! A [`MemoryItem`] keeps its identity while it moves between tiers; the
//! `tier` field only records which store currently owns it.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::memory::session_id::SessionId;

/// Opaque item identifier.
///
/// Ordering follows the canonical hyphenated string form, which is what
/// eviction and ranking use as their final tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StrataError::Validation(format!("Invalid item id {s:?}: {e}")))
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ItemId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// The store that currently owns an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Active,
    Session,
    Persistent,
    Episodic,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Active => "active",
            Tier::Session => "session",
            Tier::Persistent => "persistent",
            Tier::Episodic => "episodic",
        }
    }

    /// Name of the similarity index collection owned by this tier.
    pub fn collection(&self) -> String {
        format!("strata.{}", self.as_str())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item payload: plain text or a structured JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    /// Text form used for embedding and size accounting.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Content::Text(text) => Cow::Borrowed(text),
            Content::Structured(value) => Cow::Owned(value.to_string()),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.render().len()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.trim().is_empty(),
            Content::Structured(value) => value.is_null(),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Content::Structured(value)
    }
}

/// Rough token estimate: four bytes per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// A vector tagged with the content revision it was computed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub revision: u64,
}

/// The unit of storage across all tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: ItemId,
    pub tier: Tier,
    content: Content,
    /// Bumped on every content change; embeddings from older revisions are stale
    revision: u64,
    pub embedding: Option<Embedding>,
    /// Importance in [0, 1]
    pub importance_score: f32,
    pub access_count: u64,
    /// Affective valence in [-1, 1] observed at encoding time
    pub affective_valence: f32,
    pub session_id: Option<SessionId>,
    pub source_task_id: Option<String>,
    /// Originating event, used to look up later affective signals
    pub event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Expiry deadline; only session items carry one
    pub ttl: Option<DateTime<Utc>>,
    /// Ephemeral items live only in an active buffer and are never consolidated
    pub ephemeral: bool,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MemoryItem {
    pub fn new(content: impl Into<Content>) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::new(),
            tier: Tier::Session,
            content: content.into(),
            revision: 0,
            embedding: None,
            importance_score: 0.0,
            access_count: 0,
            affective_valence: 0.0,
            session_id: None,
            source_task_id: None,
            event_id: None,
            created_at: now,
            last_accessed_at: now,
            ttl: None,
            ephemeral: false,
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_source_task(mut self, task_id: impl Into<String>) -> Self {
        self.source_task_id = Some(task_id.into());
        self
    }

    pub fn with_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_importance(mut self, score: f32) -> Self {
        self.set_importance(score);
        self
    }

    pub fn with_valence(mut self, valence: f32) -> Self {
        self.affective_valence = valence.clamp(-1.0, 1.0);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.last_accessed_at = created_at;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace the content. Any existing embedding becomes stale.
    pub fn update_content(&mut self, content: impl Into<Content>) {
        self.content = content.into();
        self.revision += 1;
    }

    /// Attach an embedding computed from the current content.
    pub fn set_embedding(&mut self, vector: Vec<f32>) {
        self.embedding = Some(Embedding {
            vector,
            revision: self.revision,
        });
    }

    /// The embedding vector, if present and computed from the current content.
    pub fn fresh_embedding(&self) -> Option<&[f32]> {
        self.embedding
            .as_ref()
            .filter(|e| e.revision == self.revision)
            .map(|e| e.vector.as_slice())
    }

    pub fn needs_embedding(&self) -> bool {
        self.fresh_embedding().is_none()
    }

    pub fn set_importance(&mut self, score: f32) {
        self.importance_score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    /// True when the item carries the what-where-when triple required by
    /// the episodic store.
    pub fn has_episodic_triple(&self) -> bool {
        self.session_id.is_some()
            && self
                .source_task_id
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty())
    }

    pub fn size_tokens(&self) -> usize {
        estimate_tokens(&self.content.render())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|deadline| deadline <= now)
    }

    /// Boundary validation applied before any tier stores the item.
    pub fn validate(&self, max_content_bytes: usize) -> Result<()> {
        if self.content.is_empty() {
            return Err(StrataError::Validation(format!(
                "Item {} has empty content",
                self.id
            )));
        }

        let size = self.content.byte_len();
        if size > max_content_bytes {
            return Err(StrataError::Validation(format!(
                "Item {} content is {size} bytes, limit is {max_content_bytes}",
                self.id
            )));
        }

        if !self.importance_score.is_finite() || !(0.0..=1.0).contains(&self.importance_score) {
            return Err(StrataError::Validation(format!(
                "Item {} importance {} outside [0, 1]",
                self.id, self.importance_score
            )));
        }

        if !self.affective_valence.is_finite()
            || !(-1.0..=1.0).contains(&self.affective_valence)
        {
            return Err(StrataError::Validation(format!(
                "Item {} valence {} outside [-1, 1]",
                self.id, self.affective_valence
            )));
        }

        if let Some(embedding) = &self.embedding {
            validate_vector(&embedding.vector)?;
        }

        Ok(())
    }
}

/// Reject vectors that would silently corrupt similarity ranking.
pub fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(StrataError::Validation("Embedding is empty".to_string()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(StrataError::Validation(
            "Embedding contains non-finite values".to_string(),
        ));
    }
    if vector.iter().all(|v| *v == 0.0) {
        return Err(StrataError::Validation("Embedding is a zero vector".to_string()));
    }
    Ok(())
}
