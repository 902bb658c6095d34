//! Metadata filters for similarity queries
//!
//! Every field is optional and conditions combine with AND. The same filter
//! is evaluated in-process by [`super::InMemoryIndex`] and rendered to a SQL
//! predicate for [`super::LanceIndex`].

use chrono::{DateTime, Utc};

use super::IndexMetadata;
use crate::memory::session_id::SessionId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexFilter {
    /// Only vectors belonging to this session
    pub session_id: Option<SessionId>,
    /// Only vectors from this source task
    pub source_task_id: Option<String>,
    /// Inclusive lower bound on creation time
    pub created_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time
    pub created_before: Option<DateTime<Utc>>,
}

impl IndexFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_source_task(mut self, task_id: impl Into<String>) -> Self {
        self.source_task_id = Some(task_id.into());
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

    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.source_task_id.is_none()
            && self.created_after.is_none()
            && self.created_before.is_none()
    }

    pub fn matches(&self, metadata: &IndexMetadata) -> bool {
        if let Some(ref session_id) = self.session_id {
            if metadata.session_id.as_ref() != Some(session_id) {
                return false;
            }
        }
        if let Some(ref task_id) = self.source_task_id {
            if metadata.source_task_id.as_ref() != Some(task_id) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if metadata.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if metadata.created_at >= before {
                return false;
            }
        }
        true
    }

    /// Build a SQL WHERE clause from this filter.
    /// Returns `None` if no filters are set.
    pub fn to_sql_clause(&self) -> Option<String> {
        let mut conditions = Vec::new();

        // Session ids are validated to [A-Za-z0-9_-], safe to inline.
        if let Some(ref session_id) = self.session_id {
            conditions.push(format!("session_id = '{session_id}'"));
        }

        if let Some(ref task_id) = self.source_task_id {
            conditions.push(format!("source_task_id = '{}'", task_id.replace('\'', "''")));
        }

        // created_at is stored as microseconds since epoch
        if let Some(ref after) = self.created_after {
            conditions.push(format!("created_at >= {}", after.timestamp_micros()));
        }

        if let Some(ref before) = self.created_before {
            conditions.push(format!("created_at < {}", before.timestamp_micros()));
        }

        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }
}
