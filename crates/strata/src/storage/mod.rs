//! The four memory tiers
//!
//! Each store owns its items in an id-keyed arena and mirrors their vectors
//! into its own similarity index collection. Moving an item between tiers is
//! always insert-into-destination followed by remove-from-source.

pub mod active;
pub mod episodic;
pub mod persistent;
pub mod session;

use crate::memory::types::MemoryItem;

pub use active::{ActiveBuffer, AssembledContext, AssemblySources, EvictionSink};
pub use episodic::{CompositeQuery, EpisodicStore, TimeRange};
pub use persistent::{PersistentFilter, PersistentStore};
pub use session::{PutOutcome, SessionStore};

/// An item cleared for promotion by the consolidation pipeline.
///
/// Only the pipeline can construct one, which keeps the long-term tiers free
/// of writes that did not pass scoring.
#[derive(Debug, Clone)]
pub struct Promoted(MemoryItem);

impl Promoted {
    pub(crate) fn new(item: MemoryItem) -> Self {
        Self(item)
    }

    pub fn item(&self) -> &MemoryItem {
        &self.0
    }

    pub fn into_inner(self) -> MemoryItem {
        self.0
    }
}

/// A retrieved item together with its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub item: MemoryItem,
    pub similarity: f32,
}
