//! Strata - tiered memory for agents
//!
//! Working memory lives in capacity-bounded [`ActiveBuffer`]s, recent items
//! in a TTL-governed [`SessionStore`], and long-term memory in the
//! [`PersistentStore`] and the event-ordered [`EpisodicStore`]. A background
//! [`ConsolidationPipeline`] scores what expires or gets evicted and decides
//! what survives.

pub mod affect;
pub mod clock;
pub mod config;
pub mod consolidation;
pub mod embedding;
pub mod error;
pub mod index;
pub mod memory;
pub mod storage;
pub mod system;
pub mod testing;

pub use affect::{AffectiveLedger, AffectiveSignal};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use consolidation::{ConsolidationPipeline, Disposition, PendingQueue, Scheduler, SweepReport};
pub use embedding::{EmbeddingPort, FastEmbedder};
pub use error::{Result, StrataError};
pub use index::{InMemoryIndex, IndexFilter, LanceIndex, SimilarityIndex};
pub use memory::{Content, ItemId, MemoryItem, SessionId, Tier};
pub use storage::{
    ActiveBuffer, AssembledContext, CompositeQuery, EpisodicStore, PersistentFilter,
    PersistentStore, PutOutcome, SessionStore, TimeRange,
};
pub use system::{MemorySystem, TierIndexes};
