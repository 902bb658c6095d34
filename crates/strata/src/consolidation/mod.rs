//! Consolidation: the background process that moves items out of the
//! session store and active buffers into long-term memory.

pub mod pipeline;
pub mod queue;
pub mod scheduler;

pub use pipeline::{ConsolidationPipeline, Disposition, ItemReport, PipelineParts, SweepReport};
pub use queue::{
    Claim, ClaimState, FailOutcome, Origin, PendingQueue, StuckEntry, Trigger, WorkerId,
};
pub use scheduler::{Scheduler, Shutdown};
