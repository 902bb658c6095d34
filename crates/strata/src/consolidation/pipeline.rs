//! The consolidation pipeline
//!
//! Decides the fate of each queued item: merge into a near-duplicate,
//! promote to the persistent store, archive to the episodic store, or
//! discard. Writes always land in the destination before the source copy is
//! pruned, so a crash in between is resumed by the next attempt.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info};

use super::queue::{Claim, FailOutcome, Origin, PendingQueue, StuckEntry, Trigger, WorkerId};
use super::scheduler::Shutdown;
use crate::affect::AffectiveLedger;
use crate::clock::Clock;
use crate::config::{Config, ConsolidationConfig, ScoringConfig};
use crate::embedding::{EmbeddingPort, ensure_embedding};
use crate::error::{Result, StrataError};
use crate::memory::scoring::{self, ScoreInputs};
use crate::memory::session_id::SessionId;
use crate::memory::types::{ItemId, MemoryItem, Tier};
use crate::storage::{EpisodicStore, PersistentStore, Promoted, SessionStore};

/// Final state of one claimed item within a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Written to the persistent store
    Promoted,
    /// Written to the episodic store
    Archived,
    /// Scored below the promotion threshold
    Discarded,
    /// Near-duplicate of an existing item, which was boosted instead
    Merged { into: ItemId },
    /// Destination already held the item; only the prune was left
    Resumed { tier: Tier },
    /// Source copy was gone before the pipeline got to it
    Vanished,
    Retry { attempts: u32, not_before: DateTime<Utc> },
    Stuck { attempts: u32 },
    /// Shutdown arrived first; the claim went back without charging an attempt
    Released,
    /// Lease expired and another worker took the item over
    LeaseLost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub id: ItemId,
    pub disposition: Disposition,
}

/// Summary of one [`ConsolidationPipeline::sweep`] or drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Items whose importance was decayed
    pub decayed: usize,
    /// Expired session items newly queued
    pub enqueued: usize,
    pub claimed: usize,
    pub outcomes: Vec<ItemReport>,
}

impl SweepReport {
    pub fn disposition(&self, id: ItemId) -> Option<Disposition> {
        self.outcomes
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.disposition)
    }

    pub fn count(&self, predicate: impl Fn(&Disposition) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|r| predicate(&r.disposition))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.enqueued == 0 && self.outcomes.is_empty()
    }
}

pub struct ConsolidationPipeline {
    session: Arc<SessionStore>,
    persistent: Arc<PersistentStore>,
    episodic: Arc<EpisodicStore>,
    embedder: Arc<dyn EmbeddingPort>,
    affect: Arc<AffectiveLedger>,
    queue: Arc<PendingQueue>,
    clock: Arc<dyn Clock>,
    scoring: ScoringConfig,
    config: ConsolidationConfig,
    embed_timeout: Duration,
    worker: WorkerId,
    last_decay: Mutex<DateTime<Utc>>,
}

/// Stores and collaborators the pipeline moves items between
pub struct PipelineParts {
    pub session: Arc<SessionStore>,
    pub persistent: Arc<PersistentStore>,
    pub episodic: Arc<EpisodicStore>,
    pub embedder: Arc<dyn EmbeddingPort>,
    pub affect: Arc<AffectiveLedger>,
    pub queue: Arc<PendingQueue>,
    pub clock: Arc<dyn Clock>,
}

impl ConsolidationPipeline {
    pub fn new(parts: PipelineParts, config: &Config) -> Self {
        let now = parts.clock.now();
        Self {
            session: parts.session,
            persistent: parts.persistent,
            episodic: parts.episodic,
            embedder: parts.embedder,
            affect: parts.affect,
            queue: parts.queue,
            clock: parts.clock,
            scoring: config.scoring,
            config: config.consolidation,
            embed_timeout: config.embedding.timeout(),
            worker: WorkerId::new(),
            last_decay: Mutex::new(now),
        }
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Full pass: decay long-term scores, queue expired session items, then
    /// drain the queue.
    pub async fn sweep(&self, shutdown: &Shutdown) -> SweepReport {
        let now = self.clock.now();
        let decayed = self.decay(now).await;
        self.affect.prune(now);

        let mut enqueued = 0;
        for item in self.session.scan_expiring(now).await {
            if let Some(session_id) = item.session_id {
                if self
                    .queue
                    .enqueue_session(item.id, session_id, Trigger::TtlExpired)
                {
                    enqueued += 1;
                }
            }
        }

        let mut report = self.drain(shutdown).await;
        report.decayed = decayed;
        report.enqueued = enqueued;
        if !report.is_empty() {
            info!(
                "Sweep: {} queued, {} claimed, {} promoted, {} archived, {} discarded, {} merged, {} retrying",
                report.enqueued,
                report.claimed,
                report.count(|d| *d == Disposition::Promoted),
                report.count(|d| *d == Disposition::Archived),
                report.count(|d| *d == Disposition::Discarded),
                report.count(|d| matches!(d, Disposition::Merged { .. })),
                report.count(|d| matches!(d, Disposition::Retry { .. })),
            );
        }
        report
    }

    /// Process whatever is ready in the queue without decaying or scanning.
    ///
    /// Claims are grouped by session; groups run concurrently up to
    /// `max_concurrent_sessions` while items inside a group run in order.
    pub async fn drain(&self, shutdown: &Shutdown) -> SweepReport {
        let claims = self.queue.claim_ready(self.worker, self.config.batch_size);
        let claimed = claims.len();

        let mut groups: BTreeMap<Option<SessionId>, Vec<Claim>> = BTreeMap::new();
        for claim in claims {
            groups
                .entry(claim.origin.session_id().cloned())
                .or_default()
                .push(claim);
        }

        let outcomes: Vec<Vec<ItemReport>> = futures::stream::iter(groups.into_values())
            .map(|claims| self.run_group(claims, shutdown))
            .buffer_unordered(self.config.max_concurrent_sessions.max(1))
            .collect()
            .await;

        SweepReport {
            claimed,
            outcomes: outcomes.into_iter().flatten().collect(),
            ..SweepReport::default()
        }
    }

    async fn run_group(&self, claims: Vec<Claim>, shutdown: &Shutdown) -> Vec<ItemReport> {
        let mut reports = Vec::with_capacity(claims.len());
        for claim in claims {
            let disposition = if shutdown.is_triggered() {
                self.queue.release(&claim);
                Disposition::Released
            } else {
                self.process(&claim).await
            };
            reports.push(ItemReport {
                id: claim.id,
                disposition,
            });
        }
        reports
    }

    /// Run one claim to completion and settle it with the queue.
    pub async fn process(&self, claim: &Claim) -> Disposition {
        match self.consolidate(claim).await {
            Ok(disposition) => {
                if !self.queue.complete(claim) {
                    debug!("Lease on {} lapsed before completion", claim.id);
                }
                disposition
            }
            Err(e) => match self.queue.fail(claim, &e) {
                Some(FailOutcome::Retry {
                    attempts,
                    not_before,
                }) => Disposition::Retry {
                    attempts,
                    not_before,
                },
                Some(FailOutcome::Stuck { attempts }) => Disposition::Stuck { attempts },
                None => Disposition::LeaseLost,
            },
        }
    }

    /// Decide one claim. When a session still holds a copy of the item,
    /// the decision and the prune run under that session's lock; the
    /// embedding is computed before the lock is taken.
    async fn consolidate(&self, claim: &Claim) -> Result<Disposition> {
        let held = matches!(claim.origin, Origin::Held(_));
        let (candidate, session_id) = match &claim.origin {
            Origin::Session(session_id) => match self.session.snapshot(claim.id).await {
                Some(item) => (item, session_id.clone()),
                None => return Ok(Disposition::Vanished),
            },
            Origin::Held(item) => match self.session.owner(claim.id) {
                Some(session_id) => (item.as_ref().clone(), session_id),
                None => return self.decide(item.as_ref().clone()).await,
            },
        };
        let prepared = self.prepare(candidate).await?;

        let Some(mut shard) = self.session.lock_session(&session_id).await else {
            return if held {
                self.decide(prepared).await
            } else {
                Ok(Disposition::Vanished)
            };
        };
        let current = shard.get(&claim.id).cloned();
        let item = match (current, held) {
            (Some(_), true) => prepared,
            (Some(current), false) => with_embedding_of(current, &prepared),
            (None, true) => {
                drop(shard);
                return self.decide(prepared).await;
            }
            (None, false) => return Ok(Disposition::Vanished),
        };

        let disposition = self.decide(item).await?;
        self.session.prune_locked(&mut shard, claim.id).await?;
        Ok(disposition)
    }

    /// Embed ahead of the decision unless nothing will need the vector.
    async fn prepare(&self, mut item: MemoryItem) -> Result<MemoryItem> {
        if !item.ephemeral && self.written_to(item.id).await.is_none() {
            ensure_embedding(self.embedder.as_ref(), &mut item, self.embed_timeout).await?;
        }
        Ok(item)
    }

    async fn written_to(&self, id: ItemId) -> Option<Tier> {
        if self.episodic.contains(id).await {
            Some(Tier::Episodic)
        } else if self.persistent.contains(id).await {
            Some(Tier::Persistent)
        } else {
            None
        }
    }

    async fn decide(&self, mut item: MemoryItem) -> Result<Disposition> {
        if let Some(tier) = self.written_to(item.id).await {
            return Ok(Disposition::Resumed { tier });
        }
        if item.ephemeral {
            return Ok(Disposition::Discarded);
        }

        ensure_embedding(self.embedder.as_ref(), &mut item, self.embed_timeout).await?;
        let vector = item
            .fresh_embedding()
            .map(<[f32]>::to_vec)
            .ok_or_else(|| StrataError::Validation(format!("Item {} has no embedding", item.id)))?;

        let now = self.clock.now();
        let archive = item.has_episodic_triple();
        let nearest = match (&item.session_id, archive) {
            (Some(session_id), true) => {
                self.episodic
                    .nearest_other(&vector, session_id, item.id)
                    .await?
            }
            _ => self.persistent.nearest_other(&vector, item.id).await?,
        };

        if let Some(hit) = &nearest {
            if scoring::is_near_duplicate(hit.score, &self.scoring) {
                if archive {
                    self.episodic.merge_duplicate(hit.id, now).await?;
                } else {
                    self.persistent.merge_duplicate(hit.id, now).await?;
                }
                debug!("Merged {} into {} (similarity {:.3})", item.id, hit.id, hit.score);
                return Ok(Disposition::Merged { into: hit.id });
            }
        }

        if let Some(valence) = item
            .event_id
            .as_deref()
            .and_then(|event| self.affect.latest_valence(event, now))
        {
            item.affective_valence = valence;
        }

        let novelty = scoring::novelty_from_similarity(nearest.map(|hit| hit.score));
        item.set_importance(scoring::importance(
            &ScoreInputs::for_item(&item, novelty),
            &self.scoring,
        ));

        if item.importance_score < self.scoring.promotion_threshold {
            debug!(
                "Discarded {} (importance {:.3} < {:.3})",
                item.id, item.importance_score, self.scoring.promotion_threshold
            );
            return Ok(Disposition::Discarded);
        }

        let id = item.id;
        let score = item.importance_score;
        if archive {
            self.episodic.append(Promoted::new(item)).await?;
            debug!("Archived {id} (importance {score:.3})");
            Ok(Disposition::Archived)
        } else {
            self.persistent.upsert(Promoted::new(item)).await?;
            debug!("Promoted {id} (importance {score:.3})");
            Ok(Disposition::Promoted)
        }
    }

    /// Apply exponential decay for the time since the previous decay.
    async fn decay(&self, now: DateTime<Utc>) -> usize {
        let elapsed = {
            let mut last = self.last_decay.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = now - *last;
            if elapsed > chrono::Duration::zero() {
                *last = now;
            }
            elapsed
        };

        let factor = scoring::decay_factor(elapsed, self.config.sweep_interval(), &self.scoring);
        if factor >= 1.0 {
            return 0;
        }
        let decayed = self.persistent.decay(factor).await + self.episodic.decay(factor).await;
        debug!("Decayed {decayed} items by {factor:.4}");
        decayed
    }

    pub fn stuck_items(&self) -> Vec<StuckEntry> {
        self.queue.stuck()
    }

    pub fn requeue_stuck(&self, id: ItemId) -> Result<()> {
        self.queue.requeue_stuck(id)
    }
}

/// `current` with the vector computed for `prepared`, when both are the same
/// content revision and `current` still lacks one.
fn with_embedding_of(mut current: MemoryItem, prepared: &MemoryItem) -> MemoryItem {
    if current.needs_embedding() && current.revision() == prepared.revision() {
        if let Some(vector) = prepared.fresh_embedding() {
            current.set_embedding(vector.to_vec());
        }
    }
    current
}
