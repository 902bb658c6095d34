//! Pending-score queue
//!
//! Every item waiting for a consolidation decision has one entry here. A
//! worker claims an entry with a lease; while the lease is live no other
//! worker can claim it, and only the holder may complete or fail it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ConsolidationConfig;
use crate::error::{Result, StrataError};
use crate::memory::session_id::SessionId;
use crate::memory::types::{ItemId, MemoryItem};
use crate::storage::EvictionSink;

/// Identifies the sweep that holds a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", &self.0.simple().to_string()[..8])
    }
}

/// Where the pipeline finds the item
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    /// Still resident in the session store
    Session(SessionId),
    /// Handed over by an active buffer; the queue owns the only copy
    Held(Box<MemoryItem>),
}

impl Origin {
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Origin::Session(id) => Some(id),
            Origin::Held(item) => item.session_id.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Evicted,
    TtlExpired,
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Pending,
    Claimed {
        worker: WorkerId,
        expires_at: DateTime<Utc>,
    },
    /// Out of retries; waits for [`PendingQueue::requeue_stuck`]
    Stuck,
}

#[derive(Debug)]
struct Entry {
    origin: Origin,
    trigger: Trigger,
    attempts: u32,
    not_before: DateTime<Utc>,
    state: ClaimState,
    last_error: Option<String>,
}

impl Entry {
    fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ClaimState::Pending => self.not_before <= now,
            ClaimState::Claimed { expires_at, .. } => expires_at <= now,
            ClaimState::Stuck => false,
        }
    }

    fn held_by(&self, worker: WorkerId) -> bool {
        matches!(self.state, ClaimState::Claimed { worker: w, .. } if w == worker)
    }
}

/// A leased queue entry
#[derive(Debug, Clone)]
pub struct Claim {
    pub id: ItemId,
    pub origin: Origin,
    pub trigger: Trigger,
    /// Failed attempts before this claim
    pub attempts: u32,
    pub worker: WorkerId,
    pub lease_expires_at: DateTime<Utc>,
}

/// What happened to a failed claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retry {
        attempts: u32,
        not_before: DateTime<Utc>,
    },
    Stuck {
        attempts: u32,
    },
}

/// A parked item as reported by [`PendingQueue::stuck`]
#[derive(Debug, Clone, PartialEq)]
pub struct StuckEntry {
    pub id: ItemId,
    pub session_id: Option<SessionId>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub struct PendingQueue {
    entries: DashMap<ItemId, Entry>,
    config: ConsolidationConfig,
    clock: Arc<dyn Clock>,
    notify: Notify,
}

impl PendingQueue {
    pub fn new(config: ConsolidationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            clock,
            notify: Notify::new(),
        }
    }

    /// Queue a session item. Returns false when it is already queued.
    pub fn enqueue_session(&self, id: ItemId, session_id: SessionId, trigger: Trigger) -> bool {
        self.enqueue(id, Origin::Session(session_id), trigger)
    }

    /// Queue an item whose only copy now lives in the queue.
    pub fn enqueue_held(&self, item: MemoryItem, trigger: Trigger) -> bool {
        let id = item.id;
        self.enqueue(id, Origin::Held(Box::new(item)), trigger)
    }

    fn enqueue(&self, id: ItemId, origin: Origin, trigger: Trigger) -> bool {
        let now = self.clock.now();
        let mut inserted = false;
        self.entries.entry(id).or_insert_with(|| {
            inserted = true;
            Entry {
                origin,
                trigger,
                attempts: 0,
                not_before: now,
                state: ClaimState::Pending,
                last_error: None,
            }
        });
        if inserted {
            debug!("Queued {id} ({trigger:?})");
            self.notify.notify_one();
        }
        inserted
    }

    /// Lease up to `limit` ready entries to `worker`. Pending entries past
    /// their backoff and claims whose lease expired are both ready.
    pub fn claim_ready(&self, worker: WorkerId, limit: usize) -> Vec<Claim> {
        let now = self.clock.now();
        let lease_expires_at = now + self.config.lease();

        let mut ready: Vec<(DateTime<Utc>, ItemId)> = self
            .entries
            .iter()
            .filter(|e| e.value().claimable(now))
            .map(|e| (e.value().not_before, *e.key()))
            .collect();
        ready.sort();

        let mut claims = Vec::new();
        for (_, id) in ready {
            if claims.len() == limit {
                break;
            }
            let Some(mut entry) = self.entries.get_mut(&id) else {
                continue;
            };
            // Re-checked under the shard lock so two workers never both win.
            if !entry.claimable(now) {
                continue;
            }
            if let ClaimState::Claimed { worker: previous, .. } = entry.state {
                warn!("Lease on {id} held by {previous} expired; reclaiming");
            }
            entry.state = ClaimState::Claimed {
                worker,
                expires_at: lease_expires_at,
            };
            claims.push(Claim {
                id,
                origin: entry.origin.clone(),
                trigger: entry.trigger,
                attempts: entry.attempts,
                worker,
                lease_expires_at,
            });
        }
        claims
    }

    /// Drop a finished entry. Only the lease holder can complete it.
    pub fn complete(&self, claim: &Claim) -> bool {
        self.entries
            .remove_if(&claim.id, |_, entry| entry.held_by(claim.worker))
            .is_some()
    }

    /// Charge a failed attempt and schedule a retry, or park the entry once
    /// `max_retries` attempts have failed. Returns `None` if `claim` no
    /// longer holds the lease.
    pub fn fail(&self, claim: &Claim, err: &StrataError) -> Option<FailOutcome> {
        let mut entry = self.entries.get_mut(&claim.id)?;
        if !entry.held_by(claim.worker) {
            return None;
        }

        entry.attempts += 1;
        entry.last_error = Some(err.to_string());
        let attempts = entry.attempts;

        if attempts >= self.config.max_retries {
            entry.state = ClaimState::Stuck;
            error!(
                "{}; last error: {err}",
                StrataError::StuckItem {
                    id: claim.id,
                    attempts
                }
            );
            return Some(FailOutcome::Stuck { attempts });
        }

        let not_before = self.clock.now() + self.config.backoff(attempts);
        entry.not_before = not_before;
        entry.state = ClaimState::Pending;
        warn!("Consolidation of {} failed (attempt {attempts}): {err}", claim.id);
        Some(FailOutcome::Retry {
            attempts,
            not_before,
        })
    }

    /// Give a claim back without charging an attempt.
    pub fn release(&self, claim: &Claim) -> bool {
        match self.entries.get_mut(&claim.id) {
            Some(mut entry) if entry.held_by(claim.worker) => {
                entry.state = ClaimState::Pending;
                true
            }
            _ => false,
        }
    }

    pub fn stuck(&self) -> Vec<StuckEntry> {
        let mut stuck: Vec<StuckEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().state == ClaimState::Stuck)
            .map(|e| StuckEntry {
                id: *e.key(),
                session_id: e.value().origin.session_id().cloned(),
                attempts: e.value().attempts,
                last_error: e.value().last_error.clone(),
            })
            .collect();
        stuck.sort_by(|a, b| a.id.cmp(&b.id));
        stuck
    }

    /// Return a stuck entry to the queue with a clean attempt counter.
    pub fn requeue_stuck(&self, id: ItemId) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| StrataError::NotFound(format!("Queued item {id}")))?;
        if entry.state != ClaimState::Stuck {
            return Err(StrataError::Validation(format!("Item {id} is not stuck")));
        }
        entry.state = ClaimState::Pending;
        entry.attempts = 0;
        entry.trigger = Trigger::Requeued;
        entry.not_before = self.clock.now();
        entry.last_error = None;
        drop(entry);

        debug!("Requeued stuck item {id}");
        self.notify.notify_one();
        Ok(())
    }

    pub fn state(&self, id: ItemId) -> Option<ClaimState> {
        self.entries.get(&id).map(|e| e.value().state)
    }

    pub fn attempts(&self, id: ItemId) -> Option<u32> {
        self.entries.get(&id).map(|e| e.value().attempts)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves after the next enqueue.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl EvictionSink for PendingQueue {
    fn dispatch(&self, item: MemoryItem) {
        self.enqueue_held(item, Trigger::Evicted);
    }
}
