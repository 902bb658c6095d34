//! Affective modulator
//!
//! Keeps the most recent affective signal per event so the consolidation
//! pipeline can weight items by how emotionally charged their originating
//! event was.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AffectConfig;

/// An external affect reading attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectiveSignal {
    pub event_id: String,
    /// In [-1, 1]
    pub valence: f32,
    /// In [0, 1]
    pub urgency: f32,
    pub observed_at: DateTime<Utc>,
}

impl AffectiveSignal {
    pub fn new(
        event_id: impl Into<String>,
        valence: f32,
        urgency: f32,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            valence,
            urgency,
            observed_at,
        }
        .clamped()
    }

    fn clamped(mut self) -> Self {
        self.valence = finite_or_zero(self.valence).clamp(-1.0, 1.0);
        self.urgency = finite_or_zero(self.urgency).clamp(0.0, 1.0);
        self
    }
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() { v } else { 0.0 }
}

/// Latest signal per event id
pub struct AffectiveLedger {
    signals: DashMap<String, AffectiveSignal>,
    lookback: Duration,
}

impl AffectiveLedger {
    pub fn new(config: &AffectConfig) -> Self {
        Self {
            signals: DashMap::new(),
            lookback: config.lookback(),
        }
    }

    /// Store a signal, clamping it first. An older reading never replaces a
    /// newer one.
    pub fn record(&self, signal: AffectiveSignal) {
        let signal = signal.clamped();
        if signal.event_id.trim().is_empty() {
            warn!("Ignoring affective signal without event id");
            return;
        }

        self.signals
            .entry(signal.event_id.clone())
            .and_modify(|current| {
                if signal.observed_at >= current.observed_at {
                    *current = signal.clone();
                }
            })
            .or_insert(signal);
    }

    /// Most recent signal for `event_id`, regardless of age
    pub fn latest(&self, event_id: &str) -> Option<AffectiveSignal> {
        self.signals.get(event_id).map(|s| s.value().clone())
    }

    /// Valence of the latest signal for `event_id` observed within the
    /// lookback window ending at `now`.
    pub fn latest_valence(&self, event_id: &str, now: DateTime<Utc>) -> Option<f32> {
        let signal = self.signals.get(event_id)?;
        (now - signal.observed_at <= self.lookback).then_some(signal.valence)
    }

    /// Drop signals that fell out of the lookback window.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.signals.len();
        self.signals.retain(|_, s| now - s.observed_at <= self.lookback);
        before - self.signals.len()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Record every signal received on `rx` until all senders are dropped.
    pub fn spawn_listener(self: Arc<Self>, mut rx: mpsc::Receiver<AffectiveSignal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                debug!(
                    "Affective signal for {}: valence {:.2}",
                    signal.event_id, signal.valence
                );
                self.record(signal);
            }
            debug!("Affective signal channel closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> AffectiveLedger {
        AffectiveLedger::new(&AffectConfig { lookback_secs: 60 })
    }

    #[test]
    fn test_signals_are_clamped() {
        let s = AffectiveSignal::new("e1", -4.0, f32::NAN, Utc::now());
        assert_eq!(s.valence, -1.0);
        assert_eq!(s.urgency, 0.0);
    }

    #[test]
    fn test_latest_wins_and_stale_is_ignored() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.record(AffectiveSignal::new("e1", 0.8, 0.5, now));
        ledger.record(AffectiveSignal::new("e1", -0.2, 0.1, now - Duration::seconds(5)));

        assert_eq!(ledger.latest_valence("e1", now), Some(0.8));
        assert_eq!(ledger.latest_valence("e1", now + Duration::seconds(61)), None);
        assert_eq!(ledger.latest_valence("missing", now), None);
    }

    #[test]
    fn test_prune_removes_expired() {
        let ledger = ledger();
        let now = Utc::now();
        ledger.record(AffectiveSignal::new("old", 0.5, 0.0, now - Duration::minutes(5)));
        ledger.record(AffectiveSignal::new("new", 0.5, 0.0, now));
        assert_eq!(ledger.prune(now), 1);
        assert!(ledger.latest("new").is_some());
    }

    #[tokio::test]
    async fn test_listener_records_until_closed() {
        let ledger = Arc::new(ledger());
        let (tx, rx) = mpsc::channel(8);
        let handle = ledger.clone().spawn_listener(rx);

        tx.send(AffectiveSignal::new("e7", 0.9, 1.0, Utc::now())).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(ledger.latest("e7").map(|s| s.valence), Some(0.9));
    }
}
