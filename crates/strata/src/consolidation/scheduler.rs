//! Background scheduling for the consolidation pipeline

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pipeline::{ConsolidationPipeline, SweepReport};
use crate::clock::Clock;
use crate::config::ConsolidationConfig;

/// Cooperative cancellation flag checked between items
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A flag that is never raised
    pub fn never() -> Self {
        Self::channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    async fn triggered(&mut self) {
        // A dropped sender means nobody can stop us any more.
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs full sweeps every `sweep_interval` and drains the queue in between,
/// waking on new work or on `poll_interval`.
pub struct Scheduler {
    pipeline: Arc<ConsolidationPipeline>,
    clock: Arc<dyn Clock>,
    config: ConsolidationConfig,
    next_sweep: Mutex<DateTime<Utc>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: Shutdown,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<ConsolidationPipeline>,
        clock: Arc<dyn Clock>,
        config: ConsolidationConfig,
    ) -> Self {
        let (shutdown_tx, shutdown) = Shutdown::channel();
        let next_sweep = clock.now();
        Self {
            pipeline,
            clock,
            config,
            next_sweep: Mutex::new(next_sweep),
            shutdown_tx,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<ConsolidationPipeline> {
        &self.pipeline
    }

    /// One scheduling step: a full sweep when one is due, otherwise a drain.
    pub async fn tick(&self) -> SweepReport {
        let now = self.clock.now();
        let due = {
            let mut next = self.next_sweep.lock().await;
            if now >= *next {
                *next = now + self.config.sweep_interval();
                true
            } else {
                false
            }
        };

        if due {
            self.pipeline.sweep(&self.shutdown).await
        } else {
            self.pipeline.drain(&self.shutdown).await
        }
    }

    /// Spawn the background loop. Calling it while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Consolidation scheduler already running");
            return;
        }

        self.shutdown_tx.send_replace(false);
        let scheduler = Arc::clone(self);
        let poll = self.config.poll_interval();
        info!(
            "Consolidation scheduler started (sweep every {}s, poll every {}ms)",
            self.config.sweep_interval_secs,
            poll.as_millis()
        );

        *handle = Some(tokio::spawn(async move {
            let mut shutdown = scheduler.shutdown.clone();
            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,
                    _ = tokio::time::sleep(poll) => {}
                    _ = scheduler.pipeline.queue().notified() => {}
                }
                if shutdown.is_triggered() {
                    break;
                }

                let report = scheduler.tick().await;
                if !report.is_empty() {
                    debug!(
                        "Scheduler tick: {} claimed, {} settled",
                        report.claimed,
                        report.outcomes.len()
                    );
                }
            }
            info!("Consolidation scheduler stopped");
        }));
    }

    /// Signal shutdown and wait for the loop to finish. In-flight sweeps
    /// release their unprocessed claims.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Consolidation scheduler task failed: {e}");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
