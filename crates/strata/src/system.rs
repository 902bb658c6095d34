//! Wiring: builds every tier around shared collaborators

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::affect::{AffectiveLedger, AffectiveSignal};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::consolidation::{ConsolidationPipeline, PendingQueue, PipelineParts, Scheduler};
use crate::embedding::{EmbeddingPort, FastEmbedder};
use crate::error::Result;
use crate::index::{InMemoryIndex, LanceIndex, SimilarityIndex};
use crate::memory::session_id::SessionId;
use crate::memory::types::{MemoryItem, Tier};
use crate::storage::{
    ActiveBuffer, AssemblySources, EpisodicStore, PersistentStore, PutOutcome, SessionStore,
};

/// One similarity index collection per tier that searches
#[derive(Clone)]
pub struct TierIndexes {
    pub session: Arc<dyn SimilarityIndex>,
    pub persistent: Arc<dyn SimilarityIndex>,
    pub episodic: Arc<dyn SimilarityIndex>,
}

impl TierIndexes {
    pub fn in_memory() -> Self {
        Self {
            session: Arc::new(InMemoryIndex::new(Tier::Session.collection())),
            persistent: Arc::new(InMemoryIndex::new(Tier::Persistent.collection())),
            episodic: Arc::new(InMemoryIndex::new(Tier::Episodic.collection())),
        }
    }

    /// Open (or create) one LanceDB table per tier under `data_dir`.
    pub async fn lance(data_dir: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let open = |tier: Tier| async move {
            LanceIndex::open(data_dir, &tier.collection(), dimension).await
        };
        Ok(Self {
            session: Arc::new(open(Tier::Session).await?),
            persistent: Arc::new(open(Tier::Persistent).await?),
            episodic: Arc::new(open(Tier::Episodic).await?),
        })
    }

    /// Indexes for the backend named in `config.storage.backend`.
    pub async fn from_config(config: &Config, dimension: usize) -> Result<Self> {
        match config.storage.backend.as_str() {
            "lance" => {
                info!("Initializing LanceDB indexes at: {}", config.storage.data_dir.display());
                Self::lance(&config.storage.data_dir, dimension).await
            }
            _ => Ok(Self::in_memory()),
        }
    }
}

pub struct MemorySystemBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    embedder: Option<Arc<dyn EmbeddingPort>>,
    indexes: Option<TierIndexes>,
}

impl MemorySystemBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingPort>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn indexes(mut self, indexes: TierIndexes) -> Self {
        self.indexes = Some(indexes);
        self
    }

    /// Defaults: system clock, local fastembed model, in-memory indexes.
    pub fn build(self) -> Result<MemorySystem> {
        let config = self.config;
        config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let embedder: Arc<dyn EmbeddingPort> = match self.embedder {
            Some(embedder) => embedder,
            None => Arc::new(FastEmbedder::new()?),
        };
        let indexes = self.indexes.unwrap_or_else(TierIndexes::in_memory);

        let session = Arc::new(SessionStore::new(
            indexes.session,
            embedder.clone(),
            clock.clone(),
            &config,
        ));
        let persistent = Arc::new(PersistentStore::new(
            indexes.persistent,
            embedder.clone(),
            clock.clone(),
            &config,
        ));
        let episodic = Arc::new(EpisodicStore::new(
            indexes.episodic,
            embedder.clone(),
            clock.clone(),
            &config,
        ));
        let affect = Arc::new(AffectiveLedger::new(&config.affect));
        let queue = Arc::new(PendingQueue::new(config.consolidation, clock.clone()));
        let pipeline = Arc::new(ConsolidationPipeline::new(
            PipelineParts {
                session: session.clone(),
                persistent: persistent.clone(),
                episodic: episodic.clone(),
                embedder: embedder.clone(),
                affect: affect.clone(),
                queue: queue.clone(),
                clock: clock.clone(),
            },
            &config,
        ));
        let scheduler = Arc::new(Scheduler::new(
            pipeline.clone(),
            clock.clone(),
            config.consolidation,
        ));

        info!("Memory system ready (embedder: {})", embedder.name());
        Ok(MemorySystem {
            config,
            clock,
            embedder,
            session,
            persistent,
            episodic,
            affect,
            queue,
            pipeline,
            scheduler,
        })
    }
}

/// All tiers plus the pipeline that connects them
pub struct MemorySystem {
    config: Config,
    clock: Arc<dyn Clock>,
    embedder: Arc<dyn EmbeddingPort>,
    session: Arc<SessionStore>,
    persistent: Arc<PersistentStore>,
    episodic: Arc<EpisodicStore>,
    affect: Arc<AffectiveLedger>,
    queue: Arc<PendingQueue>,
    pipeline: Arc<ConsolidationPipeline>,
    scheduler: Arc<Scheduler>,
}

impl MemorySystem {
    pub fn builder(config: Config) -> MemorySystemBuilder {
        MemorySystemBuilder {
            config,
            clock: None,
            embedder: None,
            indexes: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn persistent(&self) -> &Arc<PersistentStore> {
        &self.persistent
    }

    pub fn episodic(&self) -> &Arc<EpisodicStore> {
        &self.episodic
    }

    pub fn affect(&self) -> &Arc<AffectiveLedger> {
        &self.affect
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Arc<ConsolidationPipeline> {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// A fresh active buffer whose evictions feed the consolidation queue
    /// and whose assembly searches `session_id`.
    pub fn active_buffer(&self, session_id: Option<SessionId>) -> ActiveBuffer {
        let buffer = ActiveBuffer::new(&self.config, self.queue.clone(), self.clock.clone())
            .with_sources(AssemblySources {
                session: self.session.clone(),
                persistent: self.persistent.clone(),
                embedder: self.embedder.clone(),
            });
        match session_id {
            Some(session_id) => buffer.with_session(session_id),
            None => buffer,
        }
    }

    /// Reload the persistent and episodic tiers from their indexes. Call once
    /// after building over durable indexes. Returns the number of items loaded.
    pub async fn restore(&self) -> Result<usize> {
        let persistent = self.persistent.restore().await?;
        let episodic = self.episodic.restore().await?;
        Ok(persistent + episodic)
    }

    /// Write into the session store with the configured default ttl.
    pub async fn remember(&self, item: MemoryItem) -> Result<PutOutcome> {
        self.session.put(item, self.config.session.ttl()).await
    }

    /// Channel feeding the affective ledger from a background listener.
    pub fn affect_channel(&self, capacity: usize) -> mpsc::Sender<AffectiveSignal> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.affect.clone().spawn_listener(rx);
        tx
    }
}
