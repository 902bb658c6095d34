use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StrataError};

/// Longest duration any `*_secs` setting may hold (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Seconds to a chrono duration, saturating at `MAX_DURATION_SECS`.
fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Main configuration structure for Strata
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Backend selection and content limits
    #[serde(default)]
    pub storage: StorageConfig,
    /// Embedding port configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Active buffer (working memory) bounds
    #[serde(default)]
    pub active: ActiveConfig,
    /// Session store configuration
    #[serde(default)]
    pub session: SessionConfig,
    /// Importance scoring weights and thresholds, shared by all tiers
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Consolidation pipeline scheduling and retry policy
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Affective signal handling
    #[serde(default)]
    pub affect: AffectConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the first default location
    /// that exists. Falls back to defaults when no file is found.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::from_file(&path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".strata").join("config.toml")),
            dirs::config_dir().map(|c| c.join("strata").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StrataError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break tier invariants.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f32| {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(StrataError::Config(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        let positive = |name: &str, v: u64| {
            if v > 0 {
                Ok(())
            } else {
                Err(StrataError::Config(format!("{name} must be positive")))
            }
        };
        let bounded = |name: &str, v: u64| {
            if v <= MAX_DURATION_SECS {
                Ok(())
            } else {
                Err(StrataError::Config(format!(
                    "{name} must be at most {MAX_DURATION_SECS}, got {v}"
                )))
            }
        };

        unit("scoring.base_score", self.scoring.base_score)?;
        unit("scoring.novelty_threshold", self.scoring.novelty_threshold)?;
        unit("scoring.promotion_threshold", self.scoring.promotion_threshold)?;
        unit("scoring.novelty_boost", self.scoring.novelty_boost)?;
        unit("active.relevance_threshold", self.active.relevance_threshold)?;

        for (name, w) in [
            ("scoring.access_weight", self.scoring.access_weight),
            ("scoring.affective_weight", self.scoring.affective_weight),
            ("scoring.novelty_weight", self.scoring.novelty_weight),
            ("scoring.decay_rate", self.scoring.decay_rate),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(StrataError::Config(format!(
                    "{name} must be a non-negative number, got {w}"
                )));
            }
        }

        positive("active.capacity", self.active.capacity as u64)?;
        positive("active.token_budget", self.active.token_budget as u64)?;
        positive("active.top_k", self.active.top_k as u64)?;
        positive("session.ttl_secs", self.session.ttl_secs)?;
        positive("consolidation.sweep_interval_secs", self.consolidation.sweep_interval_secs)?;
        positive("consolidation.lease_secs", self.consolidation.lease_secs)?;
        positive(
            "consolidation.max_concurrent_sessions",
            self.consolidation.max_concurrent_sessions as u64,
        )?;
        positive("consolidation.batch_size", self.consolidation.batch_size as u64)?;
        positive("embedding.dimension", self.embedding.dimension as u64)?;
        positive("storage.max_content_bytes", self.storage.max_content_bytes as u64)?;
        positive("scoring.recency_half_life_secs", self.scoring.recency_half_life_secs)?;
        positive("consolidation.max_retries", u64::from(self.consolidation.max_retries))?;
        positive("consolidation.poll_interval_ms", self.consolidation.poll_interval_ms)?;
        positive("embedding.timeout_ms", self.embedding.timeout_ms)?;
        positive("active.assemble_timeout_ms", self.active.assemble_timeout_ms)?;
        positive("affect.lookback_secs", self.affect.lookback_secs)?;

        for (name, secs) in [
            ("session.ttl_secs", self.session.ttl_secs),
            ("consolidation.sweep_interval_secs", self.consolidation.sweep_interval_secs),
            ("consolidation.lease_secs", self.consolidation.lease_secs),
            ("consolidation.retry_backoff_secs", self.consolidation.retry_backoff_secs),
            ("scoring.recency_half_life_secs", self.scoring.recency_half_life_secs),
            ("affect.lookback_secs", self.affect.lookback_secs),
        ] {
            bounded(name, secs)?;
        }

        match self.storage.backend.as_str() {
            "memory" | "lance" => Ok(()),
            other => Err(StrataError::Config(format!(
                "Unknown storage backend: {other}"
            ))),
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Similarity index backend: "memory" or "lance"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Base directory for LanceDB collections
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Upper bound on rendered content size, in bytes
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn default_max_content_bytes() -> usize {
    32 * 1024
}

/// Embedding port configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Upper bound on a single embed call
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_ms: default_embedding_timeout_ms(),
        }
    }
}

fn default_embedding_provider() -> String {
    "fastembed".to_string()
}

fn default_embedding_model() -> String {
    "multilingual-e5-small".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_timeout_ms() -> u64 {
    5000
}

/// Active buffer bounds and assembly tuning
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ActiveConfig {
    /// Maximum number of resident items
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Maximum aggregate token size of resident items
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Hits requested from each tier during assembly
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Session hits at or above this similarity count toward `top_k`
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
    #[serde(default = "default_assemble_timeout_ms")]
    pub assemble_timeout_ms: u64,
}

impl ActiveConfig {
    pub fn assemble_timeout(&self) -> Duration {
        Duration::from_millis(self.assemble_timeout_ms)
    }
}

impl Default for ActiveConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            token_budget: default_token_budget(),
            top_k: default_top_k(),
            relevance_threshold: default_relevance_threshold(),
            assemble_timeout_ms: default_assemble_timeout_ms(),
        }
    }
}

fn default_capacity() -> usize {
    32
}

fn default_token_budget() -> usize {
    4000
}

fn default_top_k() -> usize {
    8
}

fn default_relevance_threshold() -> f32 {
    0.3
}

fn default_assemble_timeout_ms() -> u64 {
    2000
}

/// Session store configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SessionConfig {
    /// Default time-to-live for session items
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        seconds(self.ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

/// Weights and thresholds for importance scoring.
///
/// One instance is shared by every tier so that the same inputs always
/// produce the same score.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_base_score")]
    pub base_score: f32,
    #[serde(default = "default_access_weight")]
    pub access_weight: f32,
    #[serde(default = "default_affective_weight")]
    pub affective_weight: f32,
    #[serde(default = "default_novelty_weight")]
    pub novelty_weight: f32,
    /// Cosine similarity above which two items are treated as duplicates
    #[serde(default = "default_novelty_threshold")]
    pub novelty_threshold: f32,
    /// Importance added to an existing item when a duplicate is merged into it
    #[serde(default = "default_novelty_boost")]
    pub novelty_boost: f32,
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: f32,
    /// Exponential decay rate applied per sweep interval
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f32,
    #[serde(default = "default_recency_half_life_secs")]
    pub recency_half_life_secs: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_score: default_base_score(),
            access_weight: default_access_weight(),
            affective_weight: default_affective_weight(),
            novelty_weight: default_novelty_weight(),
            novelty_threshold: default_novelty_threshold(),
            novelty_boost: default_novelty_boost(),
            promotion_threshold: default_promotion_threshold(),
            decay_rate: default_decay_rate(),
            recency_half_life_secs: default_recency_half_life_secs(),
        }
    }
}

fn default_base_score() -> f32 {
    0.1
}

fn default_access_weight() -> f32 {
    0.05
}

fn default_affective_weight() -> f32 {
    0.3
}

fn default_novelty_weight() -> f32 {
    0.2
}

fn default_novelty_threshold() -> f32 {
    0.92
}

fn default_novelty_boost() -> f32 {
    0.05
}

fn default_promotion_threshold() -> f32 {
    0.5
}

fn default_decay_rate() -> f32 {
    0.01
}

fn default_recency_half_life_secs() -> u64 {
    7 * 24 * 3600
}

/// Consolidation pipeline scheduling and retry policy
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Failed attempts allowed before an item is parked as stuck
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential retry backoff
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// How long a claim stays valid before another worker may take the item
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Maximum items claimed per sweep
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wake-up period of the scheduler loop between full sweeps
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ConsolidationConfig {
    pub fn sweep_interval(&self) -> chrono::Duration {
        seconds(self.sweep_interval_secs)
    }

    pub fn lease(&self) -> chrono::Duration {
        seconds(self.lease_secs)
    }

    /// Delay before retrying an item that has failed `attempts` times.
    pub fn backoff(&self, attempts: u32) -> chrono::Duration {
        let factor = 1u64 << attempts.saturating_sub(1).min(16);
        seconds(self.retry_backoff_secs.saturating_mul(factor))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            lease_secs: default_lease_secs(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_secs() -> u64 {
    30
}

fn default_lease_secs() -> u64 {
    60
}

fn default_max_concurrent_sessions() -> usize {
    4
}

fn default_batch_size() -> usize {
    256
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Affective signal handling
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AffectConfig {
    /// Signals older than this are ignored when scoring
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
}

impl AffectConfig {
    pub fn lookback(&self) -> chrono::Duration {
        seconds(self.lookback_secs)
    }
}

impl Default for AffectConfig {
    fn default() -> Self {
        Self {
            lookback_secs: default_lookback_secs(),
        }
    }
}

fn default_lookback_secs() -> u64 {
    900
}
