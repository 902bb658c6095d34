//! Importance scoring shared by every tier
//!
//! Everything here is a pure function of its inputs and a [`ScoringConfig`],
//! so the same item always scores the same way regardless of which store
//! asks.

use chrono::{DateTime, Duration, Utc};

use crate::config::ScoringConfig;
use crate::memory::types::MemoryItem;

/// Inputs to the importance formula
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub access_count: u64,
    pub affective_valence: f32,
    /// Novelty in [0, 1]; 1 when nothing similar exists
    pub novelty: f32,
}

impl ScoreInputs {
    pub fn for_item(item: &MemoryItem, novelty: f32) -> Self {
        Self {
            access_count: item.access_count,
            affective_valence: item.affective_valence,
            novelty,
        }
    }
}

/// `base + access_weight * access_count + affective_weight * |valence| + novelty_weight * novelty`,
/// clamped to [0, 1].
pub fn importance(inputs: &ScoreInputs, config: &ScoringConfig) -> f32 {
    let valence = if inputs.affective_valence.is_finite() {
        inputs.affective_valence.clamp(-1.0, 1.0).abs()
    } else {
        0.0
    };
    let novelty = if inputs.novelty.is_finite() {
        inputs.novelty.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let raw = config.base_score
        + config.access_weight * inputs.access_count as f32
        + config.affective_weight * valence
        + config.novelty_weight * novelty;

    raw.clamp(0.0, 1.0)
}

/// Novelty of an item given the best similarity found among its neighbours.
pub fn novelty_from_similarity(max_similarity: Option<f32>) -> f32 {
    match max_similarity {
        Some(similarity) if similarity.is_finite() => (1.0 - similarity).clamp(0.0, 1.0),
        Some(_) => 0.0,
        None => 1.0,
    }
}

pub fn is_near_duplicate(similarity: f32, config: &ScoringConfig) -> bool {
    similarity > config.novelty_threshold
}

/// Strengthen an item on retrieval.
///
/// Increments `access_count`, then adds `access_weight * ln(1 + access_count)`
/// to the importance. The result never decreases.
pub fn reconsolidate(item: &mut MemoryItem, config: &ScoringConfig, now: DateTime<Utc>) {
    item.access_count = item.access_count.saturating_add(1);
    let boost = config.access_weight * (1.0 + item.access_count as f32).ln();
    item.set_importance(item.importance_score + boost.max(0.0));
    if now > item.last_accessed_at {
        item.last_accessed_at = now;
    }
}

/// Fold a near-duplicate into an existing item.
pub fn merge_boost(item: &mut MemoryItem, config: &ScoringConfig, now: DateTime<Utc>) {
    item.access_count = item.access_count.saturating_add(1);
    item.set_importance(item.importance_score + config.novelty_boost);
    if now > item.last_accessed_at {
        item.last_accessed_at = now;
    }
}

/// Half-life recency weight in (0, 1]. Future timestamps count as age zero.
pub fn recency_decay(age: Duration, config: &ScoringConfig) -> f32 {
    let age_secs = age.num_milliseconds().max(0) as f64 / 1000.0;
    let half_life = config.recency_half_life_secs.max(1) as f64;
    0.5f64.powf(age_secs / half_life) as f32
}

/// Multiplier applied by the pipeline's decay step after `elapsed` time.
///
/// `exp(-decay_rate * elapsed / sweep_interval)`, so one full interval at the
/// default rate of 0.01 takes about one percent off.
pub fn decay_factor(elapsed: Duration, sweep_interval: Duration, config: &ScoringConfig) -> f32 {
    let interval_ms = sweep_interval.num_milliseconds();
    let elapsed_ms = elapsed.num_milliseconds();
    if interval_ms <= 0 || elapsed_ms <= 0 {
        return 1.0;
    }
    let intervals = elapsed_ms as f64 / interval_ms as f64;
    (-(config.decay_rate as f64) * intervals).exp() as f32
}

/// Cosine similarity in [-1, 1]; 0 for empty, mismatched or zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ScoringConfig {
        ScoringConfig {
            base_score: 0.1,
            access_weight: 0.05,
            affective_weight: 0.3,
            novelty_weight: 0.2,
            ..ScoringConfig::default()
        }
    }

    mod formula {
        use super::*;

        #[test]
        fn deterministic_for_fixed_inputs() {
            let inputs = ScoreInputs {
                access_count: 2,
                affective_valence: -0.5,
                novelty: 0.5,
            };
            let expected = 0.1 + 0.05 * 2.0 + 0.3 * 0.5 + 0.2 * 0.5;
            let first = importance(&inputs, &config());
            let second = importance(&inputs, &config());
            assert_eq!(first, second);
            assert!((first - expected).abs() < 1e-6, "got {first}, want {expected}");
        }

        #[test]
        fn negative_valence_counts_by_magnitude() {
            let pos = ScoreInputs {
                access_count: 0,
                affective_valence: 0.8,
                novelty: 0.0,
            };
            let neg = ScoreInputs {
                affective_valence: -0.8,
                ..pos
            };
            assert_eq!(importance(&pos, &config()), importance(&neg, &config()));
        }

        #[test]
        fn clamps_to_unit_interval() {
            let inputs = ScoreInputs {
                access_count: 1000,
                affective_valence: 1.0,
                novelty: 1.0,
            };
            assert_eq!(importance(&inputs, &config()), 1.0);

            let cfg = ScoringConfig {
                base_score: 0.0,
                ..config()
            };
            let inputs = ScoreInputs {
                access_count: 0,
                affective_valence: f32::NAN,
                novelty: f32::NAN,
            };
            assert_eq!(importance(&inputs, &cfg), 0.0);
        }

        #[test]
        fn novelty_from_similarity_bounds() {
            assert_eq!(novelty_from_similarity(None), 1.0);
            assert_eq!(novelty_from_similarity(Some(1.0)), 0.0);
            assert_eq!(novelty_from_similarity(Some(-0.5)), 1.0);
            assert!((novelty_from_similarity(Some(0.25)) - 0.75).abs() < 1e-6);
        }

        #[test]
        fn near_duplicate_is_strictly_above_threshold() {
            let cfg = config();
            assert!(!is_near_duplicate(cfg.novelty_threshold, &cfg));
            assert!(is_near_duplicate(cfg.novelty_threshold + 0.01, &cfg));
        }
    }

    mod reconsolidation {
        use super::*;

        #[test]
        fn increments_access_and_adds_log_boost() {
            let mut item = MemoryItem::new("x").with_importance(0.4);
            let now = Utc::now();
            reconsolidate(&mut item, &config(), now);

            assert_eq!(item.access_count, 1);
            let expected = 0.4 + 0.05 * 2f32.ln();
            assert!((item.importance_score - expected).abs() < 1e-6);
            assert_eq!(item.last_accessed_at, now);
        }

        #[test]
        fn never_decreases() {
            let mut item = MemoryItem::new("x").with_importance(0.99);
            let mut previous = item.importance_score;
            for _ in 0..50 {
                reconsolidate(&mut item, &config(), Utc::now());
                assert!(item.importance_score >= previous);
                assert!(item.importance_score <= 1.0);
                previous = item.importance_score;
            }
        }

        #[test]
        fn merge_boost_adds_configured_amount() {
            let mut item = MemoryItem::new("x").with_importance(0.3);
            merge_boost(&mut item, &config(), Utc::now());
            assert_eq!(item.access_count, 1);
            assert!((item.importance_score - 0.35).abs() < 1e-6);
        }
    }

    mod decay {
        use super::*;

        #[test]
        fn recency_halves_each_half_life() {
            let cfg = ScoringConfig {
                recency_half_life_secs: 100,
                ..config()
            };
            assert_eq!(recency_decay(Duration::zero(), &cfg), 1.0);
            assert!((recency_decay(Duration::seconds(100), &cfg) - 0.5).abs() < 1e-6);
            assert!((recency_decay(Duration::seconds(200), &cfg) - 0.25).abs() < 1e-6);
            assert_eq!(recency_decay(Duration::seconds(-50), &cfg), 1.0);
        }

        #[test]
        fn decay_factor_is_exponential_in_intervals() {
            let cfg = ScoringConfig {
                decay_rate: 0.1,
                ..config()
            };
            let interval = Duration::seconds(60);
            let one = decay_factor(Duration::seconds(60), interval, &cfg);
            let two = decay_factor(Duration::seconds(120), interval, &cfg);
            assert!((one - (-0.1f32).exp()).abs() < 1e-6);
            assert!((two - one * one).abs() < 1e-6);
            assert_eq!(decay_factor(Duration::zero(), interval, &cfg), 1.0);
        }
    }

    mod cosine {
        use super::*;

        #[test]
        fn identical_vectors() {
            assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        }

        #[test]
        fn orthogonal_and_opposite() {
            assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
            assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        }

        #[test]
        fn degenerate_inputs_score_zero() {
            assert_eq!(cosine_similarity(&[], &[]), 0.0);
            assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
            assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        }
    }
}
