//! Objective scoring: reduces an evaluation result to one comparable scalar.

use mt_types::{ConfigurationError, EvaluationResult, Score, Verdict};
use serde::{Deserialize, Serialize};

/// One term of the passing-score combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricWeight {
    /// Metric name as reported by the driver (e.g. "util").
    pub metric: String,
    pub weight: f64,
    /// When set, the metric contributes `min(value / cap, 1.0)` instead of the
    /// raw value. Used to express throughput relative to a reference.
    #[serde(default)]
    pub cap: Option<f64>,
}

impl MetricWeight {
    pub fn new(metric: impl Into<String>, weight: f64) -> Self {
        Self {
            metric: metric.into(),
            weight,
            cap: None,
        }
    }

    pub fn capped(mut self, cap: f64) -> Self {
        self.cap = Some(cap);
        self
    }
}

/// Scores assigned to failing verdicts. All must be strictly negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyPolicy {
    pub timeout: f64,
    pub fail: f64,
    pub incorrect: f64,
    pub crash: f64,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self {
            timeout: -1.0,
            fail: -2.0,
            incorrect: -3.0,
            crash: -4.0,
        }
    }
}

impl PenaltyPolicy {
    fn penalty(&self, verdict: Verdict) -> Option<f64> {
        match verdict {
            Verdict::Pass => None,
            Verdict::Timeout => Some(self.timeout),
            Verdict::Fail => Some(self.fail),
            Verdict::Incorrect => Some(self.incorrect),
            Verdict::Crash => Some(self.crash),
        }
    }
}

/// Serializable scoring section of a session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub weights: Vec<MetricWeight>,
    #[serde(default)]
    pub penalties: PenaltyPolicy,
}

impl Default for ScoringConfig {
    /// Utilisation and throughput weighted 60/40, throughput normalised
    /// against a reference of 10 000 Kops/s.
    fn default() -> Self {
        Self {
            weights: vec![
                MetricWeight::new("util", 0.6),
                MetricWeight::new("thru", 0.4).capped(10_000.0),
            ],
            penalties: PenaltyPolicy::default(),
        }
    }
}

/// Pure, stateless scorer. Passing results always score `>= 0`, failing
/// ones always score below zero, so any pass outranks any failure.
#[derive(Debug, Clone)]
pub struct ObjectiveScorer {
    config: ScoringConfig,
}

impl ObjectiveScorer {
    pub fn new(config: ScoringConfig) -> Result<Self, ConfigurationError> {
        if config.weights.is_empty() {
            return Err(ConfigurationError::Invalid(
                "scoring needs at least one metric weight".to_string(),
            ));
        }
        for w in &config.weights {
            if !w.weight.is_finite() || w.weight < 0.0 {
                return Err(ConfigurationError::Invalid(format!(
                    "weight for {} must be finite and non-negative, got {}",
                    w.metric, w.weight
                )));
            }
            if let Some(cap) = w.cap {
                if !cap.is_finite() || cap <= 0.0 {
                    return Err(ConfigurationError::Invalid(format!(
                        "cap for {} must be positive, got {cap}",
                        w.metric
                    )));
                }
            }
        }
        let p = &config.penalties;
        for (name, value) in [
            ("timeout", p.timeout),
            ("fail", p.fail),
            ("incorrect", p.incorrect),
            ("crash", p.crash),
        ] {
            if !value.is_finite() || value >= 0.0 {
                return Err(ConfigurationError::Invalid(format!(
                    "{name} penalty must be negative, got {value}"
                )));
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, result: &EvaluationResult) -> Score {
        match self.config.penalties.penalty(result.verdict) {
            Some(penalty) => Score::new(penalty),
            None => Score::new(self.combine(result)),
        }
    }

    /// Weighted sum of the clamped metric terms. Missing or non-finite metrics
    /// contribute zero.
    fn combine(&self, result: &EvaluationResult) -> f64 {
        self.config
            .weights
            .iter()
            .map(|w| {
                let raw = result
                    .metric(&w.metric)
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0)
                    .max(0.0);
                let term = match w.cap {
                    Some(cap) => (raw / cap).min(1.0),
                    None => raw,
                };
                w.weight * term
            })
            .sum::<f64>()
            .max(0.0)
    }
}

impl Default for ObjectiveScorer {
    fn default() -> Self {
        Self {
            config: ScoringConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt_types::{EvaluationStage, Metrics};

    fn passing(util: f64, thru: f64) -> EvaluationResult {
        let mut metrics = Metrics::new();
        metrics.insert("util".into(), util);
        metrics.insert("thru".into(), thru);
        EvaluationResult::pass(metrics)
    }

    fn failing() -> Vec<EvaluationResult> {
        vec![
            EvaluationResult::build_failure("cc: error"),
            EvaluationResult::timeout(EvaluationStage::Run, "slow"),
            EvaluationResult::timeout(EvaluationStage::Build, "slow build"),
            EvaluationResult::crash("SIGSEGV"),
            EvaluationResult::incorrect("payload overlap"),
        ]
    }

    #[test]
    fn every_failure_below_every_pass() {
        let scorer = ObjectiveScorer::default();
        let passes = [
            passing(0.0, 0.0),
            passing(-5.0, f64::NAN),
            passing(0.9, 20_000.0),
            EvaluationResult::pass(Metrics::new()),
        ];
        for f in failing() {
            for p in &passes {
                assert!(
                    scorer.score(&f) < scorer.score(p),
                    "{:?} should score below {:?}",
                    f.verdict,
                    p.metrics
                );
            }
        }
    }

    #[test]
    fn default_penalty_ordering() {
        let scorer = ObjectiveScorer::default();
        let timeout = scorer.score(&EvaluationResult::timeout(EvaluationStage::Run, ""));
        let fail = scorer.score(&EvaluationResult::build_failure(""));
        let incorrect = scorer.score(&EvaluationResult::incorrect(""));
        let crash = scorer.score(&EvaluationResult::crash(""));
        assert!(timeout > fail);
        assert!(fail > incorrect);
        assert!(incorrect > crash);
    }

    #[test]
    fn weighted_combination_with_cap() {
        let scorer = ObjectiveScorer::default();
        let s = scorer.score(&passing(0.5, 5_000.0)).value();
        assert!((s - (0.6 * 0.5 + 0.4 * 0.5)).abs() < 1e-12);

        let saturated = scorer.score(&passing(0.5, 50_000.0)).value();
        assert!((saturated - (0.6 * 0.5 + 0.4)).abs() < 1e-12);
    }

    #[test]
    fn monotonic_and_stable() {
        let scorer = ObjectiveScorer::default();
        let low = passing(0.4, 3_000.0);
        let high = passing(0.7, 3_000.0);
        assert!(scorer.score(&high) > scorer.score(&low));
        assert_eq!(scorer.score(&high), scorer.score(&high.clone()));
    }

    #[test]
    fn rejects_bad_configs() {
        let negative_weight = ScoringConfig {
            weights: vec![MetricWeight::new("util", -1.0)],
            penalties: PenaltyPolicy::default(),
        };
        assert!(ObjectiveScorer::new(negative_weight).is_err());

        let positive_penalty = ScoringConfig {
            weights: vec![MetricWeight::new("util", 1.0)],
            penalties: PenaltyPolicy {
                crash: 0.5,
                ..Default::default()
            },
        };
        assert!(ObjectiveScorer::new(positive_penalty).is_err());

        let empty = ScoringConfig {
            weights: Vec::new(),
            penalties: PenaltyPolicy::default(),
        };
        assert!(ObjectiveScorer::new(empty).is_err());
    }
}
