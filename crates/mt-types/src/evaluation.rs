//! Evaluation outcomes and scores.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Categorical outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    /// The build step failed: non-zero exit or compiler error.
    Fail,
    Timeout,
    /// Abnormal termination of the driver, or a detected memory-safety violation.
    Crash,
    /// The driver reported wrong results, corrupted data or a violated
    /// alignment/size contract.
    Incorrect,
}

impl Verdict {
    pub const ALL: [Verdict; 5] = [
        Verdict::Pass,
        Verdict::Fail,
        Verdict::Timeout,
        Verdict::Crash,
        Verdict::Incorrect,
    ];

    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
            Self::Crash => "crash",
            Self::Incorrect => "incorrect",
        };
        f.write_str(s)
    }
}

/// Which half of the pipeline produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStage {
    Build,
    Run,
}

/// Named performance metrics captured from a passing driver run.
pub type Metrics = BTreeMap<String, f64>;

/// Complete result of one evaluation. Metrics are only ever present on a
/// passing verdict; the constructors below are the supported way to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub verdict: Verdict,
    pub stage: EvaluationStage,
    pub metrics: Metrics,
    /// Human-readable reason for a failing verdict.
    pub detail: Option<String>,
    pub build_millis: u64,
    pub run_millis: u64,
}

impl EvaluationResult {
    pub fn pass(metrics: Metrics) -> Self {
        Self {
            verdict: Verdict::Pass,
            stage: EvaluationStage::Run,
            metrics,
            detail: None,
            build_millis: 0,
            run_millis: 0,
        }
    }

    pub fn build_failure(detail: impl Into<String>) -> Self {
        Self::failing(Verdict::Fail, EvaluationStage::Build, detail)
    }

    pub fn timeout(stage: EvaluationStage, detail: impl Into<String>) -> Self {
        Self::failing(Verdict::Timeout, stage, detail)
    }

    pub fn crash(detail: impl Into<String>) -> Self {
        Self::failing(Verdict::Crash, EvaluationStage::Run, detail)
    }

    pub fn incorrect(detail: impl Into<String>) -> Self {
        Self::failing(Verdict::Incorrect, EvaluationStage::Run, detail)
    }

    fn failing(verdict: Verdict, stage: EvaluationStage, detail: impl Into<String>) -> Self {
        Self {
            verdict,
            stage,
            metrics: Metrics::new(),
            detail: Some(detail.into()),
            build_millis: 0,
            run_millis: 0,
        }
    }

    pub fn with_timings(mut self, build_millis: u64, run_millis: u64) -> Self {
        self.build_millis = build_millis;
        self.run_millis = run_millis;
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Scalar objective, higher is better. Totally ordered through
/// [`f64::total_cmp`] so scores can be sorted and compared without NaN holes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f64);

impl Score {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_results_carry_no_metrics() {
        let r = EvaluationResult::build_failure("undefined reference to `mem_sbrk'");
        assert_eq!(r.verdict, Verdict::Fail);
        assert_eq!(r.stage, EvaluationStage::Build);
        assert!(r.metrics.is_empty());

        let r = EvaluationResult::timeout(EvaluationStage::Run, "driver exceeded 30s");
        assert_eq!(r.verdict, Verdict::Timeout);
        assert_eq!(r.stage, EvaluationStage::Run);
    }

    #[test]
    fn score_total_order() {
        let mut scores = vec![Score::new(0.5), Score::new(-3.0), Score::new(0.9)];
        scores.sort();
        assert_eq!(scores[0], Score::new(-3.0));
        assert_eq!(scores[2], Score::new(0.9));
    }

    #[test]
    fn verdict_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Verdict::Incorrect).unwrap(), "\"incorrect\"");
        assert_eq!(Verdict::Crash.to_string(), "crash");
    }
}
