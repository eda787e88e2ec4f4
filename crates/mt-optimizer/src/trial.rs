//! Trial records and the shared evaluation history.

use chrono::{DateTime, Utc};
use mt_types::{Assignment, BuildInputs, EvaluationResult, Metrics, Score, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// A single recorded evaluation (one candidate, one score).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    /// 0-indexed position in the session history.
    pub number: usize,
    pub assignment: Assignment,
    pub inputs: BuildInputs,
    pub verdict: Verdict,
    pub metrics: Metrics,
    pub detail: Option<String>,
    pub score: Score,
    /// Recorded from the result cache instead of a fresh build.
    pub cached: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Trial {
    pub fn new(
        assignment: Assignment,
        inputs: BuildInputs,
        result: &EvaluationResult,
        score: Score,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            number: 0,
            assignment,
            inputs,
            verdict: result.verdict,
            metrics: result.metrics.clone(),
            detail: result.detail.clone(),
            score,
            cached: false,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn mark_cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn duration_millis(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Append-only record of `(assignment, score)` pairs plus the running best.
///
/// Strategies read it on every ask; the search loop is its only writer.
#[derive(Debug, Clone, Default)]
pub struct History {
    trials: Vec<Trial>,
    best: Option<usize>,
    seen: HashSet<BuildInputs>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trial. Returns `true` when it strictly improves on the best
    /// score so far; ties keep the earlier trial.
    pub fn record(&mut self, mut trial: Trial) -> bool {
        trial.number = self.trials.len();
        let improved = match self.best() {
            None => true,
            Some(current) => trial.score > current.score,
        };
        self.seen.insert(trial.inputs.clone());
        self.trials.push(trial);
        if improved {
            self.best = Some(self.trials.len() - 1);
        }
        improved
    }

    pub fn best(&self) -> Option<&Trial> {
        self.best.map(|i| &self.trials[i])
    }

    pub fn best_score(&self) -> Option<Score> {
        self.best().map(|t| t.score)
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn last(&self) -> Option<&Trial> {
        self.trials.last()
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Whether a candidate with these build inputs has been recorded.
    pub fn contains(&self, inputs: &BuildInputs) -> bool {
        self.seen.contains(inputs)
    }

    /// Number of distinct build inputs recorded so far.
    pub fn distinct_inputs(&self) -> usize {
        self.seen.len()
    }

    pub fn verdict_counts(&self) -> BTreeMap<Verdict, usize> {
        let mut counts = BTreeMap::new();
        for trial in &self.trials {
            *counts.entry(trial.verdict).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt_types::BuildDefine;

    fn trial(alignment: i64, score: f64, verdict: Verdict) -> Trial {
        let result = match verdict {
            Verdict::Pass => EvaluationResult::pass(Metrics::new()),
            Verdict::Fail => EvaluationResult::build_failure("error"),
            Verdict::Crash => EvaluationResult::crash("SIGSEGV"),
            Verdict::Incorrect => EvaluationResult::incorrect("overlap"),
            Verdict::Timeout => {
                EvaluationResult::timeout(mt_types::EvaluationStage::Run, "timed out")
            }
        };
        Trial::new(
            Assignment::new().with("ALIGNMENT", alignment),
            BuildInputs::new(vec![BuildDefine::new("ALIGNMENT", alignment.to_string())]),
            &result,
            Score::new(score),
            Utc::now(),
        )
    }

    #[test]
    fn best_tracking() {
        let mut history = History::new();
        assert!(history.best().is_none());

        assert!(history.record(trial(8, 0.5, Verdict::Pass)));
        assert!(history.record(trial(16, 0.8, Verdict::Pass)));
        assert!(!history.record(trial(32, -4.0, Verdict::Crash)));
        // Tie keeps the earlier trial
        assert!(!history.record(trial(64, 0.8, Verdict::Pass)));

        let best = history.best().unwrap();
        assert_eq!(best.number, 1);
        assert_eq!(best.assignment.get("ALIGNMENT").unwrap().as_int(), Some(16));
        for t in history.trials() {
            assert!(best.score >= t.score);
        }
    }

    #[test]
    fn failing_first_trial_becomes_best_until_pass() {
        let mut history = History::new();
        assert!(history.record(trial(8, -2.0, Verdict::Fail)));
        assert_eq!(history.best_score(), Some(Score::new(-2.0)));
        assert!(history.record(trial(16, 0.0, Verdict::Pass)));
        assert_eq!(history.best().unwrap().verdict, Verdict::Pass);
    }

    #[test]
    fn seen_and_counts() {
        let mut history = History::new();
        history.record(trial(8, 0.5, Verdict::Pass));
        history.record(trial(16, -3.0, Verdict::Incorrect));
        history.record(trial(32, -3.0, Verdict::Incorrect));

        let sixteen = BuildInputs::new(vec![BuildDefine::new("ALIGNMENT", "16")]);
        assert!(history.contains(&sixteen));
        let counts = history.verdict_counts();
        assert_eq!(counts.get(&Verdict::Incorrect), Some(&2));
        assert_eq!(counts.get(&Verdict::Pass), Some(&1));
        assert_eq!(counts.get(&Verdict::Crash), None);
    }

    #[test]
    fn distinct_inputs_ignore_repeats() {
        let mut history = History::new();
        history.record(trial(8, 0.5, Verdict::Pass));
        history.record(trial(8, 0.5, Verdict::Pass).mark_cached());
        history.record(trial(16, 0.7, Verdict::Pass));
        assert_eq!(history.len(), 3);
        assert_eq!(history.distinct_inputs(), 2);
    }

    #[test]
    fn trial_serialization() {
        let t = trial(8, 0.5, Verdict::Pass);
        let json = serde_json::to_string(&t).unwrap();
        let back: Trial = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
