//! The search loop.
//!
//! A [`TuningSession`] repeatedly asks its strategy for candidates, evaluates
//! them (in parallel batches of up to `concurrency`), scores the results and
//! records them into the shared history until the budget runs out or the
//! strategy has nothing left to propose.
//!
//! Proposing and recording both happen on the session task, so the strategy
//! and the history each have a single writer. Results of a batch are recorded
//! in proposal order regardless of which evaluation finished first.

use chrono::{DateTime, Utc};
use mt_optimizer::{CandidateEncoder, History, ObjectiveScorer, ParameterSpace, SearchStrategy, Trial};
use mt_types::{
    config_error, internal_error, Assignment, BuildInputs, ConfigurationError, EvaluationResult,
    Metrics, Score, TuneResult, Verdict,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, ResultCache};
use crate::evaluator::{Evaluator, StageTimeouts};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Base delay between retries of a transient infrastructure failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Search budget, fixed at construction. Whichever limit is hit first ends
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub max_seconds: Option<f64>,
}

impl Budget {
    pub fn iterations(n: usize) -> Self {
        Self {
            max_iterations: Some(n),
            max_seconds: None,
        }
    }

    pub fn seconds(secs: f64) -> Self {
        Self {
            max_iterations: None,
            max_seconds: Some(secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_iterations.is_none() && self.max_seconds.is_none() {
            return Err(ConfigurationError::Invalid(
                "budget needs max_iterations or max_seconds".to_string(),
            ));
        }
        if self.max_iterations == Some(0) {
            return Err(ConfigurationError::Invalid(
                "max_iterations must be positive".to_string(),
            ));
        }
        if let Some(secs) = self.max_seconds {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigurationError::Invalid(format!(
                    "max_seconds must be a positive number, got {secs}"
                )));
            }
        }
        Ok(())
    }

    pub fn exhausted(&self, iterations: usize, elapsed: Duration) -> bool {
        self.max_iterations.is_some_and(|max| iterations >= max)
            || self
                .max_seconds
                .is_some_and(|secs| elapsed.as_secs_f64() >= secs)
    }

    pub fn remaining_iterations(&self, iterations: usize) -> Option<usize> {
        self.max_iterations.map(|max| max.saturating_sub(iterations))
    }
}

/// Search loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Proposing,
    Evaluating,
    Scoring,
    Recording,
    Done,
}

impl LoopState {
    /// Allowed forward transitions. `Recording -> Scoring` moves to the next
    /// result of the same batch; `Done` is terminal.
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Idle, Proposing)
                | (Proposing, Evaluating)
                | (Proposing, Done)
                | (Evaluating, Scoring)
                | (Scoring, Recording)
                | (Recording, Scoring)
                | (Recording, Proposing)
                | (Recording, Done)
        )
    }
}

/// Knobs of the loop itself, independent of what is being tuned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    /// Maximum number of evaluations in flight.
    pub concurrency: usize,
    /// Retries of one pipeline entry after a transient infrastructure error.
    pub max_retries: u32,
    /// Re-asks of the strategy before a repeated candidate is accepted.
    pub max_duplicate_proposals: usize,
    pub timeouts: StageTimeouts,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 3,
            max_duplicate_proposals: 16,
            timeouts: StageTimeouts::default(),
        }
    }
}

struct Candidate {
    assignment: Assignment,
    inputs: BuildInputs,
}

#[derive(Clone)]
struct Outcome {
    result: EvaluationResult,
    cached: bool,
    started_at: DateTime<Utc>,
}

pub struct TuningSession<E: Evaluator + 'static> {
    id: Uuid,
    name: String,
    space: Arc<ParameterSpace>,
    encoder: CandidateEncoder,
    strategy: Box<dyn SearchStrategy>,
    evaluator: Arc<E>,
    scorer: ObjectiveScorer,
    cache: Arc<ResultCache>,
    history: History,
    budget: Budget,
    options: SessionOptions,
    state: LoopState,
    progress: ProgressReporter,
    elapsed: Duration,
}

impl<E: Evaluator + 'static> TuningSession<E> {
    pub fn new(
        space: Arc<ParameterSpace>,
        strategy: Box<dyn SearchStrategy>,
        evaluator: E,
        scorer: ObjectiveScorer,
        budget: Budget,
    ) -> TuneResult<Self> {
        budget.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            name: "session".to_string(),
            encoder: CandidateEncoder::new(Arc::clone(&space)),
            space,
            strategy,
            evaluator: Arc::new(evaluator),
            scorer,
            cache: Arc::new(ResultCache::new()),
            history: History::new(),
            budget,
            options: SessionOptions::default(),
            state: LoopState::Idle,
            progress: ProgressReporter::disabled(),
            elapsed: Duration::ZERO,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = SessionOptions {
            concurrency: options.concurrency.max(1),
            ..options
        };
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Share a result cache with other sessions over the same space.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Best recorded candidate and its score.
    pub fn best(&self) -> Option<(&Assignment, Score)> {
        self.history.best().map(|t| (&t.assignment, t.score))
    }

    /// Drive the loop to `Done`.
    ///
    /// Evaluation failures are recorded as penalised trials and never end the
    /// session. Configuration errors and non-transient (or persistently
    /// failing) infrastructure errors abort it; the error's `stage()` names
    /// where it happened.
    pub async fn run(&mut self) -> TuneResult<SessionReport> {
        if self.state != LoopState::Idle {
            return Err(internal_error!("session {} has already run", self.id));
        }
        let started = Instant::now();
        info!(
            session = %self.id,
            name = %self.name,
            strategy = self.strategy.name(),
            parameters = self.space.len(),
            grid = ?self.space.grid_size(),
            "tuning session started"
        );
        self.progress.emit(ProgressEvent::SessionStarted {
            session_id: self.id,
            strategy: self.strategy.name().to_string(),
            parameters: self.space.len(),
            at: Utc::now(),
        });

        let outcome = self.drive(started).await;
        self.state = LoopState::Done;
        self.elapsed = started.elapsed();

        if let Err(e) = outcome {
            error!(session = %self.id, "{}", e.abort_message());
            return Err(e);
        }

        let best_score = self.history.best_score();
        info!(
            session = %self.id,
            iterations = self.history.len(),
            elapsed = ?self.elapsed,
            best = ?best_score.map(Score::value),
            "tuning session finished"
        );
        self.progress.emit(ProgressEvent::SessionFinished {
            session_id: self.id,
            iterations: self.history.len(),
            best_score,
            at: Utc::now(),
        });
        Ok(self.report())
    }

    async fn drive(&mut self, started: Instant) -> TuneResult<()> {
        loop {
            if self.budget.exhausted(self.history.len(), started.elapsed()) {
                debug!("budget exhausted after {} iterations", self.history.len());
                return Ok(());
            }
            self.transition(LoopState::Proposing)?;
            if self.space_covered() {
                info!(
                    candidates = self.history.distinct_inputs(),
                    "every candidate in the space has been evaluated"
                );
                self.transition(LoopState::Done)?;
                return Ok(());
            }
            let batch_size = match self.budget.remaining_iterations(self.history.len()) {
                Some(remaining) => remaining.min(self.options.concurrency),
                None => self.options.concurrency,
            };
            let batch = self.propose_batch(batch_size)?;
            if batch.is_empty() {
                info!(strategy = self.strategy.name(), "strategy has no further candidates");
                self.transition(LoopState::Done)?;
                return Ok(());
            }

            self.transition(LoopState::Evaluating)?;
            let outcomes = self.evaluate_batch(&batch).await?;

            for (candidate, outcome) in batch.into_iter().zip(outcomes) {
                self.transition(LoopState::Scoring)?;
                let score = self.scorer.score(&outcome.result);
                self.transition(LoopState::Recording)?;
                self.record(candidate, outcome, score);
            }
        }
    }

    /// Whether a finite space has no unevaluated candidate left.
    fn space_covered(&self) -> bool {
        self.space
            .grid_size()
            .is_some_and(|size| self.history.distinct_inputs() as u128 >= size)
    }

    fn transition(&mut self, next: LoopState) -> TuneResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(internal_error!(
                "illegal loop transition {:?} -> {:?}",
                self.state,
                next
            ));
        }
        self.state = next;
        Ok(())
    }

    /// Ask the strategy for up to `size` candidates, re-asking a bounded
    /// number of times when it repeats one already seen.
    fn propose_batch(&mut self, size: usize) -> TuneResult<Vec<Candidate>> {
        let mut batch: Vec<Candidate> = Vec::with_capacity(size);
        while batch.len() < size {
            let mut repeats = 0;
            let next = loop {
                let Some(assignment) = self.strategy.propose(&self.space, &self.history) else {
                    break None;
                };
                let inputs = self
                    .encoder
                    .encode(&assignment)
                    .map_err(ConfigurationError::from)?;
                let seen =
                    self.history.contains(&inputs) || batch.iter().any(|c| c.inputs == inputs);
                if !seen {
                    break Some(Candidate { assignment, inputs });
                }
                if repeats >= self.options.max_duplicate_proposals {
                    debug!(candidate = %assignment, "accepting repeated proposal");
                    break Some(Candidate { assignment, inputs });
                }
                repeats += 1;
            };
            match next {
                Some(candidate) => batch.push(candidate),
                None => break,
            }
        }
        Ok(batch)
    }

    async fn evaluate_batch(&self, batch: &[Candidate]) -> TuneResult<Vec<Outcome>> {
        let mut outcomes: Vec<Option<Outcome>> = vec![None; batch.len()];
        let mut first_in_batch: HashMap<&BuildInputs, usize> = HashMap::new();
        let mut pending = JoinSet::new();

        for (index, candidate) in batch.iter().enumerate() {
            if let Some(result) = self.cache.get(&candidate.inputs) {
                debug!(candidate = %candidate.assignment, "served from result cache");
                outcomes[index] = Some(Outcome {
                    result,
                    cached: true,
                    started_at: Utc::now(),
                });
                continue;
            }
            if first_in_batch.contains_key(&candidate.inputs) {
                continue;
            }
            first_in_batch.insert(&candidate.inputs, index);

            let evaluator = Arc::clone(&self.evaluator);
            let assignment = candidate.assignment.clone();
            let progress = self.progress.clone();
            let timeouts = self.options.timeouts;
            let max_retries = self.options.max_retries;
            pending.spawn(async move {
                let started_at = Utc::now();
                let result =
                    evaluate_with_retry(evaluator.as_ref(), &assignment, timeouts, max_retries, &progress)
                        .await;
                (index, started_at, result)
            });
        }

        // An early return drops `pending`, aborting the remaining evaluations
        // and with them their child processes.
        while let Some(joined) = pending.join_next().await {
            let (index, started_at, result) =
                joined.map_err(|e| internal_error!("evaluation task failed: {e}"))?;
            outcomes[index] = Some(Outcome {
                result: result?,
                cached: false,
                started_at,
            });
        }

        for (index, candidate) in batch.iter().enumerate() {
            if outcomes[index].is_some() {
                continue;
            }
            let first = first_in_batch
                .get(&candidate.inputs)
                .and_then(|&i| outcomes[i].clone());
            outcomes[index] = first.map(|o| Outcome { cached: true, ..o });
        }

        outcomes
            .into_iter()
            .map(|o| o.ok_or_else(|| internal_error!("batch entry finished without a result")))
            .collect()
    }

    fn record(&mut self, candidate: Candidate, outcome: Outcome, score: Score) {
        if !outcome.cached {
            self.cache
                .store(candidate.inputs.clone(), outcome.result.clone());
        }
        let mut trial = Trial::new(
            candidate.assignment,
            candidate.inputs,
            &outcome.result,
            score,
            outcome.started_at,
        );
        if outcome.cached {
            trial = trial.mark_cached();
        }
        let improved = self.history.record(trial);

        let Some(trial) = self.history.last() else {
            return;
        };
        self.strategy.observe(trial);

        info!(
            trial = trial.number,
            candidate = %trial.assignment,
            verdict = %trial.verdict,
            score = %trial.score,
            cached = trial.cached,
            "trial recorded"
        );
        self.progress.emit(ProgressEvent::TrialFinished {
            number: trial.number,
            assignment: trial.assignment.clone(),
            verdict: trial.verdict,
            score: trial.score,
            cached: trial.cached,
        });
        if improved {
            info!("new best candidate {} with score {}", trial.assignment, trial.score);
            self.progress.emit(ProgressEvent::NewBest {
                number: trial.number,
                assignment: trial.assignment.clone(),
                score: trial.score,
            });
        }
    }

    /// Summary of the session so far.
    pub fn report(&self) -> SessionReport {
        let best = self.history.best().map(|t| BestCandidate {
            trial_number: t.number,
            assignment: self
                .encoder
                .decode(&t.inputs)
                .unwrap_or_else(|_| t.assignment.clone()),
            defines: t.inputs.canonical(),
            score: t.score,
            verdict: t.verdict,
            metrics: t.metrics.clone(),
        });
        SessionReport {
            session_id: self.id,
            name: self.name.clone(),
            strategy: self.strategy.name().to_string(),
            state: self.state,
            iterations: self.history.len(),
            verdicts: self
                .history
                .verdict_counts()
                .into_iter()
                .map(|(v, n)| (v.to_string(), n))
                .collect(),
            cache: self.cache.stats(),
            elapsed_secs: self.elapsed.as_secs_f64(),
            best,
        }
    }
}

async fn evaluate_with_retry<E: Evaluator + ?Sized>(
    evaluator: &E,
    assignment: &Assignment,
    timeouts: StageTimeouts,
    max_retries: u32,
    progress: &ProgressReporter,
) -> TuneResult<EvaluationResult> {
    let mut attempt = 0;
    loop {
        match evaluator.evaluate(assignment, timeouts).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    candidate = %assignment,
                    attempt,
                    "transient failure during {}: {e}; retrying",
                    e.stage()
                );
                progress.emit(ProgressEvent::RetryScheduled {
                    assignment: assignment.clone(),
                    attempt,
                    stage: e.stage(),
                    reason: e.to_string(),
                });
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Best candidate of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestCandidate {
    pub trial_number: usize,
    /// Decoded back from the build inputs that produced the score.
    pub assignment: Assignment,
    /// Canonical `NAME=VALUE;...` form of the build inputs.
    pub defines: String,
    pub score: Score,
    pub verdict: Verdict,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub name: String,
    pub strategy: String,
    pub state: LoopState,
    pub iterations: usize,
    pub verdicts: BTreeMap<String, usize>,
    pub cache: CacheStats,
    pub elapsed_secs: f64,
    pub best: Option<BestCandidate>,
}

impl SessionReport {
    pub fn to_json(&self) -> TuneResult<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }
}

/// Reject sessions whose options cannot make progress.
pub(crate) fn check_options(options: &SessionOptions) -> TuneResult<()> {
    if options.concurrency == 0 {
        return Err(config_error!("concurrency must be at least 1"));
    }
    if options.timeouts.build.is_zero() || options.timeouts.run.is_zero() {
        return Err(config_error!("stage timeouts must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mt_optimizer::{
        GridSearch, ParameterDomain, PerturbationSearch, RandomSearch, ScoringConfig,
    };
    use mt_types::{FailureStage, InfrastructureError, TuneError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Behavior = dyn Fn(&Assignment, usize) -> TuneResult<EvaluationResult> + Send + Sync;

    /// In-memory evaluator. `behavior` receives the assignment and the
    /// 0-based call number.
    struct FakeEvaluator {
        calls: AtomicUsize,
        delay_per_bin_ms: u64,
        behavior: Box<Behavior>,
    }

    impl FakeEvaluator {
        fn new(
            behavior: impl Fn(&Assignment, usize) -> TuneResult<EvaluationResult> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay_per_bin_ms: 0,
                behavior: Box::new(behavior),
            }
        }

        fn with_delay(mut self, ms: u64) -> Self {
            self.delay_per_bin_ms = ms;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Evaluator for FakeEvaluator {
        async fn evaluate(
            &self,
            assignment: &Assignment,
            _timeouts: StageTimeouts,
        ) -> TuneResult<EvaluationResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_per_bin_ms > 0 {
                let bins = assignment.get("BIN_COUNT").and_then(|v| v.as_int()).unwrap_or(1);
                tokio::time::sleep(Duration::from_millis(bins as u64 * self.delay_per_bin_ms)).await;
            }
            (self.behavior)(assignment, call)
        }
    }

    fn space() -> Arc<ParameterSpace> {
        Arc::new(
            ParameterSpace::builder()
                .declare("ALIGNMENT", ParameterDomain::power_of_two(8, 64))
                .unwrap()
                .declare("BIN_COUNT", ParameterDomain::int(1, 8))
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    /// Deterministic synthetic allocator: more bins help utilisation, larger
    /// alignment helps throughput.
    fn measure(assignment: &Assignment) -> EvaluationResult {
        let alignment = assignment.get("ALIGNMENT").and_then(|v| v.as_int()).unwrap_or(0);
        let bins = assignment.get("BIN_COUNT").and_then(|v| v.as_int()).unwrap_or(0);
        let mut metrics = Metrics::new();
        metrics.insert("util".to_string(), bins as f64 / 8.0);
        metrics.insert("thru".to_string(), alignment as f64 * 100.0);
        EvaluationResult::pass(metrics)
    }

    fn session(
        strategy: Box<dyn SearchStrategy>,
        evaluator: FakeEvaluator,
        budget: Budget,
    ) -> TuningSession<FakeEvaluator> {
        TuningSession::new(
            space(),
            strategy,
            evaluator,
            ObjectiveScorer::new(ScoringConfig::default()).unwrap(),
            budget,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn best_dominates_history() {
        let evaluator = FakeEvaluator::new(|a, _| Ok(measure(a)));
        let mut s = session(Box::new(RandomSearch::new(Some(7))), evaluator, Budget::iterations(20));
        let report = s.run().await.unwrap();

        assert_eq!(s.state(), LoopState::Done);
        assert_eq!(s.history().len(), 20);
        assert_eq!(report.iterations, 20);
        let best = report.best.unwrap();
        for trial in s.history().trials() {
            assert!(best.score >= trial.score);
        }
        let (assignment, score) = s.best().unwrap();
        assert_eq!(score, best.score);
        assert_eq!(assignment, &best.assignment);
    }

    #[tokio::test]
    async fn evaluation_failures_do_not_stop_the_loop() {
        let evaluator = FakeEvaluator::new(|a, _| {
            if a.get("ALIGNMENT").and_then(|v| v.as_int()) == Some(8) {
                Ok(EvaluationResult::build_failure("alignment too small"))
            } else {
                Ok(measure(a))
            }
        });
        // Grid order: the first eight candidates all use ALIGNMENT=8.
        let mut s = session(Box::new(GridSearch::new()), evaluator, Budget::iterations(12));
        let report = s.run().await.unwrap();

        let counts = s.history().verdict_counts();
        assert_eq!(counts.get(&Verdict::Fail), Some(&8));
        assert_eq!(counts.get(&Verdict::Pass), Some(&4));
        assert_eq!(report.verdicts.get("fail"), Some(&8));
        for trial in s.history().trials() {
            if trial.verdict == Verdict::Fail {
                assert!(trial.score < Score::new(0.0));
                assert!(trial.metrics.is_empty());
            }
        }
        assert!(report.best.unwrap().score >= Score::new(0.0));
    }

    #[tokio::test]
    async fn grid_exhaustion_ends_the_session() {
        let evaluator = FakeEvaluator::new(|a, _| Ok(measure(a)));
        let mut s = session(Box::new(GridSearch::new()), evaluator, Budget::iterations(100));
        s.run().await.unwrap();
        assert_eq!(s.history().len(), 32);
        assert_eq!(s.evaluator().calls(), 32);
        assert_eq!(s.state(), LoopState::Done);
        assert_eq!(
            s.best().unwrap().0,
            &Assignment::new().with("ALIGNMENT", 64).with("BIN_COUNT", 8)
        );
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let evaluator = FakeEvaluator::new(|a, call| {
            if call == 0 {
                Err(InfrastructureError::ScratchUnavailable {
                    message: "disk full".into(),
                }
                .into())
            } else {
                Ok(measure(a))
            }
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut s = session(Box::new(GridSearch::new()), evaluator, Budget::iterations(3))
            .with_progress(ProgressReporter::new(tx));
        s.run().await.unwrap();

        assert_eq!(s.history().len(), 3);
        assert_eq!(s.evaluator().calls(), 4);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::RetryScheduled { attempt: 1, .. })));
        assert!(matches!(events.first(), Some(ProgressEvent::SessionStarted { .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::SessionFinished { iterations: 3, .. })));
    }

    #[tokio::test]
    async fn persistent_transient_error_aborts_after_retries() {
        let evaluator = FakeEvaluator::new(|_, _| {
            Err(InfrastructureError::ScratchUnavailable {
                message: "read-only filesystem".into(),
            }
            .into())
        });
        let mut s = session(Box::new(GridSearch::new()), evaluator, Budget::iterations(3))
            .with_options(SessionOptions {
                max_retries: 2,
                ..SessionOptions::default()
            });
        let err = s.run().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(s.evaluator().calls(), 3);
        assert!(s.history().is_empty());
    }

    #[tokio::test]
    async fn fatal_infrastructure_error_aborts() {
        let evaluator = FakeEvaluator::new(|_, _| {
            Err(InfrastructureError::ToolchainMissing {
                program: "cc".into(),
            }
            .into())
        });
        let mut s = session(Box::new(GridSearch::new()), evaluator, Budget::iterations(5));
        let err = s.run().await.unwrap_err();

        assert_eq!(err.stage(), FailureStage::Build);
        assert_eq!(s.evaluator().calls(), 1);
        assert_eq!(s.state(), LoopState::Done);
        assert!(s.history().is_empty());
        assert!(s.run().await.is_err());
    }

    struct BrokenStrategy;

    impl SearchStrategy for BrokenStrategy {
        fn propose(&mut self, _space: &ParameterSpace, _history: &History) -> Option<Assignment> {
            Some(Assignment::new().with("ALIGNMENT", 12).with("BIN_COUNT", 2))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn invalid_proposal_aborts_before_evaluation() {
        let evaluator = FakeEvaluator::new(|a, _| Ok(measure(a)));
        let mut s = session(Box::new(BrokenStrategy), evaluator, Budget::iterations(5));
        let err = s.run().await.unwrap_err();

        assert_eq!(err.stage(), FailureStage::Proposal);
        assert!(matches!(
            err,
            TuneError::Config(ConfigurationError::InvalidAssignment(ref e)) if e.parameter == "ALIGNMENT"
        ));
        assert_eq!(s.evaluator().calls(), 0);
    }

    fn boolean_space() -> Arc<ParameterSpace> {
        Arc::new(
            ParameterSpace::builder()
                .declare("COALESCE", ParameterDomain::Boolean)
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    fn coalesce_evaluator() -> FakeEvaluator {
        FakeEvaluator::new(|a, _| {
            let mut metrics = Metrics::new();
            let on = a.get("COALESCE").and_then(|v| v.as_bool()) == Some(true);
            metrics.insert("util".to_string(), if on { 0.9 } else { 0.5 });
            Ok(EvaluationResult::pass(metrics))
        })
    }

    #[tokio::test]
    async fn shared_cache_serves_repeated_candidates() {
        let cache = Arc::new(ResultCache::new());
        let mut first = TuningSession::new(
            boolean_space(),
            Box::new(GridSearch::new()),
            coalesce_evaluator(),
            ObjectiveScorer::default(),
            Budget::iterations(6),
        )
        .unwrap()
        .with_cache(Arc::clone(&cache));
        first.run().await.unwrap();
        assert_eq!(first.evaluator().calls(), 2);

        let mut second = TuningSession::new(
            boolean_space(),
            Box::new(GridSearch::new()),
            coalesce_evaluator(),
            ObjectiveScorer::default(),
            Budget::iterations(6),
        )
        .unwrap()
        .with_cache(Arc::clone(&cache));
        let report = second.run().await.unwrap();

        assert_eq!(second.evaluator().calls(), 0);
        assert_eq!(second.history().len(), 2);
        assert!(second.history().trials().iter().all(|t| t.cached));
        assert_eq!(report.cache.hits, 2);
        assert_eq!(
            second.best().unwrap().0,
            &Assignment::new().with("COALESCE", true)
        );
    }

    #[tokio::test]
    async fn covered_space_ends_a_wall_clock_session() {
        let mut s = TuningSession::new(
            boolean_space(),
            Box::new(RandomSearch::new(Some(1))),
            coalesce_evaluator(),
            ObjectiveScorer::default(),
            Budget::seconds(5.0),
        )
        .unwrap();
        let started = Instant::now();
        let report = s.run().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(s.state(), LoopState::Done);
        assert_eq!(s.history().distinct_inputs(), 2);
        assert_eq!(report.iterations, 2);
        assert_eq!(s.evaluator().calls(), 2);
    }

    #[tokio::test]
    async fn seeded_sessions_are_reproducible_under_concurrency() {
        async fn trace(seed: u64) -> Vec<(Assignment, Score)> {
            let evaluator = FakeEvaluator::new(|a, _| Ok(measure(a))).with_delay(2);
            let mut s = session(
                Box::new(PerturbationSearch::new(Some(seed), 0.3)),
                evaluator,
                Budget::iterations(15),
            )
            .with_options(SessionOptions {
                concurrency: 3,
                ..SessionOptions::default()
            });
            s.run().await.unwrap();
            s.history()
                .trials()
                .iter()
                .map(|t| (t.assignment.clone(), t.score))
                .collect()
        }

        let first = trace(11).await;
        assert_eq!(first.len(), 15);
        assert_eq!(first, trace(11).await);
    }

    #[tokio::test]
    async fn wall_clock_budget_stops_the_loop() {
        let evaluator = FakeEvaluator::new(|a, _| Ok(measure(a))).with_delay(10);
        let mut s = session(Box::new(RandomSearch::new(Some(5))), evaluator, Budget::seconds(0.2));
        let started = Instant::now();
        s.run().await.unwrap();
        assert!(!s.history().is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn budget_validation() {
        assert!(Budget::default().validate().is_err());
        assert!(Budget::iterations(0).validate().is_err());
        assert!(Budget::seconds(-1.0).validate().is_err());
        assert!(Budget::seconds(f64::NAN).validate().is_err());
        assert!(Budget::iterations(10).validate().is_ok());

        let budget = Budget {
            max_iterations: Some(10),
            max_seconds: Some(60.0),
        };
        assert!(!budget.exhausted(9, Duration::from_secs(1)));
        assert!(budget.exhausted(10, Duration::from_secs(1)));
        assert!(budget.exhausted(0, Duration::from_secs(61)));
        assert_eq!(budget.remaining_iterations(4), Some(6));
    }

    #[test]
    fn loop_transitions() {
        use LoopState::*;
        assert!(Idle.can_transition_to(Proposing));
        assert!(Recording.can_transition_to(Proposing));
        assert!(Recording.can_transition_to(Done));
        assert!(!Idle.can_transition_to(Scoring));
        assert!(!Done.can_transition_to(Proposing));
        assert!(!Evaluating.can_transition_to(Recording));
    }

    #[test]
    fn options_check() {
        assert!(check_options(&SessionOptions::default()).is_ok());
        let zero = SessionOptions {
            concurrency: 0,
            ..SessionOptions::default()
        };
        assert!(check_options(&zero).is_err());
    }
}
