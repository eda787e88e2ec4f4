//! Build-and-run evaluation of a single candidate.

use async_trait::async_trait;
use mt_optimizer::CandidateEncoder;
use mt_types::{
    internal_error, Assignment, ConfigurationError, EvaluationResult, EvaluationStage,
    FailureStage, InfrastructureError, TuneResult, DEFINES_ENV,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::driver::{crash_marker, DriverReport};
use crate::process::{BoundedCommand, CommandSpec, Placeholders, ProcessOutcome, ProcessOutput};
use crate::scratch::ScratchSpace;

/// Lines of stderr kept in failure details.
const DETAIL_LINES: usize = 20;

/// Wall-clock limits for the two halves of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub build: Duration,
    pub run: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(120),
            run: Duration::from_secs(60),
        }
    }
}

/// Turns a candidate assignment into a measured outcome.
///
/// `Ok` always carries a complete result, whatever the verdict. `Err` is
/// reserved for invalid assignments and infrastructure faults.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        assignment: &Assignment,
        timeouts: StageTimeouts,
    ) -> TuneResult<EvaluationResult>;
}

/// How to compile the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStepConfig {
    /// Allocator source tree, copied into every scratch directory.
    pub source_dir: PathBuf,
    /// Runs inside the scratch copy.
    pub command: CommandSpec,
    /// Artifact path relative to the scratch directory (e.g. "mdriver").
    pub artifact: String,
    /// Name of the generated header holding the tuned constants.
    #[serde(default = "default_header")]
    pub header: String,
}

fn default_header() -> String {
    "tune_params.h".to_string()
}

/// How to run the benchmark driver against a built artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub command: CommandSpec,
    /// Benchmark trace directory, exposed as `{traces}`.
    #[serde(default)]
    pub traces: Option<PathBuf>,
    /// Metrics a passing run must report.
    #[serde(default)]
    pub required_metrics: Vec<String>,
    /// Stderr substrings that mark a memory-safety crash.
    #[serde(default = "default_crash_markers")]
    pub crash_markers: Vec<String>,
}

fn default_crash_markers() -> Vec<String> {
    vec!["AddressSanitizer".to_string(), "Segmentation fault".to_string()]
}

/// The real evaluator: copy sources, build with the candidate's constants,
/// run the driver, classify.
#[derive(Debug, Clone)]
pub struct BuildAndRunEvaluator {
    encoder: CandidateEncoder,
    build: BuildStepConfig,
    driver: DriverConfig,
    scratch_root: Option<PathBuf>,
}

impl BuildAndRunEvaluator {
    pub fn new(encoder: CandidateEncoder, build: BuildStepConfig, driver: DriverConfig) -> Self {
        Self {
            encoder,
            build,
            driver,
            scratch_root: None,
        }
    }

    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    async fn prepare_scratch(&self) -> TuneResult<ScratchSpace> {
        let root = self.scratch_root.clone();
        let source = self.build.source_dir.clone();
        let scratch = tokio::task::spawn_blocking(move || {
            let scratch = ScratchSpace::acquire(root.as_deref())?;
            scratch.populate_from(&source)?;
            Ok::<_, InfrastructureError>(scratch)
        })
        .await
        .map_err(|e| internal_error!("scratch preparation panicked: {e}"))??;
        Ok(scratch)
    }
}

#[async_trait]
impl Evaluator for BuildAndRunEvaluator {
    async fn evaluate(
        &self,
        assignment: &Assignment,
        timeouts: StageTimeouts,
    ) -> TuneResult<EvaluationResult> {
        let inputs = self
            .encoder
            .encode(assignment)
            .map_err(ConfigurationError::from)?;

        // Dropped on every return below, taking the build tree with it.
        let scratch = self.prepare_scratch().await?;
        let header = scratch.write_file(&self.build.header, &inputs.to_header())?;
        let artifact = scratch.join(&self.build.artifact);
        let defines = inputs.to_define_flags();
        let vars = Placeholders {
            defines: &defines,
            scratch: scratch.path(),
            artifact: &artifact,
            header: &header,
            traces: self.driver.traces.as_deref(),
        };
        debug!(candidate = %assignment, scratch = %scratch.path().display(), "evaluating");

        // Build
        let (program, args) = self.build.command.expand(&vars);
        let mut env = self.build.command.env.clone();
        env.insert(DEFINES_ENV.to_string(), inputs.to_env_value());
        let build = BoundedCommand {
            stage: FailureStage::Build,
            program: &program,
            args: &args,
            cwd: scratch.path(),
            env: &env,
            timeout: timeouts.build,
        }
        .run()
        .await?;
        let build_millis = build.elapsed.as_millis() as u64;

        match build.outcome {
            ProcessOutcome::Exited(0) => {}
            ProcessOutcome::TimedOut => {
                return Ok(EvaluationResult::timeout(
                    EvaluationStage::Build,
                    format!("build exceeded {:?}", timeouts.build),
                )
                .with_timings(build_millis, 0));
            }
            ProcessOutcome::Exited(code) => {
                warn!(candidate = %assignment, code, "build failed");
                return Ok(EvaluationResult::build_failure(failure_detail(
                    &format!("build exited with status {code}"),
                    &build,
                ))
                .with_timings(build_millis, 0));
            }
            ProcessOutcome::Signaled(signal) => {
                return Ok(EvaluationResult::build_failure(failure_detail(
                    &format!("build terminated by signal {signal:?}"),
                    &build,
                ))
                .with_timings(build_millis, 0));
            }
        }
        if !artifact.exists() {
            return Ok(EvaluationResult::build_failure(format!(
                "build succeeded but produced no artifact at {}",
                self.build.artifact
            ))
            .with_timings(build_millis, 0));
        }

        // Run
        let (program, args) = self.driver.command.expand(&vars);
        let mut env = self.driver.command.env.clone();
        env.insert(DEFINES_ENV.to_string(), inputs.to_env_value());
        let run = BoundedCommand {
            stage: FailureStage::Run,
            program: &program,
            args: &args,
            cwd: scratch.path(),
            env: &env,
            timeout: timeouts.run,
        }
        .run()
        .await?;
        let run_millis = run.elapsed.as_millis() as u64;

        let result = classify_run(&run, &self.driver, timeouts.run);
        if !result.verdict.is_pass() {
            warn!(candidate = %assignment, verdict = %result.verdict, "driver run failed");
        }
        Ok(result.with_timings(build_millis, run_millis))
    }
}

fn failure_detail(summary: &str, output: &ProcessOutput) -> String {
    let tail = output.stderr_tail(DETAIL_LINES);
    if tail.is_empty() {
        summary.to_string()
    } else {
        format!("{summary}\n{tail}")
    }
}

/// Map a finished driver run to a verdict.
pub fn classify_run(output: &ProcessOutput, driver: &DriverConfig, limit: Duration) -> EvaluationResult {
    if output.outcome == ProcessOutcome::TimedOut {
        return EvaluationResult::timeout(EvaluationStage::Run, format!("driver exceeded {limit:?}"));
    }
    if let Some(marker) = crash_marker(&output.stderr, &driver.crash_markers) {
        return EvaluationResult::crash(failure_detail(&format!("driver reported {marker}"), output));
    }
    if let ProcessOutcome::Signaled(signal) = output.outcome {
        return EvaluationResult::crash(failure_detail(
            &format!("driver terminated by signal {signal:?}"),
            output,
        ));
    }

    let report = DriverReport::parse(&output.stdout, &output.stderr);
    if let Some(violation) = report.correctness_violation() {
        return EvaluationResult::incorrect(violation);
    }
    if let ProcessOutcome::Exited(code) = output.outcome {
        if code != 0 {
            return EvaluationResult::crash(failure_detail(
                &format!("driver exited abnormally with status {code}"),
                output,
            ));
        }
    }
    if let Some(missing) = driver
        .required_metrics
        .iter()
        .find(|m| !report.metrics.contains_key(m.as_str()))
    {
        return EvaluationResult::incorrect(format!("driver did not report metric {missing}"));
    }
    EvaluationResult::pass(report.metrics)
}
