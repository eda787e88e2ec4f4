//! Session configuration.
//!
//! A session is described by one JSON document:
//!
//! ```json
//! {
//!   "name": "mm-tune",
//!   "parameters": [
//!     { "name": "ALIGNMENT", "kind": "power_of_two", "low": 8, "high": 64 },
//!     { "name": "BIN_COUNT", "kind": "int_range", "low": 4, "high": 32 },
//!     { "name": "COALESCE",  "kind": "boolean" },
//!     { "name": "FIT",       "kind": "enumerated", "values": ["FIRST_FIT", "BEST_FIT"] }
//!   ],
//!   "build":  { "source_dir": "malloclab", "artifact": "mdriver",
//!               "command": { "program": "make", "args": ["-C", "{scratch}", "mdriver"] } },
//!   "driver": { "traces": "traces", "required_metrics": ["util", "thru"],
//!               "command": { "program": "{artifact}", "args": ["-t", "{traces}", "-v"] } },
//!   "budget": { "max_iterations": 200 },
//!   "strategy": { "kind": "perturbation", "seed": 7 }
//! }
//! ```

use mt_optimizer::{CandidateEncoder, ObjectiveScorer, ParameterDef, ParameterSpace, ScoringConfig, StrategyConfig};
use mt_types::{config_error, TuneResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::evaluator::{BuildAndRunEvaluator, BuildStepConfig, DriverConfig, StageTimeouts};
use crate::session::{check_options, Budget, SessionOptions, TuningSession};

/// Overrides the configured scratch root.
pub const SCRATCH_DIR_ENV: &str = "MT_TUNE_SCRATCH_DIR";
/// Overrides the configured concurrency.
pub const CONCURRENCY_ENV: &str = "MT_TUNE_CONCURRENCY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_build_secs")]
    pub build_secs: f64,
    #[serde(default = "default_run_secs")]
    pub run_secs: f64,
}

fn default_build_secs() -> f64 {
    120.0
}

fn default_run_secs() -> f64 {
    60.0
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            build_secs: default_build_secs(),
            run_secs: default_run_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub parameters: Vec<ParameterDef>,
    pub build: BuildStepConfig,
    pub driver: DriverConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    pub budget: Budget,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Parent directory for per-evaluation scratch trees. System temp dir
    /// when absent.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

fn default_name() -> String {
    "mt-tune".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

impl SessionConfig {
    /// Parse and validate a JSON document. Relative paths are kept as is.
    pub fn from_json(json: &str) -> TuneResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, resolve relative paths against the file's directory
    /// and apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> TuneResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(path = %path.display(), name = %config.name, "loaded session configuration");
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            if p.is_relative() {
                base.join(p)
            } else {
                p.to_path_buf()
            }
        };
        self.build.source_dir = resolve(&self.build.source_dir);
        if let Some(traces) = &self.driver.traces {
            self.driver.traces = Some(resolve(traces));
        }
        if let Some(root) = &self.scratch_root {
            self.scratch_root = Some(resolve(root));
        }
    }

    /// Apply [`SCRATCH_DIR_ENV`] and [`CONCURRENCY_ENV`] from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> TuneResult<()> {
        if let Some(dir) = lookup(SCRATCH_DIR_ENV).filter(|d| !d.is_empty()) {
            debug!("scratch root overridden by {SCRATCH_DIR_ENV}: {dir}");
            self.scratch_root = Some(PathBuf::from(dir));
        }
        if let Some(raw) = lookup(CONCURRENCY_ENV) {
            let concurrency = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| config_error!("{CONCURRENCY_ENV} must be a positive integer, got {raw:?}"))?;
            debug!("concurrency overridden by {CONCURRENCY_ENV}: {concurrency}");
            self.concurrency = concurrency;
        }
        Ok(())
    }

    pub fn validate(&self) -> TuneResult<()> {
        self.build_space()?;
        self.budget.validate()?;
        check_options(&self.options()?)?;
        ObjectiveScorer::new(self.scoring.clone())?;

        if self.build.command.program.trim().is_empty() {
            return Err(config_error!("build command has no program"));
        }
        if self.driver.command.program.trim().is_empty() {
            return Err(config_error!("driver command has no program"));
        }
        if self.build.artifact.trim().is_empty() {
            return Err(config_error!("build artifact path is empty"));
        }
        let header = Path::new(&self.build.header);
        if self.build.header.is_empty() || header.components().count() != 1 {
            return Err(config_error!(
                "header must be a plain file name, got {:?}",
                self.build.header
            ));
        }
        let weight = self.strategy.exploration_weight;
        if !(0.0..=1.0).contains(&weight) {
            return Err(config_error!(
                "exploration_weight must lie in [0, 1], got {weight}"
            ));
        }
        Ok(())
    }

    pub fn build_space(&self) -> TuneResult<ParameterSpace> {
        let space = ParameterSpace::builder()
            .declare_all(self.parameters.iter().cloned())?
            .build()?;
        Ok(space)
    }

    pub fn timeouts(&self) -> TuneResult<StageTimeouts> {
        let secs = |value: f64, stage: &str| {
            Duration::try_from_secs_f64(value)
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or_else(|| config_error!("{stage} timeout must be a positive number of seconds, got {value}"))
        };
        Ok(StageTimeouts {
            build: secs(self.timeouts.build_secs, "build")?,
            run: secs(self.timeouts.run_secs, "run")?,
        })
    }

    pub fn options(&self) -> TuneResult<SessionOptions> {
        Ok(SessionOptions {
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            timeouts: self.timeouts()?,
            ..SessionOptions::default()
        })
    }

    /// Replace the iteration limit, keeping any wall-clock limit.
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.budget.max_iterations = Some(iterations);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.strategy.seed = Some(seed);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Wire up a ready-to-run session backed by the real build-and-run
    /// evaluator.
    pub fn build_session(&self) -> TuneResult<TuningSession<BuildAndRunEvaluator>> {
        self.validate()?;
        let space = Arc::new(self.build_space()?);
        let evaluator = BuildAndRunEvaluator::new(
            CandidateEncoder::new(Arc::clone(&space)),
            self.build.clone(),
            self.driver.clone(),
        )
        .with_scratch_root(self.scratch_root.clone());
        let scorer = ObjectiveScorer::new(self.scoring.clone())?;
        let session = TuningSession::new(space, self.strategy.build(), evaluator, scorer, self.budget)?
            .with_name(self.name.clone())
            .with_options(self.options()?);
        Ok(session)
    }
}
