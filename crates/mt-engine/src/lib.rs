//! # mt-engine
//!
//! Build-and-run evaluation and the search loop for allocator tuning.
//!
//! Each candidate is compiled in a private scratch copy of the allocator
//! sources with its constants injected as preprocessor defines, then the
//! benchmark driver is run against the artifact. Both steps are bounded by
//! wall-clock timeouts that kill the whole process tree. The
//! [`TuningSession`] drives strategy, evaluator and scorer until its budget
//! is spent.

pub mod cache;
pub mod config;
pub mod driver;
pub mod evaluator;
pub mod process;
pub mod progress;
pub mod scratch;
pub mod session;

pub use cache::{CacheStats, ResultCache};
pub use config::{SessionConfig, TimeoutConfig, CONCURRENCY_ENV, SCRATCH_DIR_ENV};
pub use evaluator::{BuildAndRunEvaluator, BuildStepConfig, DriverConfig, Evaluator, StageTimeouts};
pub use process::CommandSpec;
pub use progress::{ProgressEvent, ProgressReporter};
pub use session::{
    BestCandidate, Budget, LoopState, SessionOptions, SessionReport, TuningSession,
};
