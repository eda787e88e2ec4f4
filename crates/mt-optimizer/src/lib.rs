//! # mt-optimizer
//!
//! Parameter space declaration, candidate encoding and objective scoring for
//! allocator tuning.
//!
//! Provides the declared search space and its validation, the injective
//! encoding of assignments into build-level constants, pluggable search
//! strategies (grid, random, perturbation), and the evaluation history the
//! strategies learn from.

mod encoding;
mod scorer;
mod search;
mod space;
mod trial;

pub use encoding::CandidateEncoder;
pub use scorer::{MetricWeight, ObjectiveScorer, PenaltyPolicy, ScoringConfig};
pub use search::{
    GridSearch, PerturbationSearch, RandomSearch, SearchStrategy, StrategyConfig, StrategyKind,
};
pub use space::{ParameterDef, ParameterDomain, ParameterSpace, SpaceBuilder};
pub use trial::{History, Trial};
