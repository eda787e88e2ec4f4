//! Pluggable search strategies.

use mt_types::Assignment;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::space::{ParameterDomain, ParameterSpace};
use crate::trial::{History, Trial};

/// Common trait for all search strategies.
///
/// The search loop calls `propose` and `observe` from a single writer, so
/// implementations may keep mutable state between calls.
pub trait SearchStrategy: Send + Sync {
    /// Produce the next candidate given the space and the history so far.
    /// `None` means the strategy has nothing left to propose.
    fn propose(&mut self, space: &ParameterSpace, history: &History) -> Option<Assignment>;

    /// Report a recorded trial so adaptive strategies can learn.
    fn observe(&mut self, _trial: &Trial) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

fn sample_assignment(space: &ParameterSpace, rng: &mut ChaCha8Rng) -> Assignment {
    space
        .parameters()
        .iter()
        .map(|p| (p.name.clone(), p.domain.sample(rng)))
        .collect()
}

// ---- Grid search ----

/// Exhaustive enumeration of the space in mixed-radix order. Finishes once
/// every assignment has been proposed.
#[derive(Debug, Clone, Default)]
pub struct GridSearch {
    cursor: u128,
}

impl GridSearch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SearchStrategy for GridSearch {
    fn propose(&mut self, space: &ParameterSpace, _history: &History) -> Option<Assignment> {
        let Some(next) = space.assignment_at(self.cursor) else {
            debug!("grid exhausted after {} candidates", self.cursor);
            return None;
        };
        self.cursor += 1;
        Some(next)
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent uniform sampling across the space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: seeded_rng(seed),
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn propose(&mut self, space: &ParameterSpace, _history: &History) -> Option<Assignment> {
        Some(sample_assignment(space, &mut self.rng))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Perturbation search ----

/// Explore/exploit search around the best recorded candidate.
///
/// With probability `exploration_weight` (and always while the history is
/// empty) a uniform sample is drawn; otherwise every parameter of the best
/// trial is nudged to a nearby domain value.
#[derive(Debug, Clone)]
pub struct PerturbationSearch {
    rng: ChaCha8Rng,
    exploration_weight: f64,
}

impl PerturbationSearch {
    pub fn new(seed: Option<u64>, exploration_weight: f64) -> Self {
        Self {
            rng: seeded_rng(seed),
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
        }
    }

    fn perturb(&mut self, space: &ParameterSpace, base: &Assignment) -> Assignment {
        let mut next = Assignment::new();
        for param in space.parameters() {
            let Some(current) = base.get(&param.name) else {
                next.insert(param.name.clone(), param.domain.sample(&mut self.rng));
                continue;
            };
            let value = match &param.domain {
                ParameterDomain::IntRange { .. } => {
                    let span = (param.domain.cardinality() / 20).clamp(1, 1 << 20) as i64;
                    let delta = self.rng.gen_range(-span..=span);
                    param.domain.step(current, delta)
                }
                ParameterDomain::PowerOfTwo { .. } => {
                    let delta = self.rng.gen_range(-1..=1);
                    param.domain.step(current, delta)
                }
                ParameterDomain::Boolean => {
                    if self.rng.gen_bool(0.5) {
                        param.domain.step(current, if current.as_bool() == Some(true) { -1 } else { 1 })
                    } else {
                        current.clone()
                    }
                }
                ParameterDomain::Enumerated { .. } => param.domain.sample(&mut self.rng),
            };
            next.insert(param.name.clone(), value);
        }

        // Guarantee movement: nudge one parameter that has room to move.
        if &next == base {
            let movable: Vec<_> = space
                .parameters()
                .iter()
                .filter(|p| p.domain.cardinality() > 1)
                .collect();
            if !movable.is_empty() {
                let param = movable[self.rng.gen_range(0..movable.len())];
                if let Some(current) = next.get(&param.name).cloned() {
                    let up = param.domain.step(&current, 1);
                    let moved = if up != current { up } else { param.domain.step(&current, -1) };
                    next.insert(param.name.clone(), moved);
                }
            }
        }
        next
    }
}

impl SearchStrategy for PerturbationSearch {
    fn propose(&mut self, space: &ParameterSpace, history: &History) -> Option<Assignment> {
        let explore = self.rng.gen::<f64>() < self.exploration_weight;
        let next = match history.best() {
            Some(best) if !explore => self.perturb(space, &best.assignment),
            _ => sample_assignment(space, &mut self.rng),
        };
        Some(next)
    }

    fn name(&self) -> &str {
        "perturbation"
    }
}

// ---- Configuration ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Random,
    Grid,
    Perturbation,
}

/// Serializable strategy section of a session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Fixed seed for reproducible sessions; entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Exploration probability for perturbation search.
    #[serde(default = "default_exploration_weight")]
    pub exploration_weight: f64,
}

fn default_exploration_weight() -> f64 {
    0.3
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Perturbation,
            seed: None,
            exploration_weight: default_exploration_weight(),
        }
    }
}

impl StrategyConfig {
    pub fn build(&self) -> Box<dyn SearchStrategy> {
        match self.kind {
            StrategyKind::Random => Box::new(RandomSearch::new(self.seed)),
            StrategyKind::Grid => Box::new(GridSearch::new()),
            StrategyKind::Perturbation => {
                Box::new(PerturbationSearch::new(self.seed, self.exploration_weight))
            }
        }
    }
}
