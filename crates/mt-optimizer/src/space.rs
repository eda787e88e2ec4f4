//! Parameter space declaration and assignment validation.

use mt_types::{
    Assignment, AssignmentViolation, ConfigurationError, InvalidAssignment, ParameterValue,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Largest exponent whose power of two fits in an `i64`.
const MAX_POW2_EXPONENT: u32 = 62;

/// A single tunable dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Build-level constant name (e.g. "ALIGNMENT").
    pub name: String,
    #[serde(flatten)]
    pub domain: ParameterDomain,
}

/// The closed set of domain kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterDomain {
    /// Any integer in `[low, high]` inclusive.
    IntRange { low: i64, high: i64 },
    /// Powers of two falling inside `[low, high]`. The bounds themselves need
    /// not be powers of two.
    PowerOfTwo { low: i64, high: i64 },
    /// A fixed set of opaque tokens, substituted verbatim into the build.
    Enumerated { values: Vec<String> },
    Boolean,
}

impl ParameterDomain {
    pub fn int(low: i64, high: i64) -> Self {
        Self::IntRange { low, high }
    }

    pub fn power_of_two(low: i64, high: i64) -> Self {
        Self::PowerOfTwo { low, high }
    }

    pub fn enumerated<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enumerated {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Check that the domain is non-empty and every member encodes to a legal
    /// build literal.
    fn check(&self) -> Result<(), String> {
        match self {
            Self::IntRange { low, high } => {
                if low > high {
                    return Err(format!("inverted range [{low}, {high}]"));
                }
            }
            Self::PowerOfTwo { low, high } => {
                if low > high {
                    return Err(format!("inverted range [{low}, {high}]"));
                }
                if self.pow2_exponents().is_none() {
                    return Err(format!("no power of two lies in [{low}, {high}]"));
                }
            }
            Self::Enumerated { values } => {
                if values.is_empty() {
                    return Err("enumerated domain has no values".to_string());
                }
                let mut seen = std::collections::HashSet::new();
                for value in values {
                    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"') {
                        return Err(format!("{value:?} is not a legal build literal"));
                    }
                    if !seen.insert(value.as_str()) {
                        return Err(format!("value {value:?} listed twice"));
                    }
                }
            }
            Self::Boolean => {}
        }
        Ok(())
    }

    /// Inclusive exponent range `[lo, hi]` of the powers of two in the domain.
    fn pow2_exponents(&self) -> Option<(u32, u32)> {
        let Self::PowerOfTwo { low, high } = self else {
            return None;
        };
        if *high < 1 {
            return None;
        }
        let low = (*low).max(1) as u64;
        let high = *high as u64;
        let lo_exp = if low.is_power_of_two() {
            low.trailing_zeros()
        } else {
            64 - low.leading_zeros()
        };
        let hi_exp = (63 - high.leading_zeros()).min(MAX_POW2_EXPONENT);
        (lo_exp <= hi_exp).then_some((lo_exp, hi_exp))
    }

    /// Test membership, describing the violation on failure.
    pub fn contains(&self, value: &ParameterValue) -> Result<(), AssignmentViolation> {
        let out_of_domain = || AssignmentViolation::OutOfDomain {
            value: value.to_string(),
            domain: self.to_string(),
        };
        let mismatch = |expected: &str| AssignmentViolation::TypeMismatch {
            value: value.to_string(),
            expected: expected.to_string(),
        };

        match (self, value) {
            (Self::IntRange { low, high }, ParameterValue::Int(v)) => {
                if v < low || v > high {
                    return Err(out_of_domain());
                }
            }
            (Self::PowerOfTwo { low, high }, ParameterValue::Int(v)) => {
                if v < low || v > high || *v < 1 || !(*v as u64).is_power_of_two() {
                    return Err(out_of_domain());
                }
            }
            (Self::Enumerated { values }, ParameterValue::Choice(v)) => {
                if !values.iter().any(|candidate| candidate == v) {
                    return Err(out_of_domain());
                }
            }
            (Self::Boolean, ParameterValue::Bool(_)) => {}
            (Self::IntRange { .. } | Self::PowerOfTwo { .. }, _) => return Err(mismatch("integer")),
            (Self::Enumerated { .. }, _) => return Err(mismatch("choice")),
            (Self::Boolean, _) => return Err(mismatch("boolean")),
        }
        Ok(())
    }

    /// Number of values in the domain.
    pub fn cardinality(&self) -> u128 {
        match self {
            Self::IntRange { low, high } => (*high as i128 - *low as i128 + 1).max(0) as u128,
            Self::PowerOfTwo { .. } => self
                .pow2_exponents()
                .map(|(lo, hi)| (hi - lo + 1) as u128)
                .unwrap_or(0),
            Self::Enumerated { values } => values.len() as u128,
            Self::Boolean => 2,
        }
    }

    /// The `index`-th value in ascending domain order.
    pub fn value_at(&self, index: u128) -> Option<ParameterValue> {
        if index >= self.cardinality() {
            return None;
        }
        let value = match self {
            Self::IntRange { low, .. } => ParameterValue::Int((*low as i128 + index as i128) as i64),
            Self::PowerOfTwo { .. } => {
                let (lo, _) = self.pow2_exponents()?;
                ParameterValue::Int(1i64 << (lo + index as u32))
            }
            Self::Enumerated { values } => ParameterValue::Choice(values[index as usize].clone()),
            Self::Boolean => ParameterValue::Bool(index == 1),
        };
        Some(value)
    }

    /// Position of `value` in domain order, if it is a member.
    pub fn index_of(&self, value: &ParameterValue) -> Option<u128> {
        self.contains(value).ok()?;
        let index = match (self, value) {
            (Self::IntRange { low, .. }, ParameterValue::Int(v)) => (*v as i128 - *low as i128) as u128,
            (Self::PowerOfTwo { .. }, ParameterValue::Int(v)) => {
                let (lo, _) = self.pow2_exponents()?;
                ((*v as u64).trailing_zeros() - lo) as u128
            }
            (Self::Enumerated { values }, ParameterValue::Choice(v)) => {
                values.iter().position(|c| c == v)? as u128
            }
            (Self::Boolean, ParameterValue::Bool(v)) => u128::from(*v),
            _ => return None,
        };
        Some(index)
    }

    /// Draw a uniformly random member.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
            Self::PowerOfTwo { .. } => {
                let (lo, hi) = self.pow2_exponents().unwrap_or((0, 0));
                ParameterValue::Int(1i64 << rng.gen_range(lo..=hi))
            }
            Self::Enumerated { values } => {
                let idx = rng.gen_range(0..values.len());
                ParameterValue::Choice(values[idx].clone())
            }
            Self::Boolean => ParameterValue::Bool(rng.gen()),
        }
    }

    /// Move `steps` positions along the domain order from `value`, saturating
    /// at the ends. Non-members restart from the nearest end.
    pub fn step(&self, value: &ParameterValue, steps: i64) -> ParameterValue {
        let last = self.cardinality().saturating_sub(1) as i128;
        let start = self.index_of(value).map(|i| i as i128).unwrap_or(0);
        let target = (start + steps as i128).clamp(0, last) as u128;
        self.value_at(target)
            .unwrap_or_else(|| self.value_at(0).unwrap_or(ParameterValue::Bool(false)))
    }
}

impl std::fmt::Display for ParameterDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IntRange { low, high } => write!(f, "int[{low}, {high}]"),
            Self::PowerOfTwo { low, high } => write!(f, "pow2[{low}, {high}]"),
            Self::Enumerated { values } => write!(f, "enum{{{}}}", values.join(", ")),
            Self::Boolean => f.write_str("bool"),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Collects declarations before a session starts.
#[derive(Debug, Clone, Default)]
pub struct SpaceBuilder {
    parameters: Vec<ParameterDef>,
}

impl SpaceBuilder {
    /// Register a parameter, rejecting duplicate names and empty or inverted
    /// domains.
    pub fn declare(
        mut self,
        name: impl Into<String>,
        domain: ParameterDomain,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(ConfigurationError::InvalidDomain {
                message: format!("{name:?} is not a valid constant name"),
                name,
            });
        }
        if self.parameters.iter().any(|p| p.name == name) {
            return Err(ConfigurationError::DuplicateParameter { name });
        }
        domain
            .check()
            .map_err(|message| ConfigurationError::InvalidDomain {
                name: name.clone(),
                message,
            })?;
        self.parameters.push(ParameterDef { name, domain });
        Ok(self)
    }

    pub fn declare_all<I>(self, defs: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = ParameterDef>,
    {
        defs.into_iter()
            .try_fold(self, |builder, def| builder.declare(def.name, def.domain))
    }

    pub fn build(self) -> Result<ParameterSpace, ConfigurationError> {
        if self.parameters.is_empty() {
            return Err(ConfigurationError::EmptySpace);
        }
        let index = self
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        for p in &self.parameters {
            debug!("declared parameter {} over {}", p.name, p.domain);
        }
        Ok(ParameterSpace {
            parameters: self.parameters,
            index,
        })
    }
}

/// The frozen search space: an ordered list of uniquely named parameters.
/// There is no mutation API once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    parameters: Vec<ParameterDef>,
    index: HashMap<String, usize>,
}

impl ParameterSpace {
    pub fn builder() -> SpaceBuilder {
        SpaceBuilder::default()
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.index.get(name).map(|&i| &self.parameters[i])
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Check that `assignment` is complete, has no unknown names and keeps
    /// every value inside its domain.
    pub fn validate(&self, assignment: &Assignment) -> Result<(), InvalidAssignment> {
        for param in &self.parameters {
            let value = assignment
                .get(&param.name)
                .ok_or_else(|| InvalidAssignment::new(&param.name, AssignmentViolation::Missing))?;
            param
                .domain
                .contains(value)
                .map_err(|reason| InvalidAssignment::new(&param.name, reason))?;
        }
        if let Some(unknown) = assignment.names().find(|n| !self.index.contains_key(*n)) {
            return Err(InvalidAssignment::new(unknown, AssignmentViolation::Unknown));
        }
        Ok(())
    }

    /// Total number of distinct assignments, `None` on overflow.
    pub fn grid_size(&self) -> Option<u128> {
        self.parameters
            .iter()
            .try_fold(1u128, |acc, p| acc.checked_mul(p.domain.cardinality()))
    }

    /// The assignment at position `index` of the mixed-radix enumeration. The
    /// first declared parameter varies slowest.
    pub fn assignment_at(&self, mut index: u128) -> Option<Assignment> {
        if index >= self.grid_size()? {
            return None;
        }
        let mut values = Vec::with_capacity(self.parameters.len());
        for param in self.parameters.iter().rev() {
            let radix = param.domain.cardinality();
            values.push((param.name.clone(), param.domain.value_at(index % radix)?));
            index /= radix;
        }
        Some(values.into_iter().collect())
    }
}
