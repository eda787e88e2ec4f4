//! Candidate encoding: assignments to build-level constants and back.

use mt_types::{
    Assignment, AssignmentViolation, BuildDefine, BuildInputs, InvalidAssignment, ParameterValue,
};
use std::sync::Arc;

use crate::space::{ParameterDomain, ParameterSpace};

/// Maps validated assignments to [`BuildInputs`] and recovers them for
/// reporting.
///
/// Encoding is injective: every parameter gets exactly one define, in
/// declaration order, and within one domain distinct values yield distinct
/// literals (decimal integers, `1`/`0` for booleans, enumerated tokens
/// verbatim).
#[derive(Debug, Clone)]
pub struct CandidateEncoder {
    space: Arc<ParameterSpace>,
}

impl CandidateEncoder {
    pub fn new(space: Arc<ParameterSpace>) -> Self {
        Self { space }
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    /// Validate then encode. Never fails for an in-domain assignment.
    pub fn encode(&self, assignment: &Assignment) -> Result<BuildInputs, InvalidAssignment> {
        self.space.validate(assignment)?;
        let defines = self
            .space
            .parameters()
            .iter()
            .map(|param| {
                let value = assignment
                    .get(&param.name)
                    .ok_or_else(|| InvalidAssignment::new(&param.name, AssignmentViolation::Missing))?;
                Ok(BuildDefine::new(&param.name, literal(value)))
            })
            .collect::<Result<Vec<_>, InvalidAssignment>>()?;
        Ok(BuildInputs::new(defines))
    }

    /// Recover the assignment that produced `inputs`.
    pub fn decode(&self, inputs: &BuildInputs) -> Result<Assignment, InvalidAssignment> {
        let mut assignment = Assignment::new();
        for param in self.space.parameters() {
            let text = inputs
                .get(&param.name)
                .ok_or_else(|| InvalidAssignment::new(&param.name, AssignmentViolation::Missing))?;
            let value = parse_literal(&param.domain, text).ok_or_else(|| {
                InvalidAssignment::new(
                    &param.name,
                    AssignmentViolation::OutOfDomain {
                        value: text.to_string(),
                        domain: param.domain.to_string(),
                    },
                )
            })?;
            assignment.insert(param.name.clone(), value);
        }
        if let Some(extra) = inputs
            .defines()
            .iter()
            .find(|d| self.space.get(&d.name).is_none())
        {
            return Err(InvalidAssignment::new(&extra.name, AssignmentViolation::Unknown));
        }
        self.space.validate(&assignment)?;
        Ok(assignment)
    }
}

fn literal(value: &ParameterValue) -> String {
    match value {
        ParameterValue::Int(v) => v.to_string(),
        ParameterValue::Bool(true) => "1".to_string(),
        ParameterValue::Bool(false) => "0".to_string(),
        ParameterValue::Choice(token) => token.clone(),
    }
}

fn parse_literal(domain: &ParameterDomain, text: &str) -> Option<ParameterValue> {
    match domain {
        ParameterDomain::IntRange { .. } | ParameterDomain::PowerOfTwo { .. } => {
            text.parse().ok().map(ParameterValue::Int)
        }
        ParameterDomain::Boolean => match text {
            "1" => Some(ParameterValue::Bool(true)),
            "0" => Some(ParameterValue::Bool(false)),
            _ => None,
        },
        ParameterDomain::Enumerated { .. } => Some(ParameterValue::Choice(text.to_string())),
    }
}
