//! Immutable chain specification and its structural invariants.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::StepSpec;

/// Step ids name artifact files, so they are restricted to a portable charset.
static STEP_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid step id regex"));

/// Ordered, validated list of steps for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    steps: Vec<StepSpec>,
}

impl ChainSpec {
    /// Build a chain, returning every invariant violation on failure.
    pub fn new(steps: Vec<StepSpec>) -> Result<Self, Vec<String>> {
        let errors = validate_steps(&steps);
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Validate chain invariants, returning human-readable errors (empty if valid).
///
/// Errors are reported in step order.
pub fn validate_steps(steps: &[StepSpec]) -> Vec<String> {
    let mut errors = Vec::new();
    if steps.is_empty() {
        errors.push("chain has no steps".to_string());
        return errors;
    }

    let mut seen = BTreeSet::new();
    for (idx, step) in steps.iter().enumerate() {
        let position = idx + 1;
        if step.id.trim().is_empty() {
            errors.push(format!("step #{position}: id must not be empty"));
        } else if !STEP_ID_RE.is_match(&step.id) {
            errors.push(format!(
                "step #{position}: id '{}' must match {}",
                step.id,
                STEP_ID_RE.as_str()
            ));
        } else if !seen.insert(step.id.as_str()) {
            errors.push(format!("step #{position}: duplicate id '{}'", step.id));
        }
        if step.command.trim().is_empty() {
            errors.push(format!("step '{}': command must not be empty", step.id));
        }
        if step.timeout_secs == Some(0) {
            errors.push(format!("step '{}': timeout_secs must be > 0", step.id));
        }
    }
    errors
}
