//! Validation + lint gate
//!
//! Automated transformations only accept output that passes both gates, the
//! same checks a human-authored plan goes through.

use tracing::debug;

use crate::domain::{Plan, RawPlan};
use crate::error::{PlanErrors, Stage, StageError};
use crate::lint::{lint, lint_raw_duplicates};
use crate::validation::validate;

/// Validate then lint; the plan is returned only when both pass
pub fn check(raw: &RawPlan) -> Result<Plan, StageError> {
    debug!(source = ?raw.source, "check: called");
    let plan = validate(raw).map_err(|errors| {
        debug!(count = errors.len(), "check: validation gate failed");
        StageError::new(Stage::Validate, errors)
    })?;

    let mut findings = lint_raw_duplicates(raw);
    findings.extend(lint(&plan));
    if let Some(errors) = PlanErrors::from_vec(findings) {
        debug!(count = errors.len(), "check: lint gate failed");
        return Err(StageError::new(Stage::Lint, errors));
    }

    debug!("check: both gates passed");
    Ok(plan)
}
