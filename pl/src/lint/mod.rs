//! Lint engine
//!
//! Quality rules layered on a validated plan. Findings use `L_` codes and are
//! a report for the `lint` command but a hard gate inside expansion and the
//! repair loop.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{NodeKind, Plan, RawPlan};
use crate::error::{ErrorCode, PlanError, sort_errors};

mod graph;

pub use graph::{find_cycles, reachable_from};

/// Run every lint rule on a validated plan; empty means clean
pub fn lint(plan: &Plan) -> Vec<PlanError> {
    debug!(node_count = plan.len(), "lint: called");
    let file = plan.source();
    let mut errors = Vec::new();

    // Ids are unique once validated; the rescan keeps this rule independent
    // of the validator.
    let ids = plan.nodes().iter().map(|n| Some(n.id.as_str()));
    errors.extend(duplicate_ids(ids, file));

    for (i, node) in plan.nodes().iter().enumerate() {
        if node.kind.is_execution_unit() && node.definition_of_done.is_empty() {
            errors.push(
                PlanError::new(
                    ErrorCode::EmptyDefinitionOfDone,
                    format!("{} {} has an empty definition_of_done", node.kind, node.id),
                )
                .with_file(file)
                .at(format!("nodes[{}].definition_of_done", i)),
            );
        }
        if node.kind == NodeKind::Task && node.owner_is_blank() {
            errors.push(
                PlanError::new(ErrorCode::TaskMissingOwner, format!("task {} has no owner", node.id))
                    .with_file(file)
                    .at(format!("nodes[{}].owner", i)),
            );
        }
    }

    errors.extend(unreachable_nodes(plan));
    errors.extend(cycles(plan));

    sort_errors(&mut errors);
    if errors.is_empty() {
        info!("Lint passed");
    } else {
        info!(count = errors.len(), "Lint found issues");
    }
    errors
}

/// Duplicate-id scan on a raw document, so it can run before validation
pub fn lint_raw_duplicates(raw: &RawPlan) -> Vec<PlanError> {
    debug!(source = ?raw.source, "lint_raw_duplicates: called");
    let ids = raw.node_values().iter().map(|n| n.get("id").and_then(Value::as_str));
    let mut errors = duplicate_ids(ids, raw.file());
    sort_errors(&mut errors);
    errors
}

/// One finding per occurrence after the first, with the total count
fn duplicate_ids<'a, I>(ids: I, file: Option<&str>) -> Vec<PlanError>
where
    I: Iterator<Item = Option<&'a str>> + Clone,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in ids.clone().flatten() {
        *counts.entry(id).or_default() += 1;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut errors = Vec::new();
    for (i, id) in ids.enumerate() {
        let Some(id) = id else { continue };
        let count = counts.get(id).copied().unwrap_or(0);
        if count < 2 {
            continue;
        }
        if seen.insert(id) {
            continue;
        }
        errors.push(
            PlanError::new(
                ErrorCode::LintDuplicateId,
                format!("duplicate node id: {} (count={})", id, count),
            )
            .with_file(file)
            .at(format!("nodes[{}].id", i)),
        );
    }
    errors
}

/// Nodes not reachable from the resolved roots
fn unreachable_nodes(plan: &Plan) -> Vec<PlanError> {
    let roots = plan.resolve_roots().roots;
    let reached = reachable_from(plan.nodes(), &roots);
    plan.nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| !reached.contains(n.id.as_str()))
        .map(|(i, n)| {
            debug!(id = %n.id, "unreachable_nodes: unreachable");
            PlanError::new(
                ErrorCode::UnreachableNode,
                format!("node {} is not reachable from any root", n.id),
            )
            .with_file(plan.source())
            .at(format!("nodes[{}]", i))
        })
        .collect()
}

/// One finding per distinct cycle, located at its first node
fn cycles(plan: &Plan) -> Vec<PlanError> {
    find_cycles(plan.nodes())
        .into_iter()
        .map(|cycle| {
            let at = plan.position(&cycle[0]).unwrap_or(0);
            PlanError::new(
                ErrorCode::CycleDetected,
                format!("dependency cycle detected: {}", cycle.join(" -> ")),
            )
            .with_file(plan.source())
            .at(format!("nodes[{}].depends_on", at))
        })
        .collect()
}
