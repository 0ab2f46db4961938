//! What a suggestion source is told about the current round

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::domain::RawPlan;
use crate::error::PlanError;

/// Shape of a possibly-invalid document
///
/// Computed from the raw form because the loop may be repairing a document
/// that does not validate yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub schema_version: Option<String>,
    pub node_count: usize,
    pub type_counts: BTreeMap<String, usize>,
    pub declared_roots: Vec<String>,
    /// Ids whose `depends_on` is absent or has no string entries
    pub inferred_roots: Vec<String>,
}

impl DocumentSummary {
    pub fn of(document: &RawPlan) -> Self {
        let nodes = document.node_values();
        let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut inferred_roots = Vec::new();

        for node in nodes.iter().filter(|n| n.is_object()) {
            if let Some(kind) = node.get("type").and_then(Value::as_str) {
                *type_counts.entry(kind.to_string()).or_default() += 1;
            }
            let Some(id) = node.get("id").and_then(Value::as_str) else {
                continue;
            };
            let is_root = match node.get("depends_on") {
                None => true,
                Some(Value::Array(deps)) => !deps.iter().any(Value::is_string),
                Some(_) => false,
            };
            if is_root {
                inferred_roots.push(id.to_string());
            }
        }
        inferred_roots.sort();
        inferred_roots.dedup();

        let declared_roots = match &document.root_ids {
            Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            _ => Vec::new(),
        };

        Self {
            schema_version: document.schema_version.as_ref().and_then(Value::as_str).map(str::to_string),
            node_count: nodes.len(),
            type_counts,
            declared_roots,
            inferred_roots,
        }
    }
}

/// Per-round context handed to the suggestion source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairContext {
    pub round: usize,
    pub max_rounds: usize,
    /// Gate failures of the current document; empty when it already passes
    pub gate_errors: Vec<PlanError>,
    pub template: String,
    pub template_steps: Vec<String>,
    pub min_changes: usize,
    /// Notes accumulated from earlier adopted patches
    pub notes: Vec<String>,
    pub plan_summary: DocumentSummary,
}
