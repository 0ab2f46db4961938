//! Structural validation
//!
//! Turns a [`RawPlan`] into a [`Plan`] or the complete set of structural
//! errors. Every check runs; nothing short-circuits on the first failure.
//! Cycles are a lint concern and are not checked here.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Number, Value};
use tracing::{debug, info};

use crate::domain::{KNOWN_FIELDS, Node, NodeKind, Plan, RawPlan, resolve_roots};
use crate::error::{ErrorCode, PlanError, PlanErrors};

/// Validate a raw document
pub fn validate(raw: &RawPlan) -> Result<Plan, PlanErrors> {
    debug!(source = ?raw.source, "validate: called");
    let mut v = Validator::new(raw.file());

    let schema_version = v.schema_version(raw.schema_version.as_ref());

    let (nodes, root_ids) = match &raw.nodes {
        Some(Value::Array(items)) => {
            let nodes = v.nodes(items);
            v.dependencies(items);
            let root_ids = v.roots(raw.root_ids.as_ref(), items);
            (nodes, root_ids)
        }
        _ => {
            debug!("validate: nodes missing or not a sequence, skipping node checks");
            v.push(
                ErrorCode::RequiredField,
                "nodes is required and must be an array",
                "nodes",
            );
            (Vec::new(), None)
        }
    };

    if let Some(errors) = v.finish() {
        debug!(count = errors.len(), "validate: failed");
        return Err(errors);
    }

    // No errors means every node and the schema version parsed
    let schema_version = schema_version.unwrap_or_default();
    let mut layouts = HashMap::new();
    let mut parsed = Vec::with_capacity(nodes.len());
    for (i, node) in nodes.into_iter().flatten() {
        if let Some(obj) = raw.node_values().get(i).and_then(Value::as_object) {
            layouts.insert(node.id.clone(), obj.clone());
        }
        parsed.push(node);
    }
    let plan = Plan::from_validated(schema_version, parsed, root_ids, raw.source.clone()).with_layouts(layouts);
    info!(nodes = plan.len(), roots = ?plan.roots(), "Plan validated");
    Ok(plan)
}

/// Message for an out-of-enum `type`, listing the kinds alphabetically
fn type_enum_message() -> String {
    let mut kinds: Vec<&str> = NodeKind::ALL.iter().map(NodeKind::as_str).collect();
    kinds.sort();
    format!("type must be one of [{}]", kinds.join(", "))
}

fn is_blank_str(v: Option<&Value>) -> bool {
    v.and_then(Value::as_str).map(|s| s.trim().is_empty()).unwrap_or(true)
}

fn string_list(v: Option<&Value>) -> Option<Vec<String>> {
    v?.as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

/// `(id, has_dependencies)` for every node whose id and `depends_on` are usable
///
/// Errors in other fields do not hide a node from root resolution; only the
/// first occurrence of an id counts.
fn root_candidates(items: &[Value]) -> Vec<(&str, bool)> {
    let mut seen: HashSet<&str> = HashSet::new();
    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_str).filter(|id| !id.trim().is_empty())?;
            if !seen.insert(id) {
                return None;
            }
            let deps = item.get("depends_on")?.as_array()?;
            deps.iter().all(Value::is_string).then_some((id, !deps.is_empty()))
        })
        .collect()
}

/// Error accumulator with the document's file attached
struct Validator<'a> {
    file: Option<&'a str>,
    errors: Vec<PlanError>,
}

impl<'a> Validator<'a> {
    fn new(file: Option<&'a str>) -> Self {
        Self {
            file,
            errors: Vec::new(),
        }
    }

    fn push(&mut self, code: ErrorCode, message: impl Into<String>, path: impl Into<String>) {
        self.errors
            .push(PlanError::new(code, message).with_file(self.file).at(path));
    }

    fn finish(self) -> Option<PlanErrors> {
        PlanErrors::from_vec(self.errors)
    }

    fn schema_version(&mut self, value: Option<&Value>) -> Option<String> {
        match value.and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => Some(s.to_string()),
            _ => {
                self.push(
                    ErrorCode::RequiredField,
                    "schema_version is required and must be a non-empty string",
                    "schema_version",
                );
                None
            }
        }
    }

    /// Check every node; `Some((index, node))` for those that parsed fully
    /// and are the first occurrence of their id
    fn nodes(&mut self, items: &[Value]) -> Vec<Option<(usize, Node)>> {
        debug!(count = items.len(), "Validator::nodes: called");
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::with_capacity(items.len());

        for (i, item) in items.iter().enumerate() {
            let Some(obj) = item.as_object() else {
                self.push(ErrorCode::InvalidType, "node must be an object", format!("nodes[{}]", i));
                out.push(None);
                continue;
            };

            let mut duplicate = false;
            if let Some(id) = obj.get("id").and_then(Value::as_str)
                && !id.trim().is_empty()
                && !seen.insert(id)
            {
                debug!(%id, index = i, "Validator::nodes: duplicate id");
                self.push(
                    ErrorCode::DuplicateId,
                    format!("duplicate node id: {}", id),
                    format!("nodes[{}].id", i),
                );
                duplicate = true;
            }

            let node = self.node(i, obj);
            out.push(if duplicate { None } else { node.map(|n| (i, n)) });
        }
        out
    }

    /// Field checks for one node, all independent
    fn node(&mut self, i: usize, obj: &Map<String, Value>) -> Option<Node> {
        let at = |field: &str| format!("nodes[{}].{}", i, field);
        let before = self.errors.len();

        if is_blank_str(obj.get("id")) {
            self.push(
                ErrorCode::RequiredField,
                "id is required and must be a non-empty string",
                at("id"),
            );
        }

        let kind = obj.get("type").and_then(Value::as_str).and_then(NodeKind::parse);
        if kind.is_none() {
            self.push(ErrorCode::InvalidEnum, type_enum_message(), at("type"));
        }

        if is_blank_str(obj.get("title")) {
            self.push(
                ErrorCode::RequiredField,
                "title is required and must be a non-empty string",
                at("title"),
            );
        }

        let dod = string_list(obj.get("definition_of_done"));
        if dod.is_none() {
            self.push(
                ErrorCode::InvalidType,
                "definition_of_done must be an array of strings",
                at("definition_of_done"),
            );
        }

        let deps = string_list(obj.get("depends_on"));
        if deps.is_none() {
            self.push(
                ErrorCode::InvalidType,
                "depends_on must be an array of strings",
                at("depends_on"),
            );
        }

        let owner = match obj.get("owner") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                self.push(ErrorCode::InvalidType, "owner must be a string", at("owner"));
                None
            }
        };

        let estimate_hours: Option<Number> = match obj.get("estimate_hours") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.clone()),
            Some(_) => {
                self.push(
                    ErrorCode::InvalidType,
                    "estimate_hours must be a number",
                    at("estimate_hours"),
                );
                None
            }
        };

        let priority = match obj.get("priority") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_i64() {
                Some(p) => Some(p),
                None => {
                    self.push(ErrorCode::InvalidType, "priority must be an integer", at("priority"));
                    None
                }
            },
        };

        if self.errors.len() > before {
            debug!(index = i, "Validator::node: node has errors");
            return None;
        }

        let (Some(kind), Some(dod), Some(deps)) = (kind, dod, deps) else {
            return None;
        };
        let id = obj.get("id").and_then(Value::as_str).unwrap_or_default();
        let title = obj.get("title").and_then(Value::as_str).unwrap_or_default();

        let extra: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Node {
            id: id.to_string(),
            kind,
            title: title.to_string(),
            definition_of_done: dod,
            depends_on: deps,
            owner,
            estimate_hours,
            priority,
            extra,
        })
    }

    /// Every `depends_on` entry must name a node id present in the document
    fn dependencies(&mut self, items: &[Value]) {
        let known: HashSet<&str> = items
            .iter()
            .filter_map(|n| n.get("id").and_then(Value::as_str))
            .filter(|id| !id.trim().is_empty())
            .collect();
        debug!(known = known.len(), "Validator::dependencies: called");

        for (i, item) in items.iter().enumerate() {
            let Some(deps) = item.get("depends_on").and_then(Value::as_array) else {
                continue;
            };
            for (j, dep) in deps.iter().enumerate() {
                if let Some(dep) = dep.as_str()
                    && !known.contains(dep)
                {
                    self.push(
                        ErrorCode::UnknownDependency,
                        format!("depends_on references unknown id: {}", dep),
                        format!("nodes[{}].depends_on[{}]", i, j),
                    );
                }
            }
        }
    }

    /// Root consistency; returns the explicit root ids when well-typed
    fn roots(&mut self, root_ids: Option<&Value>, items: &[Value]) -> Option<Vec<String>> {
        debug!(explicit = root_ids.is_some(), "Validator::roots: called");
        let candidates = root_candidates(items);

        let explicit = match root_ids {
            None => None,
            Some(value) => match string_list(Some(value)) {
                Some(ids) => Some(ids),
                None => {
                    debug!("Validator::roots: root_ids mistyped, skipping root checks");
                    self.push(
                        ErrorCode::InvalidType,
                        "root_ids must be an array of strings",
                        "root_ids",
                    );
                    return None;
                }
            },
        };

        let resolution = resolve_roots(explicit.as_deref(), candidates);
        for (k, rid) in &resolution.unknown {
            self.push(
                ErrorCode::UnknownRoot,
                format!("root_ids references unknown id: {}", rid),
                format!("root_ids[{}]", k),
            );
        }
        for (k, rid) in &resolution.with_dependencies {
            self.push(
                ErrorCode::RootHasDependencies,
                format!("root node must have depends_on: [], but {} has dependencies", rid),
                format!("root_ids[{}]", k),
            );
        }
        if resolution.is_empty() {
            let message = if resolution.explicit {
                "root_ids did not yield any valid roots"
            } else {
                "no root nodes found (a root must have depends_on: [])"
            };
            self.push(ErrorCode::NoRoots, message, "root_ids");
        }
        explicit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Format, parse_document};

    fn raw(yaml: &str) -> RawPlan {
        parse_document(yaml, Format::Yaml, Some("plan.yaml")).unwrap()
    }

    fn codes(yaml: &str) -> Vec<ErrorCode> {
        validate(&raw(yaml)).unwrap_err().codes()
    }

    const CHAIN: &str = r#"
schema_version: "0.1.0"
nodes:
  - id: A
    type: outcome
    title: Outcome
    definition_of_done: []
    depends_on: []
  - id: B
    type: deliverable
    title: Deliverable
    definition_of_done: [done]
    depends_on: [A]
  - id: C
    type: task
    title: Task
    definition_of_done: [done]
    depends_on: [B]
    owner: sam
    estimate_hours: 1.5
    labels: [x]
"#;

    #[test]
    fn test_valid_chain() {
        let plan = validate(&raw(CHAIN)).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.roots(), ["A"]);
        let c = plan.node("C").unwrap();
        assert_eq!(c.owner.as_deref(), Some("sam"));
        assert_eq!(c.extra.get("labels"), Some(&serde_json::json!(["x"])));
        assert_eq!(
            plan.summary().to_string(),
            "OK: 3 nodes (outcome=1, deliverable=1, milestone=0, task=1, check=0)\nRoots: A"
        );
    }

    #[test]
    fn test_missing_nodes_still_checks_schema_version() {
        let c = codes("foo: 1\n");
        assert_eq!(c, vec![ErrorCode::RequiredField, ErrorCode::RequiredField]);
    }

    #[test]
    fn test_non_object_node() {
        let errors = validate(&raw("schema_version: '1'\nnodes: [1]\n")).unwrap_err();
        assert!(errors.iter().any(|e| e.code == ErrorCode::InvalidType && e.path.as_deref() == Some("nodes[0]")));
    }

    #[test]
    fn test_all_field_errors_reported_for_one_node() {
        let errors = validate(&raw(
            "schema_version: '1'\nnodes:\n  - id: ''\n    type: epic\n    title: ' '\n    owner: 3\n    priority: 1.5\n",
        ))
        .unwrap_err();
        let paths: Vec<_> = errors.iter().filter_map(|e| e.path.clone()).collect();
        for expected in [
            "nodes[0].id",
            "nodes[0].type",
            "nodes[0].title",
            "nodes[0].definition_of_done",
            "nodes[0].depends_on",
            "nodes[0].owner",
            "nodes[0].priority",
        ] {
            assert!(paths.iter().any(|p| p == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_type_enum_message() {
        let errors = validate(&raw(
            "schema_version: '1'\nnodes:\n  - {id: A, type: epic, title: t, definition_of_done: [], depends_on: []}\n",
        ))
        .unwrap_err();
        let e = errors.iter().find(|e| e.code == ErrorCode::InvalidEnum).unwrap();
        assert_eq!(e.message, "type must be one of [check, deliverable, milestone, outcome, task]");
    }

    #[test]
    fn test_duplicate_reported_on_later_occurrence() {
        let errors = validate(&raw(
            r#"
schema_version: "1"
nodes:
  - {id: A, type: outcome, title: a, definition_of_done: [], depends_on: []}
  - {id: A, type: outcome, title: b, definition_of_done: [], depends_on: []}
"#,
        ))
        .unwrap_err();
        let dup: Vec<_> = errors.iter().filter(|e| e.code == ErrorCode::DuplicateId).collect();
        assert_eq!(dup.len(), 1);
        assert_eq!(dup[0].path.as_deref(), Some("nodes[1].id"));
        assert_eq!(dup[0].message, "duplicate node id: A");
    }

    #[test]
    fn test_unknown_dependency_path() {
        let errors = validate(&raw(
            r#"
schema_version: "1"
nodes:
  - {id: A, type: outcome, title: a, definition_of_done: [], depends_on: []}
  - {id: B, type: task, title: b, definition_of_done: [], depends_on: [A, Z]}
"#,
        ))
        .unwrap_err();
        assert_eq!(errors.len(), 1);
        let e = &errors.as_slice()[0];
        assert_eq!(e.code, ErrorCode::UnknownDependency);
        assert_eq!(e.path.as_deref(), Some("nodes[1].depends_on[1]"));
        assert_eq!(e.to_string(), "plan.yaml:nodes[1].depends_on[1]: E_UNKNOWN_DEPENDENCY: depends_on references unknown id: Z");
    }

    #[test]
    fn test_no_inferred_roots_reports_only_no_roots() {
        let c = codes(
            r#"
schema_version: "1"
nodes:
  - {id: A, type: task, title: a, definition_of_done: [], depends_on: [B]}
  - {id: B, type: task, title: b, definition_of_done: [], depends_on: [A]}
"#,
        );
        assert_eq!(c, vec![ErrorCode::NoRoots]);
    }

    #[test]
    fn test_unknown_explicit_root_also_no_roots() {
        let c = codes(
            r#"
schema_version: "1"
root_ids: [X]
nodes:
  - {id: A, type: outcome, title: a, definition_of_done: [], depends_on: []}
"#,
        );
        assert_eq!(c, vec![ErrorCode::NoRoots, ErrorCode::UnknownRoot]);
    }

    #[test]
    fn test_root_with_dependencies() {
        let errors = validate(&raw(
            r#"
schema_version: "1"
root_ids: [A, B]
nodes:
  - {id: A, type: outcome, title: a, definition_of_done: [], depends_on: []}
  - {id: B, type: task, title: b, definition_of_done: [], depends_on: [A]}
"#,
        ))
        .unwrap_err();
        assert_eq!(errors.codes(), vec![ErrorCode::RootHasDependencies]);
        assert_eq!(errors.as_slice()[0].path.as_deref(), Some("root_ids[1]"));
    }

    #[test]
    fn test_field_errors_do_not_hide_roots() {
        let inferred = codes(
            r#"
schema_version: "1"
nodes:
  - {id: A, type: outcome, title: a, definition_of_done: [], depends_on: [], owner: 3}
"#,
        );
        assert_eq!(inferred, vec![ErrorCode::InvalidType]);

        let explicit = validate(&raw(
            r#"
schema_version: "1"
root_ids: [A]
nodes:
  - {id: A, type: outcome, title: a, definition_of_done: [], depends_on: [], priority: high}
"#,
        ))
        .unwrap_err();
        assert_eq!(explicit.codes(), vec![ErrorCode::InvalidType]);
        assert_eq!(explicit.as_slice()[0].path.as_deref(), Some("nodes[0].priority"));
    }

    #[test]
    fn test_mistyped_root_ids_suppresses_no_roots() {
        let c = codes(
            r#"
schema_version: "1"
root_ids: A
nodes:
  - {id: A, type: outcome, title: a, definition_of_done: [], depends_on: []}
"#,
        );
        assert_eq!(c, vec![ErrorCode::InvalidType]);
    }

    #[test]
    fn test_cycle_with_root_passes_validation() {
        let plan = validate(&raw(
            r#"
schema_version: "1"
nodes:
  - {id: R, type: outcome, title: r, definition_of_done: [], depends_on: []}
  - {id: A, type: task, title: a, definition_of_done: [x], depends_on: [R, C]}
  - {id: B, type: task, title: b, definition_of_done: [x], depends_on: [A]}
  - {id: C, type: task, title: c, definition_of_done: [x], depends_on: [B]}
"#,
        ));
        assert!(plan.is_ok());
    }
}
