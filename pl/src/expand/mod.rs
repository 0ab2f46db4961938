//! Deterministic expansion engine
//!
//! Grows a validated plan from its outcome roots: one deliverable per root and
//! a chain of tasks, one per template step. `append` always creates fresh
//! nodes; `merge` and `reconcile` first look for nodes an earlier expansion
//! produced (matched by canonical title) and only create what is missing.
//! The result goes through the same validation and lint gate as any plan.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{Node, NodeKind, Plan, reserve_unique_id};
use crate::error::{ErrorCode, PlanError, Stage, StageError};
use crate::gate;

mod templates;

pub use templates::{TemplateRegistry, parse_template_file};

const DELIVERABLE_DOD: [&str; 2] = ["Implementation complete", "Reviewed and accepted"];
const TASK_OWNER: &str = "auto";
const TASK_ESTIMATE_HOURS: u64 = 1;

/// How existing structure is treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpandMode {
    /// Always create a fresh chain
    #[default]
    Append,
    /// Reuse matching complete nodes, create the rest, never edit
    Merge,
    /// Reuse matching nodes and repair their omissions
    Reconcile,
}

impl ExpandMode {
    pub const ALL: [ExpandMode; 3] = [ExpandMode::Append, ExpandMode::Merge, ExpandMode::Reconcile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Merge => "merge",
            Self::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for ExpandMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpandMode {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|m| m.as_str() == s).ok_or_else(|| {
            PlanError::new(
                ErrorCode::ExpandUnknownMode,
                format!("unknown mode: {} (choose one of: append, merge, reconcile)", s),
            )
            .at("mode")
        })
    }
}

/// Which tasks `reconcile` may claim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileScope {
    /// Only tasks already depending on the chosen deliverable
    #[default]
    Strict,
    /// Any task with the canonical title, even one under another deliverable
    Loose,
}

impl ReconcileScope {
    pub fn from_strict(strict: bool) -> Self {
        if strict { Self::Strict } else { Self::Loose }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandOptions {
    /// Outcome to expand; every outcome root when `None`
    pub root: Option<String>,
    pub template: String,
    pub mode: ExpandMode,
    pub scope: ReconcileScope,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            root: None,
            template: "simple".to_string(),
            mode: ExpandMode::default(),
            scope: ReconcileScope::default(),
        }
    }
}

/// A gated expansion result
#[derive(Debug, Clone)]
pub struct ExpandReport {
    pub plan: Plan,
    pub roots: Vec<String>,
    /// Created node ids, in output order
    pub added: Vec<String>,
    /// Existing nodes matched and kept
    pub reused: Vec<String>,
    /// Existing nodes matched and edited by `reconcile`
    pub repaired: Vec<String>,
}

impl ExpandReport {
    pub fn change_count(&self) -> usize {
        self.added.len() + self.repaired.len()
    }
}

/// Expand `plan` and gate the result
pub fn expand(plan: &Plan, registry: &TemplateRegistry, options: &ExpandOptions) -> Result<ExpandReport, StageError> {
    debug!(root = ?options.root, template = %options.template, mode = %options.mode, "expand: called");
    let roots = select_roots(plan, options.root.as_deref())
        .map_err(|e| StageError::new(Stage::Expand, e.with_file(plan.source())))?;
    let steps = registry
        .resolve(&options.template, ErrorCode::ExpandUnknownTemplate)
        .map_err(|e| StageError::new(Stage::Expand, e.with_file(plan.source())))?;

    let mut builder = Builder::new(plan, options.mode, options.scope);
    for root in &roots {
        builder.expand_root(root, steps);
    }

    let raw = plan.derive_raw(&builder.nodes);
    let expanded = gate::check(&raw).inspect_err(|e| {
        debug!(stage = %e.stage, count = e.errors.len(), "expand: output failed the gate");
    })?;

    info!(
        roots = roots.len(),
        added = builder.added.len(),
        reused = builder.reused.len(),
        repaired = builder.repaired.len(),
        mode = %options.mode,
        "Expanded plan"
    );
    Ok(ExpandReport {
        plan: expanded,
        roots,
        added: builder.added,
        reused: builder.reused,
        repaired: builder.repaired,
    })
}

/// The explicit root if it is an outcome, else every outcome root in id order
pub fn select_roots(plan: &Plan, root: Option<&str>) -> Result<Vec<String>, PlanError> {
    debug!(?root, "select_roots: called");
    if let Some(root) = root {
        let Some(node) = plan.node(root) else {
            debug!(%root, "select_roots: unknown root");
            return Err(
                PlanError::new(ErrorCode::ExpandUnknownRoot, format!("root references unknown id: {}", root)).at("root"),
            );
        };
        if node.kind != NodeKind::Outcome {
            debug!(%root, kind = %node.kind, "select_roots: root is not an outcome");
            return Err(PlanError::new(
                ErrorCode::ExpandUnsupportedRootType,
                format!("root must be type=outcome, got type={}", node.kind),
            )
            .at("root"));
        }
        return Ok(vec![root.to_string()]);
    }

    // plan.roots() is already sorted
    let outcomes: Vec<String> = plan
        .roots()
        .iter()
        .filter(|id| plan.node(id).map(|n| n.kind == NodeKind::Outcome).unwrap_or(false))
        .cloned()
        .collect();
    if outcomes.is_empty() {
        debug!("select_roots: no outcome roots");
        return Err(PlanError::new(
            ErrorCode::ExpandNoOutcomeRoots,
            "no outcome roots to expand (roots exist, but none are type=outcome)",
        )
        .at("root_ids"));
    }
    Ok(outcomes)
}

/// Working copy of the node list for one expansion
struct Builder {
    mode: ExpandMode,
    scope: ReconcileScope,
    nodes: Vec<Node>,
    ids: HashSet<String>,
    claimed: HashSet<String>,
    added: Vec<String>,
    reused: Vec<String>,
    repaired: Vec<String>,
}

impl Builder {
    fn new(plan: &Plan, mode: ExpandMode, scope: ReconcileScope) -> Self {
        let nodes = plan.nodes().to_vec();
        let ids = nodes.iter().map(|n| n.id.clone()).collect();
        Self {
            mode,
            scope,
            nodes,
            ids,
            claimed: HashSet::new(),
            added: Vec::new(),
            reused: Vec::new(),
            repaired: Vec::new(),
        }
    }

    fn expand_root(&mut self, root: &str, steps: &[String]) {
        debug!(%root, steps = steps.len(), "Builder::expand_root: called");
        let deliverable = self.deliverable(root);

        let mut prev: Option<String> = None;
        for (i, step) in steps.iter().enumerate() {
            let task = self.task(root, &deliverable, prev.as_deref(), i + 1, step);
            prev = Some(task);
        }
    }

    fn deliverable(&mut self, root: &str) -> String {
        let title = format!("Deliver: {}", root);
        let required = vec![root.to_string()];
        let dod: Vec<String> = DELIVERABLE_DOD.iter().map(|s| s.to_string()).collect();

        if let Some(pos) = self.find(NodeKind::Deliverable, &title, &required, None) {
            return self.reuse(pos, &required, &dod, false);
        }

        let id = reserve_unique_id(&mut self.ids, &format!("DEL-{}-01", root));
        let node = Node::new(id, NodeKind::Deliverable, title)
            .with_definition_of_done(dod)
            .with_depends_on(required);
        self.create(node)
    }

    fn task(&mut self, root: &str, deliverable: &str, prev: Option<&str>, index: usize, step: &str) -> String {
        let title = format!("{}: {}", step, root);
        let mut required = vec![deliverable.to_string()];
        required.extend(prev.map(str::to_string));
        let dod = vec![format!("{} complete", step)];

        let scoped_to = match (self.mode, self.scope) {
            (ExpandMode::Reconcile, ReconcileScope::Loose) => None,
            _ => Some(deliverable),
        };
        if let Some(pos) = self.find(NodeKind::Task, &title, &required, scoped_to) {
            return self.reuse(pos, &required, &dod, true);
        }

        let id = reserve_unique_id(&mut self.ids, &format!("TSK-{}-{:02}", root, index));
        let node = Node::new(id, NodeKind::Task, title)
            .with_definition_of_done(dod)
            .with_depends_on(required)
            .with_owner(TASK_OWNER)
            .with_estimate_hours(TASK_ESTIMATE_HOURS);
        self.create(node)
    }

    /// Preferred unclaimed candidate: required edges present first, then lowest id
    fn find(&self, kind: NodeKind, title: &str, required: &[String], scoped_to: Option<&str>) -> Option<usize> {
        if self.mode == ExpandMode::Append {
            return None;
        }

        let mut candidates: Vec<(bool, bool, &str, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == kind && n.title == title && !self.claimed.contains(&n.id))
            .filter(|(_, n)| scoped_to.map(|d| n.depends_on_id(d)).unwrap_or(true))
            .map(|(pos, n)| {
                let complete = required.iter().all(|r| n.depends_on_id(r));
                let scoped = n.depends_on_id(&required[0]);
                (!complete, !scoped, n.id.as_str(), pos)
            })
            .collect();
        candidates.sort();

        let chosen = match self.mode {
            ExpandMode::Merge => candidates.into_iter().find(|c| !c.0),
            _ => candidates.into_iter().next(),
        };
        if let Some((_, _, id, _)) = chosen {
            debug!(%id, %title, "Builder::find: matched existing node");
        }
        chosen.map(|c| c.3)
    }

    fn reuse(&mut self, pos: usize, required: &[String], dod: &[String], is_task: bool) -> String {
        let id = self.nodes[pos].id.clone();
        self.claimed.insert(id.clone());
        if self.mode == ExpandMode::Reconcile && repair(&mut self.nodes[pos], required, dod, is_task) {
            debug!(%id, "Builder::reuse: repaired");
            self.repaired.push(id.clone());
        } else {
            self.reused.push(id.clone());
        }
        id
    }

    fn create(&mut self, node: Node) -> String {
        let id = node.id.clone();
        debug!(%id, kind = %node.kind, "Builder::create: new node");
        self.claimed.insert(id.clone());
        self.added.push(id.clone());
        self.nodes.push(node);
        id
    }
}

/// Additive repair of a matched node; true when anything changed
fn repair(node: &mut Node, required: &[String], dod: &[String], is_task: bool) -> bool {
    let mut changed = false;

    let mut depends_on = required.to_vec();
    depends_on.extend(node.depends_on.iter().filter(|d| !required.contains(d)).cloned());
    if depends_on != node.depends_on {
        node.depends_on = depends_on;
        changed = true;
    }

    if node.definition_of_done.is_empty() {
        node.definition_of_done = dod.to_vec();
        changed = true;
    }

    if is_task {
        if node.owner_is_blank() {
            node.owner = Some(TASK_OWNER.to_string());
            changed = true;
        }
        if !node.has_positive_estimate() {
            node.estimate_hours = Some(TASK_ESTIMATE_HOURS.into());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{Format, parse_document};
    use crate::validation::validate;

    fn plan(yaml: &str) -> Plan {
        validate(&parse_document(yaml, Format::Yaml, Some("plan.yaml")).unwrap()).unwrap()
    }

    fn base() -> Plan {
        plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-1, type: outcome, title: Ship it, definition_of_done: [shipped], depends_on: []}
"#,
        )
    }

    fn run(plan: &Plan, mode: ExpandMode) -> ExpandReport {
        let options = ExpandOptions {
            mode,
            ..Default::default()
        };
        expand(plan, &TemplateRegistry::builtin(), &options).unwrap()
    }

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.nodes().iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_append_builds_chain() {
        let report = run(&base(), ExpandMode::Append);
        let p = &report.plan;
        assert_eq!(
            ids(p),
            vec!["OUT-1", "DEL-OUT-1-01", "TSK-OUT-1-01", "TSK-OUT-1-02", "TSK-OUT-1-03", "TSK-OUT-1-04"]
        );
        let del = p.node("DEL-OUT-1-01").unwrap();
        assert_eq!(del.title, "Deliver: OUT-1");
        assert_eq!(del.depends_on, vec!["OUT-1"]);
        assert_eq!(del.definition_of_done, DELIVERABLE_DOD);

        let t1 = p.node("TSK-OUT-1-01").unwrap();
        assert_eq!(t1.title, "Design: OUT-1");
        assert_eq!(t1.depends_on, vec!["DEL-OUT-1-01"]);
        assert_eq!(t1.owner.as_deref(), Some("auto"));
        assert_eq!(t1.definition_of_done, vec!["Design complete"]);

        let t4 = p.node("TSK-OUT-1-04").unwrap();
        assert_eq!(t4.title, "Docs: OUT-1");
        assert_eq!(t4.depends_on, vec!["DEL-OUT-1-01", "TSK-OUT-1-03"]);
        assert_eq!(report.added.len(), 5);
    }

    #[test]
    fn test_append_twice_grows() {
        let once = run(&base(), ExpandMode::Append).plan;
        let twice = run(&once, ExpandMode::Append).plan;
        assert_eq!(twice.len(), 11);
        assert!(twice.contains("DEL-OUT-1-01-A"));
        assert!(twice.contains("TSK-OUT-1-04-A"));
        assert_eq!(
            twice.node("TSK-OUT-1-02-A").unwrap().depends_on,
            vec!["DEL-OUT-1-01-A", "TSK-OUT-1-01-A"]
        );
    }

    #[test]
    fn test_merge_after_append_is_identity() {
        let once = run(&base(), ExpandMode::Append).plan;
        let report = run(&once, ExpandMode::Merge);
        assert!(report.added.is_empty());
        assert_eq!(report.reused.len(), 5);
        assert_eq!(report.plan.to_raw(), once.to_raw());
    }

    #[test]
    fn test_merge_creates_missing_pieces_only() {
        let p = plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-1, type: outcome, title: Ship it, definition_of_done: [], depends_on: []}
  - {id: D, type: deliverable, title: "Deliver: OUT-1", definition_of_done: [x], depends_on: [OUT-1]}
  - {id: T, type: task, title: "Design: OUT-1", definition_of_done: [y], depends_on: [D], owner: sam}
"#,
        );
        let report = run(&p, ExpandMode::Merge);
        assert_eq!(report.reused, vec!["D", "T"]);
        assert_eq!(report.added, vec!["TSK-OUT-1-02", "TSK-OUT-1-03", "TSK-OUT-1-04"]);
        assert_eq!(report.plan.node("TSK-OUT-1-02").unwrap().depends_on, vec!["D", "T"]);
        // untouched
        assert_eq!(report.plan.node("T").unwrap().owner.as_deref(), Some("sam"));
    }

    #[test]
    fn test_untouched_nodes_keep_source_layout() {
        let p = plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-1, zeta: 1, type: outcome, title: Ship it, owner: null, definition_of_done: [], depends_on: []}
"#,
        );
        let report = run(&p, ExpandMode::Merge);
        let raw = report.plan.to_raw();
        let root = raw.node_values()[0].as_object().unwrap();
        let keys: Vec<_> = root.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["id", "zeta", "type", "title", "owner", "definition_of_done", "depends_on"]
        );
        assert_eq!(root["owner"], serde_json::Value::Null);
    }

    #[test]
    fn test_reconcile_repairs_and_is_idempotent() {
        let p = plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-1, type: outcome, title: Ship it, definition_of_done: [], depends_on: []}
  - {id: D, type: deliverable, title: "Deliver: OUT-1", definition_of_done: [], depends_on: [OUT-1]}
  - {id: T1, type: task, title: "Design: OUT-1", definition_of_done: [], depends_on: [D]}
  - {id: T2, type: task, title: "Implement: OUT-1", definition_of_done: [code], depends_on: [D], owner: "", estimate_hours: 0}
"#,
        );
        let options = ExpandOptions {
            mode: ExpandMode::Reconcile,
            ..Default::default()
        };
        let first = expand(&p, &TemplateRegistry::builtin(), &options).unwrap();
        let out = &first.plan;

        assert_eq!(out.node("D").unwrap().definition_of_done, DELIVERABLE_DOD);
        let t1 = out.node("T1").unwrap();
        assert_eq!(t1.definition_of_done, vec!["Design complete"]);
        assert_eq!(t1.owner.as_deref(), Some("auto"));
        assert!(t1.has_positive_estimate());
        let t2 = out.node("T2").unwrap();
        assert_eq!(t2.depends_on, vec!["D", "T1"]);
        assert_eq!(t2.definition_of_done, vec!["code"]);
        assert_eq!(first.repaired, vec!["D", "T1", "T2"]);

        let second = expand(out, &TemplateRegistry::builtin(), &options).unwrap();
        assert_eq!(second.change_count(), 0);
        assert_eq!(second.plan.to_raw(), out.to_raw());
    }

    #[test]
    fn test_reconcile_scope_strict_vs_loose() {
        let p = plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-EXP-001, type: outcome, title: x, definition_of_done: [], depends_on: []}
  - {id: DEL-OUT-EXP-001-01, type: deliverable, title: "Deliver: OUT-EXP-001", definition_of_done: [a], depends_on: [OUT-EXP-001]}
  - {id: DEL-OUT-EXP-001-01-A, type: deliverable, title: "Deliver: OUT-EXP-001", definition_of_done: [a], depends_on: [OUT-EXP-001]}
  - {id: TSK-FOREIGN-01, type: task, title: "Design: OUT-EXP-001", definition_of_done: [d], depends_on: [DEL-OUT-EXP-001-01-A], owner: pat}
"#,
        );
        let registry = TemplateRegistry::builtin();

        let strict = ExpandOptions {
            mode: ExpandMode::Reconcile,
            ..Default::default()
        };
        let out = expand(&p, &registry, &strict).unwrap().plan;
        let designs: Vec<_> = out.nodes().iter().filter(|n| n.title == "Design: OUT-EXP-001").collect();
        assert_eq!(designs.len(), 2);
        assert_eq!(out.node("TSK-FOREIGN-01").unwrap().depends_on, vec!["DEL-OUT-EXP-001-01-A"]);
        assert_eq!(out.node("TSK-OUT-EXP-001-01").unwrap().depends_on[0], "DEL-OUT-EXP-001-01");

        let loose = ExpandOptions {
            scope: ReconcileScope::Loose,
            ..strict
        };
        let out = expand(&p, &registry, &loose).unwrap().plan;
        let designs: Vec<_> = out.nodes().iter().filter(|n| n.title == "Design: OUT-EXP-001").collect();
        assert_eq!(designs.len(), 1);
        assert_eq!(
            designs[0].depends_on,
            vec!["DEL-OUT-EXP-001-01", "DEL-OUT-EXP-001-01-A"]
        );
    }

    #[test]
    fn test_extra_fields_survive() {
        let p = plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-1, type: outcome, title: Ship it, definition_of_done: [], depends_on: [], labels: [a]}
"#,
        );
        let out = run(&p, ExpandMode::Append).plan;
        assert_eq!(out.node("OUT-1").unwrap().extra["labels"], serde_json::json!(["a"]));
    }

    #[test]
    fn test_root_errors() {
        let p = plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: M, type: milestone, title: m, definition_of_done: [], depends_on: []}
"#,
        );
        let registry = TemplateRegistry::builtin();

        let err = expand(&p, &registry, &ExpandOptions::default()).unwrap_err();
        assert_eq!(err.stage, Stage::Expand);
        assert_eq!(err.errors.codes(), vec![ErrorCode::ExpandNoOutcomeRoots]);

        let options = ExpandOptions {
            root: Some("NOPE".to_string()),
            ..Default::default()
        };
        let err = expand(&p, &registry, &options).unwrap_err();
        assert_eq!(err.errors.codes(), vec![ErrorCode::ExpandUnknownRoot]);
        assert_eq!(err.errors.as_slice()[0].file.as_deref(), Some("plan.yaml"));

        let options = ExpandOptions {
            root: Some("M".to_string()),
            ..Default::default()
        };
        let err = expand(&p, &registry, &options).unwrap_err();
        assert_eq!(err.errors.as_slice()[0].message, "root must be type=outcome, got type=milestone");
    }

    #[test]
    fn test_unknown_template_and_mode() {
        let options = ExpandOptions {
            template: "nope".to_string(),
            ..Default::default()
        };
        let err = expand(&base(), &TemplateRegistry::builtin(), &options).unwrap_err();
        assert_eq!(err.errors.codes(), vec![ErrorCode::ExpandUnknownTemplate]);

        let err = "sideways".parse::<ExpandMode>().unwrap_err();
        assert_eq!(err.code, ErrorCode::ExpandUnknownMode);
        assert_eq!(err.path.as_deref(), Some("mode"));
        assert_eq!("reconcile".parse::<ExpandMode>().unwrap(), ExpandMode::Reconcile);
    }

    #[test]
    fn test_output_failing_gate_is_rejected() {
        // An existing task without an owner fails lint after expansion too.
        let p = plan(
            r#"
schema_version: "0.1.0"
nodes:
  - {id: OUT-1, type: outcome, title: x, definition_of_done: [], depends_on: []}
  - {id: T, type: task, title: t, definition_of_done: [x], depends_on: [OUT-1]}
"#,
        );
        let err = expand(&p, &TemplateRegistry::builtin(), &ExpandOptions::default()).unwrap_err();
        assert_eq!(err.stage, Stage::Lint);
        assert!(err.errors.contains(ErrorCode::TaskMissingOwner));
    }
}
