//! Plan documents
//!
//! A document exists in two states. [`RawPlan`] is what the loader produced:
//! the three top-level keys as untyped values plus provenance. [`Plan`] is a
//! validated document with typed nodes and an id index. Only the validator
//! constructs a `Plan`, so holding one means the structural checks passed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use super::node::{Node, NodeKind};
use super::roots::{RootResolution, resolve_roots};

/// An unvalidated document as loaded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPlan {
    pub schema_version: Option<Value>,
    pub nodes: Option<Value>,
    /// `None` when absent or `null`
    pub root_ids: Option<Value>,
    /// Source path, metadata only
    pub source: Option<String>,
}

impl RawPlan {
    pub fn file(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Node values when `nodes` is a sequence, empty otherwise
    pub fn node_values(&self) -> &[Value] {
        match &self.nodes {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    /// Every string id carried by an object node
    pub fn node_ids(&self) -> HashSet<String> {
        self.node_values()
            .iter()
            .filter_map(|n| n.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Document object in output key order: schema_version, nodes, root_ids
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "schema_version".to_string(),
            self.schema_version.clone().unwrap_or(Value::Null),
        );
        map.insert("nodes".to_string(), self.nodes.clone().unwrap_or(Value::Null));
        if let Some(root_ids) = &self.root_ids {
            map.insert("root_ids".to_string(), root_ids.clone());
        }
        Value::Object(map)
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        debug!(source = ?self.source, "RawPlan::to_yaml: called");
        serde_yaml::to_string(&self.to_value())
    }
}

impl Serialize for RawPlan {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

/// A validated document
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    schema_version: String,
    nodes: Vec<Node>,
    root_ids: Option<Vec<String>>,
    source: Option<String>,
    roots: Vec<String>,
    index: HashMap<String, usize>,
    /// Source objects by node id, for layout-preserving output
    layouts: HashMap<String, Map<String, Value>>,
}

impl Plan {
    /// Assemble a plan from parts that have already passed validation
    pub(crate) fn from_validated(
        schema_version: String,
        nodes: Vec<Node>,
        root_ids: Option<Vec<String>>,
        source: Option<String>,
    ) -> Self {
        debug!(node_count = nodes.len(), "Plan::from_validated: called");
        let index = nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), i)).collect();
        let roots = resolve_roots(
            root_ids.as_deref(),
            nodes.iter().map(|n| (n.id.as_str(), !n.depends_on.is_empty())),
        )
        .roots;
        Self {
            schema_version,
            nodes,
            root_ids,
            source,
            roots,
            index,
            layouts: HashMap::new(),
        }
    }

    /// Remember the source objects nodes were parsed from
    pub(crate) fn with_layouts(mut self, layouts: HashMap<String, Map<String, Value>>) -> Self {
        self.layouts = layouts;
        self
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn root_ids(&self) -> Option<&[String]> {
        self.root_ids.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Resolved roots, sorted
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Re-run root resolution with full diagnostics
    pub fn resolve_roots(&self) -> RootResolution {
        resolve_roots(
            self.root_ids.as_deref(),
            self.nodes.iter().map(|n| (n.id.as_str(), !n.depends_on.is_empty())),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Reverse edges: for each id, the nodes that list it in `depends_on`
    pub fn dependents(&self) -> HashMap<&str, Vec<&str>> {
        let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.depends_on {
                out.entry(dep.as_str()).or_default().push(node.id.as_str());
            }
        }
        out
    }

    /// Node count per kind, in reporting order
    pub fn type_counts(&self) -> Vec<(NodeKind, usize)> {
        NodeKind::ALL
            .into_iter()
            .map(|k| (k, self.nodes.iter().filter(|n| n.kind == k).count()))
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            node_count: self.nodes.len(),
            type_counts: self.type_counts(),
            roots: self.roots.clone(),
        }
    }

    /// Back to document form, a fresh generation
    pub fn to_raw(&self) -> RawPlan {
        self.derive_raw(&self.nodes)
    }

    /// A document with this plan's header and the given nodes
    pub fn derive_raw(&self, nodes: &[Node]) -> RawPlan {
        debug!(node_count = nodes.len(), "Plan::derive_raw: called");
        RawPlan {
            schema_version: Some(Value::String(self.schema_version.clone())),
            nodes: Some(Value::Array(
                nodes
                    .iter()
                    .map(|n| match self.layouts.get(&n.id) {
                        Some(original) => n.to_value_over(original),
                        None => n.to_value(),
                    })
                    .collect(),
            )),
            root_ids: self
                .root_ids
                .as_ref()
                .map(|ids| Value::Array(ids.iter().cloned().map(Value::String).collect())),
            source: self.source.clone(),
        }
    }
}

/// Shape summary of a validated plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub node_count: usize,
    pub type_counts: Vec<(NodeKind, usize)>,
    pub roots: Vec<String>,
}

impl Serialize for PlanSummary {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut counts = Map::new();
        for (kind, count) in &self.type_counts {
            counts.insert(kind.as_str().to_string(), Value::from(*count));
        }
        let mut map = Map::new();
        map.insert("node_count".to_string(), Value::from(self.node_count));
        map.insert("type_counts".to_string(), Value::Object(counts));
        map.insert(
            "roots".to_string(),
            Value::Array(self.roots.iter().cloned().map(Value::String).collect()),
        );
        Value::Object(map).serialize(serializer)
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .type_counts
            .iter()
            .map(|(kind, count)| format!("{}={}", kind, count))
            .collect();
        write!(
            f,
            "OK: {} nodes ({})\nRoots: {}",
            self.node_count,
            parts.join(", "),
            self.roots.join(", ")
        )
    }
}
