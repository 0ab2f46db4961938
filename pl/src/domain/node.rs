//! Node domain type
//!
//! A Node is one unit of work in a plan. Known fields are typed; anything else
//! the document carried is kept verbatim in `extra` so it survives expansion
//! and patching.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::debug;

/// Closed set of node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Outcome,
    Deliverable,
    Milestone,
    Task,
    Check,
}

impl NodeKind {
    /// All kinds in reporting order
    pub const ALL: [NodeKind; 5] = [
        NodeKind::Outcome,
        NodeKind::Deliverable,
        NodeKind::Milestone,
        NodeKind::Task,
        NodeKind::Check,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outcome => "outcome",
            Self::Deliverable => "deliverable",
            Self::Milestone => "milestone",
            Self::Task => "task",
            Self::Check => "check",
        }
    }

    /// Parse a kind token, `None` when not in the closed set
    pub fn parse(s: &str) -> Option<Self> {
        debug!(%s, "NodeKind::parse: called");
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Leaf execution units that must carry completion criteria
    pub fn is_execution_unit(&self) -> bool {
        matches!(self, Self::Task | Self::Check)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field names the validator understands; everything else is opaque
pub const KNOWN_FIELDS: [&str; 8] = [
    "id",
    "type",
    "title",
    "definition_of_done",
    "depends_on",
    "owner",
    "estimate_hours",
    "priority",
];

/// A validated plan node
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub title: String,
    pub definition_of_done: Vec<String>,
    pub depends_on: Vec<String>,
    pub owner: Option<String>,
    /// Kept as a JSON number so `1` stays `1` and `1.5` stays `1.5`
    pub estimate_hours: Option<Number>,
    pub priority: Option<i64>,
    /// Unrecognized fields, in document order
    pub extra: Map<String, Value>,
}

impl Node {
    /// Create a node with the required fields set and nothing optional
    pub fn new(id: impl Into<String>, kind: NodeKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            definition_of_done: Vec::new(),
            depends_on: Vec::new(),
            owner: None,
            estimate_hours: None,
            priority: None,
            extra: Map::new(),
        }
    }

    pub fn with_definition_of_done<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition_of_done = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_estimate_hours(mut self, hours: impl Into<Number>) -> Self {
        self.estimate_hours = Some(hours.into());
        self
    }

    /// True when the owner is absent or whitespace only
    pub fn owner_is_blank(&self) -> bool {
        self.owner.as_deref().map(|o| o.trim().is_empty()).unwrap_or(true)
    }

    /// True when the estimate is present and strictly positive
    pub fn has_positive_estimate(&self) -> bool {
        self.estimate_hours
            .as_ref()
            .and_then(Number::as_f64)
            .map(|h| h > 0.0)
            .unwrap_or(false)
    }

    pub fn depends_on_id(&self, id: &str) -> bool {
        self.depends_on.iter().any(|d| d == id)
    }

    /// Serialize back to a document object: known fields first, extras after
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        map.insert("type".to_string(), Value::String(self.kind.as_str().to_string()));
        map.insert("title".to_string(), Value::String(self.title.clone()));
        map.insert(
            "definition_of_done".to_string(),
            Value::Array(self.definition_of_done.iter().cloned().map(Value::String).collect()),
        );
        map.insert(
            "depends_on".to_string(),
            Value::Array(self.depends_on.iter().cloned().map(Value::String).collect()),
        );
        if let Some(owner) = &self.owner {
            map.insert("owner".to_string(), Value::String(owner.clone()));
        }
        if let Some(hours) = &self.estimate_hours {
            map.insert("estimate_hours".to_string(), Value::Number(hours.clone()));
        }
        if let Some(priority) = self.priority {
            map.insert("priority".to_string(), Value::from(priority));
        }
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

impl Node {
    /// Serialize onto the object this node was parsed from
    ///
    /// Keys keep their source order and explicit `null`s survive; fields the
    /// source lacked are appended in [`Node::to_value`] order.
    pub fn to_value_over(&self, original: &Map<String, Value>) -> Value {
        let Value::Object(mut fresh) = self.to_value() else {
            return self.to_value();
        };
        let mut map = Map::new();
        for (key, value) in original {
            match fresh.remove(key) {
                Some(current) => {
                    map.insert(key.clone(), current);
                }
                None if value.is_null() => {
                    map.insert(key.clone(), Value::Null);
                }
                None => {}
            }
        }
        map.extend(fresh);
        Value::Object(map)
    }
}
