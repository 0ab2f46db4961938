//! Structured patches
//!
//! A patch proposes new nodes and additive field updates for existing ones.
//! Applying it never edits the input: the result is a new document generation
//! plus a record of how proposed ids were reallocated. Nothing is ever
//! removed from a node by an update.

use std::collections::{BTreeMap, HashSet};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::domain::{RawPlan, reserve_unique_id};
use crate::error::{ErrorCode, PlanError, PlanErrors};

/// Additive update for one existing node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// A proposal; no effect until applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// Complete node objects
    pub add_nodes: Vec<Map<String, Value>>,
    pub update_nodes: Vec<NodeUpdate>,
    /// Free text, non-authoritative
    pub notes: Vec<String>,
}

fn invalid(message: impl Into<String>, path: impl Into<String>) -> PlanError {
    PlanError::new(ErrorCode::PatchInvalid, message).at(path)
}

/// `null` and absent keys both mean "empty"
fn list_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a [Value], PlanError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(invalid(format!("{} must be a list", key), key)),
    }
}

impl Patch {
    /// Parse the wire shape `{add_nodes: [{node}], update_nodes: [{id, fields}], notes}`
    pub fn from_value(value: &Value) -> Result<Self, PlanError> {
        debug!("Patch::from_value: called");
        let Value::Object(obj) = value else {
            return Err(invalid("patch must be an object", "patch"));
        };

        let mut add_nodes = Vec::new();
        for (i, item) in list_field(obj, "add_nodes")?.iter().enumerate() {
            match item.get("node") {
                Some(Value::Object(node)) => add_nodes.push(node.clone()),
                _ => {
                    return Err(invalid(
                        "each add_nodes item must be {node: {...}}",
                        format!("add_nodes[{}]", i),
                    ));
                }
            }
        }

        let mut update_nodes = Vec::new();
        for (i, item) in list_field(obj, "update_nodes")?.iter().enumerate() {
            if !item.is_object() {
                return Err(invalid(
                    "each update_nodes item must be an object",
                    format!("update_nodes[{}]", i),
                ));
            }
            let id = match item.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    return Err(invalid(
                        "update_nodes[].id must be a non-empty string",
                        format!("update_nodes[{}].id", i),
                    ));
                }
            };
            let Some(Value::Object(fields)) = item.get("fields") else {
                return Err(invalid(
                    "update_nodes[].fields must be an object",
                    format!("update_nodes[{}].fields", i),
                ));
            };
            update_nodes.push(NodeUpdate {
                id,
                fields: fields.clone(),
            });
        }

        let notes = list_field(obj, "notes")
            .map_err(|_| invalid("notes must be a list of strings", "notes"))?
            .iter()
            .map(|n| n.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("notes must be a list of strings", "notes"))?;

        Ok(Self {
            add_nodes,
            update_nodes,
            notes,
        })
    }

    /// Parse patch text, JSON or YAML, optionally inside a Markdown code fence
    pub fn parse(text: &str) -> Result<Self, PlanError> {
        debug!(len = text.len(), "Patch::parse: called");
        let body = strip_code_fence(text);
        let value: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(json_err) => serde_yaml::from_str(body).map_err(|yaml_err| {
                debug!(%json_err, %yaml_err, "Patch::parse: not JSON or YAML");
                invalid(format!("patch is not valid JSON or YAML: {}", json_err), "patch")
            })?,
        };
        Self::from_value(&value)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "add_nodes".to_string(),
            Value::Array(
                self.add_nodes
                    .iter()
                    .map(|n| {
                        let mut item = Map::new();
                        item.insert("node".to_string(), Value::Object(n.clone()));
                        Value::Object(item)
                    })
                    .collect(),
            ),
        );
        map.insert(
            "update_nodes".to_string(),
            Value::Array(
                self.update_nodes
                    .iter()
                    .map(|u| {
                        let mut item = Map::new();
                        item.insert("id".to_string(), Value::String(u.id.clone()));
                        item.insert("fields".to_string(), Value::Object(u.fields.clone()));
                        Value::Object(item)
                    })
                    .collect(),
            ),
        );
        map.insert(
            "notes".to_string(),
            Value::Array(self.notes.iter().cloned().map(Value::String).collect()),
        );
        Value::Object(map)
    }

    /// Additions plus updates
    pub fn change_count(&self) -> usize {
        self.add_nodes.len() + self.update_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_count() == 0
    }
}

impl Serialize for Patch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string (```json)
    let Some(newline) = rest.find('\n') else {
        return trimmed;
    };
    let body = rest[newline + 1..].trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// A new document generation and what the patch did to reach it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchApplication {
    #[serde(skip)]
    pub document: RawPlan,
    /// Proposed id -> allocated id, only for ids that had to change
    pub id_remap: BTreeMap<String, String>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub notes: Vec<String>,
}

/// Apply `patch` to a copy of `document`
///
/// Added nodes get collision-free ids; references to a reallocated proposed id
/// in added nodes and in update `depends_on` values follow the new id. Every
/// problem is reported, not just the first.
pub fn apply_patch(document: &RawPlan, patch: &Patch) -> Result<PatchApplication, PlanErrors> {
    debug!(
        add = patch.add_nodes.len(),
        update = patch.update_nodes.len(),
        "apply_patch: called"
    );
    let file = document.file();
    let mut nodes: Vec<Value> = match &document.nodes {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(PlanErrors::single(
                invalid("cannot patch a plan whose nodes is not an array", "nodes").with_file(file),
            ));
        }
    };

    let mut taken: HashSet<String> = document.node_ids();
    let mut errors = Vec::new();
    let mut id_remap = BTreeMap::new();
    let mut added_nodes = Vec::with_capacity(patch.add_nodes.len());

    for (i, proposal) in patch.add_nodes.iter().enumerate() {
        let proposed = match proposal.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id,
            _ => {
                errors.push(
                    invalid(
                        "add_nodes[].node.id must be a non-empty string",
                        format!("add_nodes[{}].node.id", i),
                    )
                    .with_file(file),
                );
                continue;
            }
        };
        let id = reserve_unique_id(&mut taken, proposed);
        if id != proposed {
            debug!(%proposed, %id, "apply_patch: reallocated id");
            id_remap.insert(proposed.to_string(), id.clone());
        }
        let mut node = proposal.clone();
        node.insert("id".to_string(), Value::String(id));
        added_nodes.push(node);
    }

    for node in &mut added_nodes {
        if let Some(deps) = node.get_mut("depends_on") {
            remap_ids(deps, &id_remap);
        }
    }

    // added nodes are not in `nodes` yet, so updates only reach the input's nodes
    let mut updated: Vec<String> = Vec::new();
    for (i, update) in patch.update_nodes.iter().enumerate() {
        let target = nodes
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|n| n.get("id").and_then(Value::as_str) == Some(update.id.as_str()));
        let Some(target) = target else {
            debug!(id = %update.id, "apply_patch: update targets unknown node");
            errors.push(
                PlanError::new(
                    ErrorCode::PatchUnknownNode,
                    format!("update_nodes references unknown id: {}", update.id),
                )
                .with_file(file)
                .at(format!("update_nodes[{}].id", i)),
            );
            continue;
        };

        for (key, value) in &update.fields {
            let mut value = value.clone();
            if key == "depends_on" {
                remap_ids(&mut value, &id_remap);
            }
            merge_field(target, key, value);
        }
        if !updated.contains(&update.id) {
            updated.push(update.id.clone());
        }
    }

    if let Some(errors) = PlanErrors::from_vec(errors) {
        debug!(count = errors.len(), "apply_patch: rejected");
        return Err(errors);
    }

    let added: Vec<String> = added_nodes
        .iter()
        .filter_map(|n| n.get("id").and_then(Value::as_str).map(str::to_string))
        .collect();
    nodes.extend(added_nodes.into_iter().map(Value::Object));

    info!(
        added = added.len(),
        updated = updated.len(),
        remapped = id_remap.len(),
        "Applied patch"
    );
    Ok(PatchApplication {
        document: RawPlan {
            nodes: Some(Value::Array(nodes)),
            ..document.clone()
        },
        id_remap,
        added,
        updated,
        notes: patch.notes.clone(),
    })
}

/// Rewrite string ids (bare or inside a list) through `remap`
fn remap_ids(value: &mut Value, remap: &BTreeMap<String, String>) {
    match value {
        Value::String(s) => {
            if let Some(new_id) = remap.get(s.as_str()) {
                *s = new_id.clone();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| remap_ids(v, remap)),
        _ => {}
    }
}

/// Additive merge of one field
///
/// `null` is ignored, lists gain missing items, absent or empty fields are
/// filled, anything else already present is kept.
pub fn merge_field(target: &mut Map<String, Value>, key: &str, value: Value) {
    if value.is_null() {
        return;
    }
    let Some(current) = target.get_mut(key) else {
        target.insert(key.to_string(), value);
        return;
    };
    match (current, value) {
        (Value::Array(existing), Value::Array(items)) => {
            for item in items {
                if !existing.contains(&item) {
                    existing.push(item);
                }
            }
        }
        (current, value) => {
            let empty = match current {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(items) => items.is_empty(),
                _ => false,
            };
            if empty {
                *current = value;
            }
        }
    }
}
