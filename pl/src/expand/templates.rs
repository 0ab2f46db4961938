//! Expansion templates
//!
//! A template is a named, ordered list of step titles. Built-ins can be
//! replaced or extended from a YAML file mapping name to steps.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ErrorCode, PlanError, Stage, StageError};

const SIMPLE: [&str; 4] = ["Design", "Implement", "Test", "Docs"];
const DEV: [&str; 6] = ["Design", "Implement", "Test", "Docs", "Review", "Release"];
const OPS: [&str; 5] = ["Monitoring", "SLOs", "Runbooks", "Playbooks", "Reliability"];

/// Merged template registry, ordered by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Vec<String>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    /// The built-in templates only
    pub fn builtin() -> Self {
        let to_vec = |steps: &[&str]| steps.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let mut templates = BTreeMap::new();
        templates.insert("simple".to_string(), to_vec(&SIMPLE));
        templates.insert("dev".to_string(), to_vec(&DEV));
        templates.insert("ops".to_string(), to_vec(&OPS));
        Self { templates }
    }

    /// Built-ins merged with an optional override file
    ///
    /// A missing file is a load failure; a malformed one fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, StageError> {
        debug!(?path, "TemplateRegistry::load: called");
        let mut registry = Self::builtin();
        let Some(path) = path else {
            return Ok(registry);
        };

        let shown = path.display().to_string();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(%shown, "TemplateRegistry::load: file not found");
                return Err(StageError::new(
                    Stage::Load,
                    PlanError::new(
                        ErrorCode::TemplateFileNotFound,
                        format!("template file not found: {}", shown),
                    )
                    .at("template_file"),
                ));
            }
            Err(e) => {
                return Err(StageError::new(
                    Stage::Expand,
                    PlanError::new(ErrorCode::TemplateFileInvalid, e.to_string()).at("template_file"),
                ));
            }
        };

        let overrides = parse_template_file(&text).map_err(|message| {
            debug!(%shown, %message, "TemplateRegistry::load: invalid template file");
            StageError::new(
                Stage::Expand,
                PlanError::new(ErrorCode::TemplateFileInvalid, message).at("template_file"),
            )
        })?;

        info!(file = %shown, count = overrides.len(), "Loaded template overrides");
        registry.merge(overrides);
        Ok(registry)
    }

    /// Overrides replace same-named templates and may add new ones
    pub fn merge(&mut self, overrides: BTreeMap<String, Vec<String>>) {
        debug!(count = overrides.len(), "TemplateRegistry::merge: called");
        self.templates.extend(overrides);
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.templates.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.templates.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Steps for `name`, or an unknown-template error under `code`
    pub fn resolve(&self, name: &str, code: ErrorCode) -> Result<&[String], PlanError> {
        debug!(%name, "TemplateRegistry::resolve: called");
        self.get(name).ok_or_else(|| {
            PlanError::new(
                code,
                format!(
                    "unknown template: {} (choose one of: {})",
                    name,
                    self.names().join(", ")
                ),
            )
            .at("template")
        })
    }
}

/// Parse override YAML: `name: [step, ...]`; empty or `null` means none
pub fn parse_template_file(text: &str) -> Result<BTreeMap<String, Vec<String>>, String> {
    debug!(len = text.len(), "parse_template_file: called");
    let value: Value = serde_yaml::from_str(text).map_err(|e| format!("template file is not valid YAML: {}", e))?;

    let map = match value {
        Value::Null => return Ok(BTreeMap::new()),
        Value::Object(map) => map,
        _ => return Err("template file must be a mapping of name -> list[str]".to_string()),
    };

    let mut out = BTreeMap::new();
    for (name, steps) in map {
        let name = name.trim();
        if name.is_empty() {
            return Err("template names must be non-empty strings".to_string());
        }
        let items = match steps {
            Value::Array(items) if !items.is_empty() => items,
            _ => return Err(format!("template '{}' must be a non-empty list", name)),
        };
        let mut titles = Vec::with_capacity(items.len());
        for item in items {
            match item.as_str().map(str::trim) {
                Some(title) if !title.is_empty() => titles.push(title.to_string()),
                _ => return Err(format!("template '{}' items must be non-empty strings", name)),
            }
        }
        out.insert(name.to_string(), titles);
    }
    Ok(out)
}
