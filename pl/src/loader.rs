//! Plan loading
//!
//! Reads a YAML or JSON file into a [`RawPlan`]. Only `schema_version`,
//! `nodes` and `root_ids` survive at the top level; node objects pass through
//! untouched. Shape checking belongs to the validator.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::RawPlan;
use crate::error::{ErrorCode, PlanError, Stage, StageError};

/// Document format, chosen by file suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Match `.yaml`/`.yml`/`.json`, case-insensitively
    pub fn from_path(path: &Path) -> Option<Self> {
        debug!(path = %path.display(), "Format::from_path: called");
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Parse document text and keep the whitelisted top-level keys
pub fn parse_document(text: &str, format: Format, source: Option<&str>) -> Result<RawPlan, PlanError> {
    debug!(?format, ?source, len = text.len(), "parse_document: called");
    let value: Value = match format {
        Format::Yaml => serde_yaml::from_str(text)
            .map_err(|e| PlanError::new(ErrorCode::YamlParse, e.to_string()).with_file(source))?,
        Format::Json => serde_json::from_str(text)
            .map_err(|e| PlanError::new(ErrorCode::JsonParse, e.to_string()).with_file(source))?,
    };
    normalize(value, source)
}

/// Reduce a parsed value to the document shape
pub fn normalize(value: Value, source: Option<&str>) -> Result<RawPlan, PlanError> {
    debug!(?source, "normalize: called");
    let Value::Object(mut map) = value else {
        debug!("normalize: top level is not a mapping");
        return Err(PlanError::new(
            ErrorCode::InvalidTopLevel,
            "top-level document must be a mapping/object",
        )
        .with_file(source));
    };

    let dropped: Vec<&String> = map
        .keys()
        .filter(|k| !matches!(k.as_str(), "schema_version" | "nodes" | "root_ids"))
        .collect();
    if !dropped.is_empty() {
        debug!(?dropped, "normalize: dropping unknown top-level keys");
    }

    let root_ids = match map.remove("root_ids") {
        Some(Value::Null) | None => None,
        Some(v) => Some(v),
    };

    Ok(RawPlan {
        schema_version: map.remove("schema_version"),
        nodes: map.remove("nodes"),
        root_ids,
        source: source.map(str::to_string),
    })
}

/// Load a plan file from disk
pub fn load_plan(path: impl AsRef<Path>) -> Result<RawPlan, StageError> {
    let path = path.as_ref();
    let file = path.display().to_string();
    debug!(%file, "load_plan: called");

    let fail = |e: PlanError| StageError::new(Stage::Load, e);

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(%file, "load_plan: file not found");
            return Err(fail(
                PlanError::new(ErrorCode::FileNotFound, "file does not exist").with_file(Some(&file)),
            ));
        }
        Err(e) => {
            debug!(%file, error = %e, "load_plan: read failed");
            return Err(fail(PlanError::new(ErrorCode::FileRead, e.to_string()).with_file(Some(&file))));
        }
    };

    let Some(format) = Format::from_path(path) else {
        debug!(%file, "load_plan: unsupported suffix");
        return Err(fail(
            PlanError::new(
                ErrorCode::UnsupportedFormat,
                "supported formats are .yaml/.yml and .json",
            )
            .with_file(Some(&file)),
        ));
    };

    let raw = parse_document(&text, format, Some(&file)).map_err(fail)?;
    info!(%file, ?format, "Loaded plan");
    Ok(raw)
}
