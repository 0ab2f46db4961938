//! Plan error taxonomy
//!
//! Every failure the engine can report is a [`PlanError`]: a stable code, a
//! human message and an optional file/path locator. Errors are values; stages
//! return the full set they found rather than the first one.

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

/// Stable error codes
///
/// `E_*` codes are structural or option errors, `L_*` codes are lint findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    // Load
    FileNotFound,
    FileRead,
    UnsupportedFormat,
    YamlParse,
    JsonParse,
    InvalidTopLevel,

    // Validate
    RequiredField,
    InvalidType,
    InvalidEnum,
    DuplicateId,
    UnknownDependency,
    NoRoots,
    UnknownRoot,
    RootHasDependencies,

    // Lint
    LintDuplicateId,
    EmptyDefinitionOfDone,
    TaskMissingOwner,
    UnreachableNode,
    CycleDetected,

    // Expand
    ExpandUnknownRoot,
    ExpandUnsupportedRootType,
    ExpandNoOutcomeRoots,
    ExpandUnknownTemplate,
    ExpandUnknownMode,
    TemplateFileNotFound,
    TemplateFileInvalid,

    // Patch / repair
    PatchInvalid,
    PatchUnknownNode,
    AiExpandNoApiKey,
    AiExpandUnknownTemplate,
    AiExpandNoChanges,
    AiExpandNoCandidates,
    AiExpandExhausted,
}

impl ErrorCode {
    /// The stable taxonomy string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileNotFound => "E_FILE_NOT_FOUND",
            Self::FileRead => "E_FILE_READ",
            Self::UnsupportedFormat => "E_UNSUPPORTED_FORMAT",
            Self::YamlParse => "E_YAML_PARSE",
            Self::JsonParse => "E_JSON_PARSE",
            Self::InvalidTopLevel => "E_INVALID_TOP_LEVEL",
            Self::RequiredField => "E_REQUIRED_FIELD",
            Self::InvalidType => "E_INVALID_TYPE",
            Self::InvalidEnum => "E_INVALID_ENUM",
            Self::DuplicateId => "E_DUPLICATE_ID",
            Self::UnknownDependency => "E_UNKNOWN_DEPENDENCY",
            Self::NoRoots => "E_NO_ROOTS",
            Self::UnknownRoot => "E_UNKNOWN_ROOT",
            Self::RootHasDependencies => "E_ROOT_HAS_DEPENDENCIES",
            Self::LintDuplicateId => "L_DUPLICATE_ID",
            Self::EmptyDefinitionOfDone => "L_EMPTY_DEFINITION_OF_DONE",
            Self::TaskMissingOwner => "L_TASK_MISSING_OWNER",
            Self::UnreachableNode => "L_UNREACHABLE_NODE",
            Self::CycleDetected => "L_CYCLE_DETECTED",
            Self::ExpandUnknownRoot => "E_EXPAND_UNKNOWN_ROOT",
            Self::ExpandUnsupportedRootType => "E_EXPAND_UNSUPPORTED_ROOT_TYPE",
            Self::ExpandNoOutcomeRoots => "E_EXPAND_NO_OUTCOME_ROOTS",
            Self::ExpandUnknownTemplate => "E_EXPAND_UNKNOWN_TEMPLATE",
            Self::ExpandUnknownMode => "E_EXPAND_UNKNOWN_MODE",
            Self::TemplateFileNotFound => "E_TEMPLATE_FILE_NOT_FOUND",
            Self::TemplateFileInvalid => "E_TEMPLATE_FILE_INVALID",
            Self::PatchInvalid => "E_PATCH_INVALID",
            Self::PatchUnknownNode => "E_PATCH_UNKNOWN_NODE",
            Self::AiExpandNoApiKey => "E_AI_EXPAND_NO_API_KEY",
            Self::AiExpandUnknownTemplate => "E_AI_EXPAND_UNKNOWN_TEMPLATE",
            Self::AiExpandNoChanges => "E_AI_EXPAND_NO_CHANGES",
            Self::AiExpandNoCandidates => "E_AI_EXPAND_NO_CANDIDATES",
            Self::AiExpandExhausted => "E_AI_EXPAND_EXHAUSTED",
        }
    }

    /// Lint findings are prefixed `L_`
    pub fn is_lint(&self) -> bool {
        self.as_str().starts_with("L_")
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// A single structured error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanError {
    pub code: ErrorCode,
    pub message: String,
    pub file: Option<String>,
    pub path: Option<String>,
}

impl PlanError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file: None,
            path: None,
        }
    }

    /// Attach a source file
    pub fn with_file(mut self, file: Option<&str>) -> Self {
        self.file = file.map(str::to_string);
        self
    }

    /// Attach a logical locator such as `nodes[3].depends_on[1]`
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn sort_key(&self) -> (&str, &str, &'static str) {
        (
            self.file.as_deref().unwrap_or(""),
            self.path.as_deref().unwrap_or(""),
            self.code.as_str(),
        )
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = match (&self.file, &self.path) {
            (Some(file), Some(path)) => format!("{}:{}", file, path),
            (Some(file), None) => file.clone(),
            (None, Some(path)) => path.clone(),
            (None, None) => "<plan>".to_string(),
        };
        write!(f, "{}: {}: {}", location, self.code, self.message)
    }
}

impl std::error::Error for PlanError {}

/// Sort errors by `(file, path, code)` for stable, diffable output
pub fn sort_errors(errors: &mut [PlanError]) {
    errors.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// A non-empty, sorted set of errors returned by a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanErrors(Vec<PlanError>);

impl PlanErrors {
    /// Build from a collection; returns `None` when there is nothing to report
    pub fn from_vec(mut errors: Vec<PlanError>) -> Option<Self> {
        debug!(count = errors.len(), "PlanErrors::from_vec: called");
        if errors.is_empty() {
            return None;
        }
        sort_errors(&mut errors);
        Some(Self(errors))
    }

    pub fn single(error: PlanError) -> Self {
        Self(vec![error])
    }

    pub fn as_slice(&self) -> &[PlanError] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PlanError> {
        self.0.iter()
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        self.0.iter().map(|e| e.code).collect()
    }

    pub fn contains(&self, code: ErrorCode) -> bool {
        self.0.iter().any(|e| e.code == code)
    }

    pub fn into_vec(self) -> Vec<PlanError> {
        self.0
    }
}

impl fmt::Display for PlanErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for PlanErrors {}

impl IntoIterator for PlanErrors {
    type Item = PlanError;
    type IntoIter = std::vec::IntoIter<PlanError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a PlanErrors {
    type Item = &'a PlanError;
    type IntoIter = std::slice::Iter<'a, PlanError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<PlanError> for PlanErrors {
    fn from(error: PlanError) -> Self {
        Self::single(error)
    }
}

/// The pipeline stage an error set came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Validate,
    Lint,
    Expand,
    Patch,
    Repair,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Validate => write!(f, "validate"),
            Self::Lint => write!(f, "lint"),
            Self::Expand => write!(f, "expand"),
            Self::Patch => write!(f, "patch"),
            Self::Repair => write!(f, "repair"),
        }
    }
}

/// Errors tagged with the stage that produced them
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed:\n{errors}")]
pub struct StageError {
    pub stage: Stage,
    pub errors: PlanErrors,
}

impl StageError {
    pub fn new(stage: Stage, errors: impl Into<PlanErrors>) -> Self {
        Self {
            stage,
            errors: errors.into(),
        }
    }

    /// Attribute errors that carry no file to `file`
    pub fn in_file(self, file: Option<&str>) -> Self {
        let mut errors = self.errors.0;
        for e in errors.iter_mut().filter(|e| e.file.is_none()) {
            e.file = file.map(str::to_string);
        }
        sort_errors(&mut errors);
        Self {
            stage: self.stage,
            errors: PlanErrors(errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_file_and_path() {
        let e = PlanError::new(ErrorCode::UnknownDependency, "depends_on references unknown id: X")
            .with_file(Some("plan.yaml"))
            .at("nodes[1].depends_on[0]");
        assert_eq!(
            e.to_string(),
            "plan.yaml:nodes[1].depends_on[0]: E_UNKNOWN_DEPENDENCY: depends_on references unknown id: X"
        );
    }

    #[test]
    fn test_display_path_only() {
        let e = PlanError::new(ErrorCode::NoRoots, "no root nodes found").at("root_ids");
        assert_eq!(e.to_string(), "root_ids: E_NO_ROOTS: no root nodes found");
    }

    #[test]
    fn test_display_without_locator() {
        let e = PlanError::new(ErrorCode::AiExpandNoChanges, "nothing applied");
        assert_eq!(e.to_string(), "<plan>: E_AI_EXPAND_NO_CHANGES: nothing applied");
    }

    #[test]
    fn test_errors_sorted_by_file_path_code() {
        let errors = vec![
            PlanError::new(ErrorCode::UnknownRoot, "b").at("root_ids[0]"),
            PlanError::new(ErrorCode::RequiredField, "a").at("nodes[0].id"),
            PlanError::new(ErrorCode::NoRoots, "c").at("root_ids"),
        ];
        let set = PlanErrors::from_vec(errors).unwrap();
        let paths: Vec<_> = set.iter().map(|e| e.path.clone().unwrap()).collect();
        assert_eq!(paths, vec!["nodes[0].id", "root_ids", "root_ids[0]"]);
    }

    #[test]
    fn test_in_file_keeps_existing_file() {
        let err = StageError::new(
            Stage::Expand,
            PlanErrors::from_vec(vec![
                PlanError::new(ErrorCode::TemplateFileInvalid, "bad").at("template_file"),
                PlanError::new(ErrorCode::YamlParse, "bad yaml").with_file(Some("t.yaml")),
            ])
            .unwrap(),
        )
        .in_file(Some("plan.yaml"));
        let files: Vec<Option<&str>> = err.errors.iter().map(|e| e.file.as_deref()).collect();
        assert_eq!(files, vec![Some("plan.yaml"), Some("t.yaml")]);
    }

    #[test]
    fn test_empty_error_set_is_none() {
        assert!(PlanErrors::from_vec(vec![]).is_none());
    }

    #[test]
    fn test_code_serializes_as_taxonomy_string() {
        let e = PlanError::new(ErrorCode::CycleDetected, "cycle").at("nodes[0].depends_on");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["code"], "L_CYCLE_DETECTED");
        assert_eq!(json["path"], "nodes[0].depends_on");
        assert!(ErrorCode::CycleDetected.is_lint());
        assert!(!ErrorCode::NoRoots.is_lint());
    }
}
