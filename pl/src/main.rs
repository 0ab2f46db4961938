//! Planner - plan graph validation, lint and expansion
//!
//! CLI entry point. Library stages report structured errors; this binary
//! renders them and picks the exit status (load failures exit 1, every other
//! failure exits 2).

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use planner::cli::{Cli, Command, OutputFormat, get_log_path};
use planner::config::Config;
use planner::domain::RawPlan;
use planner::error::{ErrorCode, PlanError, PlanErrors, Stage, StageError};
use planner::expand::{ExpandMode, ExpandOptions, ReconcileScope, TemplateRegistry, expand, select_roots};
use planner::lint::{lint, lint_raw_duplicates};
use planner::llm::{LlmSuggestionSource, create_client};
use planner::loader::load_plan;
use planner::repair::{RepairGoal, run_repair};
use planner::validation::validate;

const SDF_VERSION: &str = "v0";

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level_str = cli_log_level.or(config_log_level);
    let level = match level_str.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // A read-only sandbox must not stop plan checks from running
    if let Err(e) = setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Validate { path, format } => {
            debug!(?path, %format, "main: matched Validate command");
            Ok(cmd_validate(&path, format))
        }
        Command::Lint { path, format } => {
            debug!(?path, %format, "main: matched Lint command");
            Ok(cmd_lint(&path, format))
        }
        Command::Templates { template_file } => {
            debug!(?template_file, "main: matched Templates command");
            let template_file = template_file.or_else(|| config.expand.template_file.clone());
            Ok(cmd_templates(template_file.as_deref()))
        }
        Command::Expand {
            path,
            out,
            root,
            template,
            template_file,
            mode,
            reconcile_loose,
        } => {
            debug!(?path, ?out, ?root, ?template, %mode, reconcile_loose, "main: matched Expand command");
            let template = template.unwrap_or_else(|| config.expand.template.clone());
            let template_file = template_file.or_else(|| config.expand.template_file.clone());
            let scope = if reconcile_loose {
                ReconcileScope::Loose
            } else {
                config.expand.scope()
            };
            cmd_expand(
                &path,
                &out,
                root,
                &template,
                template_file.as_deref(),
                &mode,
                scope,
            )
        }
        Command::AiExpand {
            path,
            out,
            model,
            workers,
            max_fix_rounds,
            template,
            template_file,
            base_url,
            min_changes,
        } => {
            debug!(?path, ?out, ?model, ?workers, ?max_fix_rounds, "main: matched AiExpand command");
            let mut config = config;
            if let Some(model) = model {
                config.llm.model = model;
            }
            if let Some(base_url) = base_url {
                config.llm.base_url = base_url;
            }
            if let Some(workers) = workers {
                config.repair.workers = workers;
            }
            if let Some(rounds) = max_fix_rounds {
                config.repair.max_fix_rounds = rounds;
            }
            if let Some(min_changes) = min_changes {
                config.repair.min_changes = min_changes;
            }
            if let Some(template) = template {
                config.repair.template = template;
            }
            let template_file = template_file.or_else(|| config.expand.template_file.clone());
            cmd_ai_expand(&config, &path, &out, template_file.as_deref()).await
        }
    }
}

/// Load failures exit 1, every later stage exits 2
fn exit_status(stage: Stage) -> u8 {
    match stage {
        Stage::Load => 1,
        _ => 2,
    }
}

fn exit_code(stage: Stage) -> ExitCode {
    ExitCode::from(exit_status(stage))
}

/// Print a stage failure, already sorted, and map it to its exit status
fn fail(err: &StageError) -> ExitCode {
    debug!(stage = %err.stage, count = err.errors.len(), "fail: called");
    for e in &err.errors {
        eprintln!("{}", e);
    }
    exit_code(err.stage)
}

fn report_item(e: &PlanError, source: &str) -> Value {
    json!({
        "code": e.code,
        "message": e.message,
        "file": e.file,
        "path": e.path,
        "severity": "error",
        "source": source,
    })
}

fn print_json(report: Map<String, Value>) {
    match serde_json::to_string_pretty(&Value::Object(report)) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to render JSON report: {}", e),
    }
}

fn report_header(command: &str, ok: bool, error_count: usize) -> Map<String, Value> {
    let mut report = Map::new();
    report.insert("tool".to_string(), json!("planner"));
    report.insert("command".to_string(), json!(command));
    report.insert("ok".to_string(), json!(ok));
    report.insert("error_count".to_string(), json!(error_count));
    report
}

fn emit_validate_report(schema_version: Option<&str>, errors: &[PlanError], source: &str, summary: Value) {
    let mut report = report_header("validate", errors.is_empty(), errors.len());
    report.insert("schema_version".to_string(), json!(schema_version));
    report.insert(
        "errors".to_string(),
        Value::Array(errors.iter().map(|e| report_item(e, source)).collect()),
    );
    report.insert("summary".to_string(), summary);
    print_json(report);
}

fn emit_lint_report(errors: &[PlanError], load_failed: bool) {
    let mut report = report_header("lint", errors.is_empty(), errors.len());
    report.insert("sdf_version".to_string(), json!(SDF_VERSION));
    let items = errors
        .iter()
        .map(|e| {
            let source = match (load_failed, e.code.is_lint()) {
                (true, _) => "load",
                (false, true) => "lint",
                (false, false) => "validate",
            };
            report_item(e, source)
        })
        .collect();
    report.insert("errors".to_string(), Value::Array(items));
    print_json(report);
}

fn cmd_validate(path: &Path, format: OutputFormat) -> ExitCode {
    debug!(?path, %format, "cmd_validate: called");
    let raw = match load_plan(path) {
        Ok(raw) => raw,
        Err(e) => {
            if format == OutputFormat::Json {
                emit_validate_report(None, e.errors.as_slice(), "load", Value::Null);
                return exit_code(e.stage);
            }
            return fail(&e);
        }
    };

    match validate(&raw) {
        Ok(plan) => {
            let summary = plan.summary();
            info!(nodes = summary.node_count, "cmd_validate: plan is valid");
            match format {
                OutputFormat::Text => println!("{}", summary),
                OutputFormat::Json => emit_validate_report(
                    Some(plan.schema_version()),
                    &[],
                    "validate",
                    serde_json::to_value(&summary).unwrap_or(Value::Null),
                ),
            }
            ExitCode::SUCCESS
        }
        Err(errors) => {
            if format == OutputFormat::Json {
                let schema_version = raw.schema_version.as_ref().and_then(Value::as_str);
                emit_validate_report(schema_version, errors.as_slice(), "validate", Value::Null);
                return exit_code(Stage::Validate);
            }
            fail(&StageError::new(Stage::Validate, errors))
        }
    }
}

/// Lint findings plus validation errors; lint runs on the raw form when validation fails
fn lint_findings(raw: &RawPlan) -> Vec<PlanError> {
    let mut findings = lint_raw_duplicates(raw);
    match validate(raw) {
        Ok(plan) => findings.extend(lint(&plan)),
        Err(errors) => findings.extend(errors),
    }
    findings
}

fn cmd_lint(path: &Path, format: OutputFormat) -> ExitCode {
    debug!(?path, %format, "cmd_lint: called");
    let raw = match load_plan(path) {
        Ok(raw) => raw,
        Err(e) => {
            if format == OutputFormat::Json {
                emit_lint_report(e.errors.as_slice(), true);
                return exit_code(e.stage);
            }
            return fail(&e);
        }
    };

    let findings = match PlanErrors::from_vec(lint_findings(&raw)) {
        Some(errors) => errors,
        None => {
            info!("cmd_lint: lint passed");
            match format {
                OutputFormat::Text => println!("SDF {}\nOK: lint passed", SDF_VERSION),
                OutputFormat::Json => emit_lint_report(&[], false),
            }
            return ExitCode::SUCCESS;
        }
    };

    match format {
        OutputFormat::Text => {
            println!("SDF {}", SDF_VERSION);
            fail(&StageError::new(Stage::Lint, findings))
        }
        OutputFormat::Json => {
            emit_lint_report(findings.as_slice(), false);
            exit_code(Stage::Lint)
        }
    }
}

fn cmd_templates(template_file: Option<&Path>) -> ExitCode {
    debug!(?template_file, "cmd_templates: called");
    let registry = match TemplateRegistry::load(template_file) {
        Ok(registry) => registry,
        Err(e) => return fail(&e),
    };

    println!("Templates:");
    for (name, steps) in registry.iter() {
        println!("- {}: {}", name.yellow(), steps.join(", "));
    }
    ExitCode::SUCCESS
}

/// Write a plan as YAML, creating parent directories
fn write_plan(out: &Path, raw: &RawPlan) -> Result<()> {
    debug!(?out, "write_plan: called");
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context(format!("Failed to create directory {}", parent.display()))?;
    }
    let yaml = raw.to_yaml().context("Failed to render plan as YAML")?;
    fs::write(out, yaml).context(format!("Failed to write {}", out.display()))?;
    info!("Wrote plan to {}", out.display());
    Ok(())
}

fn cmd_expand(
    path: &Path,
    out: &Path,
    root: Option<String>,
    template: &str,
    template_file: Option<&Path>,
    mode: &str,
    scope: ReconcileScope,
) -> Result<ExitCode> {
    debug!(?path, ?out, ?root, %template, %mode, ?scope, "cmd_expand: called");
    let raw = match load_plan(path) {
        Ok(raw) => raw,
        Err(e) => return Ok(fail(&e)),
    };
    let file = raw.file();

    let plan = match validate(&raw) {
        Ok(plan) => plan,
        Err(errors) => return Ok(fail(&StageError::new(Stage::Validate, errors))),
    };

    if let Err(e) = select_roots(&plan, root.as_deref()) {
        return Ok(fail(&StageError::new(Stage::Expand, e.with_file(file))));
    }

    let registry = match TemplateRegistry::load(template_file) {
        Ok(registry) => registry,
        Err(e) => return Ok(fail(&e.in_file(file))),
    };
    if let Err(e) = registry.resolve(template, ErrorCode::ExpandUnknownTemplate) {
        return Ok(fail(&StageError::new(Stage::Expand, e.with_file(file))));
    }

    let mode: ExpandMode = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => return Ok(fail(&StageError::new(Stage::Expand, e.with_file(file)))),
    };

    let options = ExpandOptions {
        root,
        template: template.to_string(),
        mode,
        scope,
    };
    let report = match expand(&plan, &registry, &options) {
        Ok(report) => report,
        Err(e) => return Ok(fail(&e)),
    };
    info!(
        added = report.added.len(),
        reused = report.reused.len(),
        repaired = report.repaired.len(),
        "cmd_expand: expansion passed gates"
    );

    write_plan(out, &report.plan.to_raw())?;
    println!("OK: wrote expanded plan to {}", out.display());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_ai_expand(config: &Config, path: &Path, out: &Path, template_file: Option<&Path>) -> Result<ExitCode> {
    debug!(?path, ?out, model = %config.llm.model, "cmd_ai_expand: called");
    let raw = match load_plan(path) {
        Ok(raw) => raw,
        Err(e) => return Ok(fail(&e)),
    };
    let file = raw.file().map(str::to_string);

    let api_key = match config.llm.api_key() {
        Ok(key) => key,
        Err(e) => return Ok(fail(&StageError::new(Stage::Repair, e))),
    };

    let registry = match TemplateRegistry::load(template_file) {
        Ok(registry) => registry,
        Err(e) => return Ok(fail(&e.in_file(file.as_deref()))),
    };
    let template = config.repair.template.as_str();
    let steps = match registry.resolve(template, ErrorCode::AiExpandUnknownTemplate) {
        Ok(steps) => steps,
        Err(e) => return Ok(fail(&StageError::new(Stage::Repair, e.with_file(file.as_deref())))),
    };

    let client = create_client(&config.llm, api_key).context("Failed to create LLM client")?;
    let source = Arc::new(LlmSuggestionSource::new(client, config.llm.max_tokens));
    let goal = RepairGoal::expand_with_template(template, steps);
    let repair_config = config.repair.to_repair_config();

    let outcome = run_repair(source, raw, &goal, &repair_config).await;
    info!(
        rounds = outcome.rounds,
        applied = outcome.applied.len(),
        done = outcome.is_done(),
        "cmd_ai_expand: repair loop finished"
    );

    let failure = outcome.errors();
    if outcome.applied.is_empty() && !outcome.is_done() {
        return Ok(failure.map_or(ExitCode::from(2), |e| fail(&e)));
    }

    write_plan(out, &outcome.document)?;
    println!(
        "OK: wrote {} (rounds={}, applied={})",
        out.display(),
        outcome.rounds,
        outcome.applied.len()
    );

    match failure {
        None => Ok(ExitCode::SUCCESS),
        Some(e) => {
            eprintln!("{}", "WARN: still failing gates:".yellow());
            Ok(fail(&e))
        }
    }
}
