//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// Planner - plan graph validation, lint and expansion
#[derive(Parser)]
#[command(
    name = "pl",
    about = "Validate, lint, expand and AI-patch delivery plan graphs",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check a plan's structure and print a summary
    Validate {
        /// Plan file (.yaml, .yml or .json)
        path: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate, then run graph and quality lint rules
    Lint {
        /// Plan file (.yaml, .yml or .json)
        path: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List expansion templates and their steps
    Templates {
        /// YAML file adding or overriding templates
        #[arg(long = "template-file")]
        template_file: Option<PathBuf>,
    },

    /// Expand outcome roots into deliverables and tasks
    Expand {
        /// Plan file (.yaml, .yml or .json)
        path: PathBuf,

        /// Where to write the expanded plan (YAML)
        #[arg(short, long)]
        out: PathBuf,

        /// Expand only this root
        #[arg(short, long)]
        root: Option<String>,

        /// Template name (default from config)
        #[arg(short, long)]
        template: Option<String>,

        /// YAML file adding or overriding templates
        #[arg(long = "template-file")]
        template_file: Option<PathBuf>,

        /// Expansion mode (append, merge, reconcile)
        #[arg(short, long, default_value = "append")]
        mode: String,

        /// Let reconcile claim same-titled tasks under other deliverables
        #[arg(long = "reconcile-loose")]
        reconcile_loose: bool,
    },

    /// Expand with LLM-proposed patches, gated by validate and lint
    AiExpand {
        /// Plan file (.yaml, .yml or .json)
        path: PathBuf,

        /// Where to write the resulting plan (YAML)
        #[arg(short, long)]
        out: PathBuf,

        /// Model identifier (default from config)
        #[arg(long)]
        model: Option<String>,

        /// Concurrent suggestion requests per round
        #[arg(short, long)]
        workers: Option<usize>,

        /// Maximum repair rounds
        #[arg(long = "max-fix-rounds")]
        max_fix_rounds: Option<usize>,

        /// Template whose steps guide the expansion
        #[arg(short, long)]
        template: Option<String>,

        /// YAML file adding or overriding templates
        #[arg(long = "template-file")]
        template_file: Option<PathBuf>,

        /// API base URL
        #[arg(long = "base-url")]
        base_url: Option<String>,

        /// Minimum additions plus updates for a proposal to count
        #[arg(long = "min-changes")]
        min_changes: Option<usize>,
    },
}

impl Command {
    /// Name used in reports
    pub fn name(&self) -> &'static str {
        match self {
            Command::Validate { .. } => "validate",
            Command::Lint { .. } => "lint",
            Command::Templates { .. } => "templates",
            Command::Expand { .. } => "expand",
            Command::AiExpand { .. } => "ai-expand",
        }
    }
}

/// Output format for validate/lint reports
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => {
                debug!("OutputFormat::from_str: matched Text");
                Ok(Self::Text)
            }
            "json" => {
                debug!("OutputFormat::from_str: matched Json");
                Ok(Self::Json)
            }
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Path of the log file written by `pl`
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("planner")
        .join("logs")
        .join("planner.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("plain".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_parse_expand() {
        let cli = Cli::try_parse_from([
            "pl",
            "expand",
            "plan.yaml",
            "--out",
            "out.yaml",
            "--mode",
            "reconcile",
            "--reconcile-loose",
            "-l",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Expand {
                mode,
                reconcile_loose,
                template,
                ..
            } => {
                assert_eq!(mode, "reconcile");
                assert!(reconcile_loose);
                assert!(template.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_ai_expand() {
        let cli = Cli::try_parse_from([
            "pl",
            "ai-expand",
            "plan.yaml",
            "--out",
            "out.yaml",
            "--workers",
            "5",
            "--max-fix-rounds",
            "0",
        ])
        .unwrap();
        assert_eq!(cli.command.name(), "ai-expand");
        match cli.command {
            Command::AiExpand {
                workers,
                max_fix_rounds,
                ..
            } => {
                assert_eq!(workers, Some(5));
                assert_eq!(max_fix_rounds, Some(0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
