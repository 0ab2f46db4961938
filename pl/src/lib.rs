//! Planner - delivery plan graph engine
//!
//! A plan is a directed acyclic graph of typed nodes (outcome, deliverable,
//! milestone, task, check). The crate loads plan documents, validates their
//! structure, lints graph quality, expands outcomes into work from templates,
//! and runs a bounded, gated loop that applies patches proposed by an LLM.
//!
//! # Core Concepts
//!
//! - **Errors are data**: every stage reports the complete set of structured
//!   errors, never just the first
//! - **Copy-on-write generations**: expansion and patching return new documents
//! - **Gates**: automated output is accepted only when it validates and lints clean
//!
//! # Modules
//!
//! - [`loader`] - Read YAML/JSON plan files into raw documents
//! - [`validation`] - Structural checks, raw document to validated plan
//! - [`lint`] - Graph and quality rules
//! - [`gate`] - Validate-then-lint acceptance check
//! - [`expand`] - Deterministic template expansion
//! - [`patch`] - Patch format and additive application
//! - [`repair`] - Gated propose/apply loop
//! - [`llm`] - LLM client trait, OpenAI implementation, suggestion source
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod expand;
pub mod gate;
pub mod lint;
pub mod llm;
pub mod loader;
pub mod patch;
pub mod repair;
pub mod validation;

pub use domain::{Node, NodeKind, Plan, RawPlan};
pub use error::{ErrorCode, PlanError, PlanErrors, Stage, StageError};
