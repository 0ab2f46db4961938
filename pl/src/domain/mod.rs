//! Plan data model
//!
//! Nodes, the raw and validated document states, root resolution and id
//! allocation. Everything else in the crate operates on these types.

mod document;
mod id;
mod node;
mod roots;

pub use document::{Plan, PlanSummary, RawPlan};
pub use id::{allocate_unique_id, reserve_unique_id};
pub use node::{KNOWN_FIELDS, Node, NodeKind};
pub use roots::{RootResolution, resolve_roots};
