//! Root resolution
//!
//! One derivation shared by the validator (root consistency errors) and the
//! lint engine (reachability start points).

use std::collections::HashMap;

use tracing::debug;

/// Outcome of resolving the root set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootResolution {
    /// Resolved roots, sorted and deduplicated
    pub roots: Vec<String>,
    /// Explicit root entries naming no node: `(index in root_ids, id)`
    pub unknown: Vec<(usize, String)>,
    /// Explicit root entries naming a node that has dependencies
    pub with_dependencies: Vec<(usize, String)>,
    /// True when the roots came from `root_ids`
    pub explicit: bool,
}

impl RootResolution {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Resolve roots from optional explicit ids and `(id, has_dependencies)` pairs
///
/// Without `root_ids`, every node with empty `depends_on` is a root. With
/// `root_ids`, each entry must name a node with empty `depends_on`; the rest
/// are reported back rather than dropped silently.
pub fn resolve_roots<'a, I>(root_ids: Option<&[String]>, nodes: I) -> RootResolution
where
    I: IntoIterator<Item = (&'a str, bool)>,
{
    debug!(explicit = root_ids.is_some(), "resolve_roots: called");
    let mut resolution = RootResolution::default();

    match root_ids {
        None => {
            resolution.roots = nodes
                .into_iter()
                .filter(|(_, has_deps)| !has_deps)
                .map(|(id, _)| id.to_string())
                .collect();
        }
        Some(explicit) => {
            resolution.explicit = true;
            // First occurrence wins, matching how duplicates are reported
            let mut by_id: HashMap<&str, bool> = HashMap::new();
            for (id, has_deps) in nodes {
                by_id.entry(id).or_insert(has_deps);
            }
            for (k, rid) in explicit.iter().enumerate() {
                match by_id.get(rid.as_str()) {
                    None => {
                        debug!(%rid, "resolve_roots: unknown root");
                        resolution.unknown.push((k, rid.clone()));
                    }
                    Some(true) => {
                        debug!(%rid, "resolve_roots: root has dependencies");
                        resolution.with_dependencies.push((k, rid.clone()));
                    }
                    Some(false) => resolution.roots.push(rid.clone()),
                }
            }
        }
    }

    resolution.roots.sort();
    resolution.roots.dedup();
    debug!(count = resolution.roots.len(), "resolve_roots: resolved");
    resolution
}
