//! Node ID allocation
//!
//! Generated and patched nodes must never collide with existing IDs. A taken
//! ID gets a suffix: `-A` … `-Z`, then `-AA` … `-ZZ`, then a numeric counter
//! starting at `-27`. The result depends only on the proposal and the set of
//! taken IDs, so the same inputs always allocate the same ID.

use std::collections::HashSet;

use tracing::debug;

/// Letter suffixes in allocation order: A..Z then AA..ZZ
fn letter_suffixes() -> impl Iterator<Item = String> {
    let letters = || (b'A'..=b'Z').map(char::from);
    let single = letters().map(String::from);
    let double = letters().flat_map(move |a| letters().map(move |b| format!("{}{}", a, b)));
    single.chain(double)
}

/// Allocate `proposed` or the first free suffixed variant of it
pub fn allocate_unique_id(existing: &HashSet<String>, proposed: &str) -> String {
    debug!(%proposed, existing = existing.len(), "allocate_unique_id: called");
    if !existing.contains(proposed) {
        debug!(%proposed, "allocate_unique_id: proposal is free");
        return proposed.to_string();
    }

    for suffix in letter_suffixes() {
        let candidate = format!("{}-{}", proposed, suffix);
        if !existing.contains(&candidate) {
            debug!(%proposed, %candidate, "allocate_unique_id: allocated letter suffix");
            return candidate;
        }
    }

    // The existing set is finite, so this terminates.
    let mut n: u64 = 27;
    loop {
        let candidate = format!("{}-{}", proposed, n);
        if !existing.contains(&candidate) {
            debug!(%proposed, %candidate, "allocate_unique_id: allocated numeric suffix");
            return candidate;
        }
        n += 1;
    }
}

/// Allocate and reserve in one step
pub fn reserve_unique_id(existing: &mut HashSet<String>, proposed: &str) -> String {
    let id = allocate_unique_id(existing, proposed);
    existing.insert(id.clone());
    id
}
