//! Canonical identity resolution for tool calls.
//!
//! A backend may refer to one logical tool call by several transient ids: an
//! item id (its position in the output stream) and later a stable tool-call
//! id, in either order. All observed ids collapse onto one canonical id via
//! a union-find with eager point-to-root compression, so lookups stay
//! amortized-constant and transitive aliases can never be missed.

use std::collections::HashMap;

/// Union-find over observed identifiers.
///
/// Invariant: following `parent` links always terminates at a root (no
/// self-loops are stored, no cycles can be formed).
#[derive(Debug, Default)]
pub struct IdentityMap {
    parent: HashMap<String, String>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current canonical id for `id` (itself if never aliased), compressing
    /// the walked chain so every visited id points straight at the root.
    pub fn canonicalize(&mut self, id: &str) -> String {
        let mut root = id.to_string();
        while let Some(next) = self.parent.get(&root) {
            root = next.clone();
        }
        let mut cur = id.to_string();
        while let Some(next) = self.parent.get(&cur).cloned() {
            if next == root {
                break;
            }
            self.parent.insert(cur, root.clone());
            cur = next;
        }
        root
    }

    /// Read-only resolution, for `&self` accessors. Follows the chain
    /// without compressing.
    pub fn resolve(&self, id: &str) -> String {
        let mut root = id;
        while let Some(next) = self.parent.get(root) {
            root = next;
        }
        root.to_string()
    }

    /// Declare that `alias` and `canonical` name the same tool call.
    ///
    /// Returns `Some((winner, loser))` when two previously distinct roots
    /// were joined: `winner` is the root of `canonical` and the caller must
    /// move all per-id state from `loser` onto it. Returns `None` when the
    /// pair already resolved to one root (binding is idempotent).
    pub fn bind_alias(&mut self, alias: &str, canonical: &str) -> Option<(String, String)> {
        let alias_root = self.canonicalize(alias);
        let winner = self.canonicalize(canonical);
        if alias_root == winner {
            return None;
        }
        self.parent.insert(alias_root.clone(), winner.clone());
        Some((winner, alias_root))
    }
}
