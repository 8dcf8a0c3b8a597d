use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::wire::{hash_to_hex, Hash256};

/// A precomputed commitment to the UTXO accumulator at a specific height.
/// Compact-state nodes verify contiguous block ranges against these instead
/// of replaying the whole chain serially.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UtreexoRootHint {
    pub height: i32,
    pub roots: Vec<Hash256>,
    pub num_leaves: u64,
}

/// A handle on the accumulator forest as of some height. The chain engine
/// mutates it block by block through `process_header_ublock`; the manager
/// only seeds it from a root hint and compares roots at range boundaries.
#[derive(Clone, Debug, Default)]
pub struct UtreexoViewpoint {
    roots: Vec<Hash256>,
    num_leaves: u64,
}

impl UtreexoViewpoint {
    /// Build a fresh viewpoint seeded from a root hint, or an empty forest
    /// when verifying from genesis.
    pub fn from_root_hint(hint: Option<&UtreexoRootHint>) -> Result<Self> {
        match hint {
            None => Ok(Self::default()),
            Some(hint) => {
                if hint.roots.is_empty() && hint.num_leaves != 0 {
                    anyhow::bail!(
                        "root hint at height {} has {} leaves but no roots",
                        hint.height,
                        hint.num_leaves
                    );
                }
                Ok(Self {
                    roots: hint.roots.clone(),
                    num_leaves: hint.num_leaves,
                })
            }
        }
    }

    pub fn roots(&self) -> &[Hash256] {
        &self.roots
    }

    pub fn num_leaves(&self) -> u64 {
        self.num_leaves
    }

    /// Replace the forest summary. Called by the chain engine after it has
    /// ingested a ublock's proof into the accumulator.
    pub fn update(&mut self, roots: Vec<Hash256>, num_leaves: u64) {
        self.roots = roots;
        self.num_leaves = num_leaves;
    }

    /// Compare the viewpoint's roots against the passed-in roots.
    pub fn equal(&self, comp_roots: &[Hash256]) -> bool {
        if self.roots.len() != comp_roots.len() {
            tracing::debug!(
                "root count mismatch: have {}, compared against {}",
                self.roots.len(),
                comp_roots.len()
            );
            return false;
        }
        for (have, comp) in self.roots.iter().zip(comp_roots.iter()) {
            if have != comp {
                tracing::debug!(
                    "root mismatch: have {}, compared against {}",
                    hash_to_hex(have),
                    hash_to_hex(comp)
                );
                return false;
            }
        }
        true
    }
}

/// Return the root hint that precedes `height`: the hint with the greatest
/// height strictly below it, or None when `height` falls inside the very
/// first range.
pub fn find_previous_root_hint(
    height: i32,
    hints: &[UtreexoRootHint],
) -> Option<UtreexoRootHint> {
    hints
        .iter()
        .filter(|hint| hint.height < height)
        .max_by_key(|hint| hint.height)
        .cloned()
}
