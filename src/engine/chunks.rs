//! Ordered reassembly of chunked payloads.
//!
//! Fragments for one target may arrive in any order; they are stored by
//! `chunk_index` and concatenated in index order only when the target's
//! completion signal arrives. Reading an accumulator consumes it.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::protocol::ChunkTarget;

/// A fully reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChunk {
    pub encoding: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
struct Accumulator {
    encoding: Option<String>,
    fragments: BTreeMap<u64, String>,
}

/// Accumulators keyed by [`ChunkTarget`].
#[derive(Debug, Default)]
pub struct ChunkStore {
    buckets: HashMap<ChunkTarget, Accumulator>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one fragment. A missing `chunk_index` appends after the highest
    /// index seen so far; a repeated index appends to that index's fragment.
    pub fn apply_delta(
        &mut self,
        target: &ChunkTarget,
        encoding: Option<&str>,
        chunk_index: Option<u64>,
        data: &str,
    ) {
        let bucket = self.buckets.entry(target.clone()).or_default();
        if bucket.encoding.is_none() {
            bucket.encoding = encoding.map(str::to_string);
        }
        let index = chunk_index.unwrap_or_else(|| {
            bucket
                .fragments
                .keys()
                .next_back()
                .map(|last| last + 1)
                .unwrap_or(0)
        });
        bucket.fragments.entry(index).or_default().push_str(data);
    }

    /// Consume the accumulator for `target`, concatenating fragments in
    /// index order. `None` means nothing was pending: a late or duplicate
    /// completion, which is a no-op.
    pub fn take(&mut self, target: &ChunkTarget) -> Option<CompletedChunk> {
        let Some(bucket) = self.buckets.remove(target) else {
            debug!(
                "chunk.done with no pending accumulator for {}/{}/{}",
                target.entity_kind, target.entity_id, target.field
            );
            return None;
        };
        Some(CompletedChunk {
            encoding: bucket.encoding,
            data: bucket.fragments.into_values().collect(),
        })
    }

    /// Number of targets with pending fragments.
    pub fn pending(&self) -> usize {
        self.buckets.len()
    }
}
