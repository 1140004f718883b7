//! Index backend trait
//!
//! Retrieval code is written against [`AnnIndex`] so the exact scan and the
//! HNSW graph are interchangeable.

use crate::brute_force::BruteForceIndex;
use crate::distance::DistanceMetric;
use crate::error::IndexResult;
use crate::hnsw::{HnswIndex, Neighbor};
use crate::table::NodeId;

/// Top-N similarity search over a fixed set of vectors
pub trait AnnIndex: Send + Sync {
    /// Top-`n` nodes for `query`, sorted by (score desc, NodeId asc).
    ///
    /// Returns `min(n, len())` hits for an exact backend; an approximate
    /// backend may return fewer only if parts of the graph are unreachable.
    fn search(&self, query: &[f32], n: usize) -> IndexResult<Vec<Neighbor>>;

    /// Number of indexed vectors
    fn len(&self) -> usize;

    /// Check if empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension
    fn dimension(&self) -> usize;

    /// Similarity metric
    fn metric(&self) -> DistanceMetric;

    /// Indexed vector of a node
    fn vector(&self, node: NodeId) -> Option<&[f32]>;
}

impl AnnIndex for HnswIndex {
    fn search(&self, query: &[f32], n: usize) -> IndexResult<Vec<Neighbor>> {
        HnswIndex::search(self, query, n)
    }

    fn len(&self) -> usize {
        HnswIndex::len(self)
    }

    fn dimension(&self) -> usize {
        HnswIndex::dimension(self)
    }

    fn metric(&self) -> DistanceMetric {
        HnswIndex::metric(self)
    }

    fn vector(&self, node: NodeId) -> Option<&[f32]> {
        HnswIndex::vector(self, node)
    }
}

impl AnnIndex for BruteForceIndex {
    fn search(&self, query: &[f32], n: usize) -> IndexResult<Vec<Neighbor>> {
        BruteForceIndex::search(self, query, n)
    }

    fn len(&self) -> usize {
        self.table().len()
    }

    fn dimension(&self) -> usize {
        self.table().dimension()
    }

    fn metric(&self) -> DistanceMetric {
        BruteForceIndex::metric(self)
    }

    fn vector(&self, node: NodeId) -> Option<&[f32]> {
        self.table().get(node)
    }
}
