//! Exact top-N scan
//!
//! O(n) per query. Used as ground truth for recall measurements and for
//! corpora small enough that the graph buys nothing.

use crate::distance::{compute_similarity, DistanceMetric};
use crate::error::{IndexError, IndexResult};
use crate::hnsw::Neighbor;
use crate::table::VectorTable;

/// Exact search over a vector table
#[derive(Debug, Clone)]
pub struct BruteForceIndex {
    table: VectorTable,
    metric: DistanceMetric,
}

impl BruteForceIndex {
    /// Wrap a table
    pub fn new(table: VectorTable, metric: DistanceMetric) -> Self {
        Self { table, metric }
    }

    /// The underlying table
    pub fn table(&self) -> &VectorTable {
        &self.table
    }

    /// Similarity metric
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Exact top-`n`, sorted by (score desc, NodeId asc)
    pub fn search(&self, query: &[f32], n: usize) -> IndexResult<Vec<Neighbor>> {
        if query.len() != self.table.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.table.dimension(),
                got: query.len(),
            });
        }
        if n == 0 {
            return Ok(Vec::new());
        }

        // table.iter() yields rows in NodeId order
        let mut results: Vec<Neighbor> = self
            .table
            .iter()
            .map(|(node, row)| Neighbor {
                node,
                score: compute_similarity(query, row, self.metric),
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node.cmp(&b.node)));
        results.truncate(n);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::NodeId;

    fn index() -> BruteForceIndex {
        let table = VectorTable::from_rows(
            2,
            vec![[1.0, 0.0], [0.0, 1.0], [2.0, 0.0], [1.0, 0.0]],
        )
        .unwrap();
        BruteForceIndex::new(table, DistanceMetric::InnerProduct)
    }

    #[test]
    fn test_exact_order_with_ties() {
        let results = index().search(&[1.0, 0.0], 4).unwrap();
        let ids: Vec<u32> = results.iter().map(|r| r.node.as_u32()).collect();
        // node 2 scores 2.0; nodes 0 and 3 tie at 1.0; node 1 scores 0.0
        assert_eq!(ids, vec![2, 0, 3, 1]);
    }

    #[test]
    fn test_truncates_to_n() {
        let results = index().search(&[0.0, 1.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].node, NodeId::new(1));
    }

    #[test]
    fn test_n_larger_than_table() {
        assert_eq!(index().search(&[1.0, 1.0], 100).unwrap().len(), 4);
    }

    #[test]
    fn test_dimension_mismatch() {
        assert!(index().search(&[1.0], 1).is_err());
    }
}
