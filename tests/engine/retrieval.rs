//! Candidate retrieval quality
//!
//! The serving path asks the HNSW index for a candidate pool; against an
//! exact scan of the same vectors it must find nearly all true top results.

use crate::common::*;
use latent::index::{BruteForceIndex, NodeId};
use latent::retrieve_candidates;
use std::collections::BTreeSet;

#[test]
fn ann_candidates_recall_exact_top_50() {
    let dimension = 8;
    let rows = random_rows(1_000, dimension, 2026);
    let table = VectorTable::from_rows(dimension, &rows).unwrap();
    let exact = BruteForceIndex::new(table.clone(), DistanceMetric::InnerProduct);
    let config = HnswConfig::new(16, 200, 200);
    let ann = HnswIndex::build(table, DistanceMetric::InnerProduct, config).unwrap();

    let queries = random_rows(25, dimension, 7);
    let k = 50;
    let mut recall = 0.0;
    for query in &queries {
        let truth: BTreeSet<NodeId> = exact
            .search(query, k)
            .unwrap()
            .iter()
            .map(|n| n.node)
            .collect();
        let found: BTreeSet<NodeId> = retrieve_candidates(&ann, query, k)
            .unwrap()
            .iter()
            .map(|n| n.node)
            .collect();
        recall += truth.intersection(&found).count() as f64 / k as f64;
    }
    recall /= queries.len() as f64;

    assert!(recall >= 0.9, "recall@{} = {:.3}", k, recall);
}

#[test]
fn pool_covering_the_catalogue_is_exact() {
    let dimension = 4;
    let rows = random_rows(120, dimension, 11);
    let table = VectorTable::from_rows(dimension, &rows).unwrap();
    let exact = BruteForceIndex::new(table.clone(), DistanceMetric::InnerProduct);
    let ann = HnswIndex::build(table, DistanceMetric::InnerProduct, HnswConfig::default()).unwrap();

    let query = vec![0.3, -0.2, 0.9, 0.1];
    let from_pool = retrieve_candidates(&ann, &query, 120).unwrap();
    let truth = exact.search(&query, 120).unwrap();
    assert_eq!(from_pool.len(), 120);
    let pool_nodes: Vec<NodeId> = from_pool.iter().map(|n| n.node).collect();
    let truth_nodes: Vec<NodeId> = truth.iter().map(|n| n.node).collect();
    assert_eq!(pool_nodes, truth_nodes);
}
