//! HNSW (Hierarchical Navigable Small World) index
//!
//! Approximate maximum-similarity search over a fixed set of item vectors.
//! The graph is built once from a [`VectorTable`] and never mutated
//! afterwards; a retrain produces a new index that replaces the old one.
//!
//! ## Algorithm
//!
//! - Layer 0 contains all nodes with up to 2*M connections each
//! - Higher layers contain a subset of nodes with up to M connections each
//! - Search starts from the top layer and greedily descends to layer 0
//! - At layer 0, a beam search keeps the `ef` best candidates
//!
//! ## Determinism
//!
//! - Level assignment hashes `(seed, insertion counter)` with SplitMix64
//! - Nodes are inserted in `NodeId` order
//! - Neighbor lists are kept sorted by `NodeId`
//! - Tie-breaking: (score desc, NodeId asc)
//!
//! Two builds over the same table and config produce the same graph, and a
//! query against one index always returns the same answer.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::distance::{compute_similarity, DistanceMetric};
use crate::error::{IndexError, IndexResult};
use crate::table::{NodeId, VectorTable};

/// HNSW configuration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Max connections per layer (default: 16)
    pub m: usize,
    /// Build-time beam width (default: 64)
    pub ef_construction: usize,
    /// Search-time beam width (default: 64)
    pub ef_search: usize,
    /// Seed for level assignment (default: 42)
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
            ef_search: 64,
            seed: 42,
        }
    }
}

impl HnswConfig {
    /// Config with the given graph parameters and the default seed
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            m,
            ef_construction,
            ef_search,
            ..Self::default()
        }
    }

    /// Replace the level-assignment seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject parameters the graph cannot be built with
    pub fn validate(&self) -> IndexResult<()> {
        if self.m < 2 {
            return Err(IndexError::InvalidConfig(format!(
                "m must be at least 2, got {}",
                self.m
            )));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(IndexError::InvalidConfig(
                "ef_construction and ef_search must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Level multiplier: 1/ln(m)
    fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Max connections for layer 0 (2*M)
    fn max_connections_layer0(&self) -> usize {
        self.m * 2
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.max_connections_layer0()
        } else {
            self.m
        }
    }
}

/// One search hit: a table row and its approximate similarity to the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Row in the index's vector table
    pub node: NodeId,
    /// Similarity under the index metric (higher = closer)
    pub score: f32,
}

/// Scored candidate for search (max-heap by score, tie-break by NodeId asc)
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoredId {
    score: f32,
    id: NodeId,
}

impl Eq for ScoredId {}

impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap<ScoredId> pops the nearest candidate,
        // BinaryHeap<Reverse<ScoredId>> pops the worst result.
        self.score
            .total_cmp(&other.score)
            // lower NodeId = Greater
            .then_with(|| other.id.cmp(&self.id))
    }
}

fn by_score_desc(a: &ScoredId, b: &ScoredId) -> Ordering {
    b.cmp(a)
}

/// A node in the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HnswNode {
    /// neighbors[layer], sorted ascending by NodeId
    pub(crate) neighbors: Vec<Vec<NodeId>>,
}

impl HnswNode {
    fn new(level: usize) -> Self {
        Self {
            neighbors: vec![Vec::new(); level + 1],
        }
    }

    pub(crate) fn level(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }

    fn layer(&self, layer: usize) -> &[NodeId] {
        self.neighbors.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add a link, keeping the list sorted. Returns the new list length.
    fn link(&mut self, layer: usize, id: NodeId) -> usize {
        match self.neighbors.get_mut(layer) {
            Some(list) => {
                if let Err(pos) = list.binary_search(&id) {
                    list.insert(pos, id);
                }
                list.len()
            }
            None => 0,
        }
    }
}

/// Immutable HNSW graph over a vector table
#[derive(Debug, Clone)]
pub struct HnswIndex {
    pub(crate) config: HnswConfig,
    pub(crate) metric: DistanceMetric,
    pub(crate) table: VectorTable,
    /// Indexed by NodeId
    pub(crate) nodes: Vec<HnswNode>,
    pub(crate) entry_point: Option<NodeId>,
    pub(crate) max_level: usize,
}

impl HnswIndex {
    /// Build the graph over every row of `table`.
    ///
    /// Fails without producing an index if the config is invalid or any
    /// vector has a non-finite component.
    pub fn build(
        table: VectorTable,
        metric: DistanceMetric,
        config: HnswConfig,
    ) -> IndexResult<Self> {
        config.validate()?;
        for (node, row) in table.iter() {
            if !row.iter().all(|v| v.is_finite()) {
                return Err(IndexError::NonFiniteVector { node });
            }
        }

        let started = Instant::now();
        let count = table.len();
        let mut index = Self {
            config,
            metric,
            table,
            nodes: Vec::with_capacity(count),
            entry_point: None,
            max_level: 0,
        };

        for raw in 0..count {
            index.insert(NodeId::new(raw as u32));
        }

        info!(
            target: "latent::index",
            nodes = index.len(),
            dimension = index.dimension(),
            max_level = index.max_level,
            m = index.config.m,
            ef_construction = index.config.ef_construction,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HNSW index built"
        );
        Ok(index)
    }

    /// Reassemble an index from decoded parts, checking graph consistency
    pub(crate) fn from_parts(
        config: HnswConfig,
        metric: DistanceMetric,
        table: VectorTable,
        nodes: Vec<HnswNode>,
        entry_point: Option<NodeId>,
        max_level: usize,
    ) -> IndexResult<Self> {
        config.validate()?;
        if nodes.len() != table.len() {
            return Err(IndexError::Format(format!(
                "graph has {} nodes but table has {} rows",
                nodes.len(),
                table.len()
            )));
        }
        let in_range = |id: &NodeId| id.as_usize() < nodes.len();
        if let Some(ep) = entry_point {
            if !in_range(&ep) || nodes[ep.as_usize()].level() != max_level {
                return Err(IndexError::Format(format!("invalid entry point {}", ep)));
            }
        } else if !nodes.is_empty() {
            return Err(IndexError::Format("non-empty graph without entry point".into()));
        }
        for node in &nodes {
            if node.neighbors.is_empty() || node.level() > max_level {
                return Err(IndexError::Format("node level out of range".into()));
            }
            if !node.neighbors.iter().flatten().all(in_range) {
                return Err(IndexError::Format("neighbor id out of range".into()));
            }
        }
        Ok(Self {
            config,
            metric,
            table,
            nodes,
            entry_point,
            max_level,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Graph parameters
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Similarity metric
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.table.dimension()
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the index holds no vectors
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Highest layer in the graph
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// The indexed vector of a node
    pub fn vector(&self, node: NodeId) -> Option<&[f32]> {
        self.table.get(node)
    }

    /// The underlying vector table
    pub fn table(&self) -> &VectorTable {
        &self.table
    }

    // ========================================================================
    // Level assignment
    // ========================================================================

    /// Level for the `counter`-th inserted node
    fn assign_level(&self, counter: u64) -> usize {
        let hash = splitmix64(self.config.seed.wrapping_add(counter));
        let uniform = ((hash as f64) / (u64::MAX as f64)).max(1e-15);
        (-uniform.ln() * self.config.ml()) as usize
    }

    // ========================================================================
    // Graph operations
    // ========================================================================

    fn score(&self, query: &[f32], id: NodeId) -> Option<f32> {
        self.table
            .get(id)
            .map(|v| compute_similarity(query, v, self.metric))
    }

    /// Beam search at a single layer.
    ///
    /// Returns up to `ef` nodes sorted by (score desc, NodeId asc).
    fn search_layer(&self, query: &[f32], entry_id: NodeId, ef: usize, layer: usize) -> Vec<ScoredId> {
        let entry_score = match self.score(query, entry_id) {
            Some(s) => s,
            None => return Vec::new(),
        };

        let mut visited = FxHashSet::default();
        visited.insert(entry_id);

        // candidates: nearest popped first
        let mut candidates = BinaryHeap::new();
        candidates.push(ScoredId {
            score: entry_score,
            id: entry_id,
        });

        // results: worst on top for eviction
        let mut results: BinaryHeap<Reverse<ScoredId>> = BinaryHeap::new();
        results.push(Reverse(ScoredId {
            score: entry_score,
            id: entry_id,
        }));

        while let Some(nearest) = candidates.pop() {
            let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
            if nearest.score < worst && results.len() >= ef {
                break;
            }

            let node = match self.nodes.get(nearest.id.as_usize()) {
                Some(n) => n,
                None => continue,
            };
            for &neighbor_id in node.layer(layer) {
                if !visited.insert(neighbor_id) {
                    continue;
                }
                let score = match self.score(query, neighbor_id) {
                    Some(s) => s,
                    None => continue,
                };
                let worst = results.peek().map(|r| r.0.score).unwrap_or(f32::NEG_INFINITY);
                if results.len() < ef || score > worst {
                    let scored = ScoredId {
                        score,
                        id: neighbor_id,
                    };
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<ScoredId> = results.into_iter().map(|r| r.0).collect();
        found.sort_by(by_score_desc);
        found
    }

    /// Greedy descent from `from_layer` down to `to_layer`.
    ///
    /// At each layer moves to the best neighbor until no neighbor improves.
    fn greedy_search_to_layer(
        &self,
        query: &[f32],
        entry_id: NodeId,
        from_layer: usize,
        to_layer: usize,
    ) -> NodeId {
        let mut current = entry_id;
        let mut current_score = match self.score(query, current) {
            Some(s) => s,
            None => return current,
        };

        for layer in (to_layer..=from_layer).rev() {
            loop {
                let mut best = ScoredId {
                    score: current_score,
                    id: current,
                };
                if let Some(node) = self.nodes.get(current.as_usize()) {
                    for &neighbor_id in node.layer(layer) {
                        if let Some(score) = self.score(query, neighbor_id) {
                            let candidate = ScoredId {
                                score,
                                id: neighbor_id,
                            };
                            if candidate > best {
                                best = candidate;
                            }
                        }
                    }
                }
                if best.id == current {
                    break;
                }
                current = best.id;
                current_score = best.score;
            }
        }

        current
    }

    /// Trim a node's neighbor list at `layer` to its closest `max_connections`
    fn prune_neighbors_for(&mut self, id: NodeId, layer: usize, max_connections: usize) {
        let keep = {
            let base = match self.table.get(id) {
                Some(v) => v,
                None => return,
            };
            let node = match self.nodes.get(id.as_usize()) {
                Some(n) => n,
                None => return,
            };
            let mut scored: Vec<ScoredId> = node
                .layer(layer)
                .iter()
                .filter_map(|&nid| {
                    self.table.get(nid).map(|v| ScoredId {
                        score: compute_similarity(base, v, self.metric),
                        id: nid,
                    })
                })
                .collect();
            scored.sort_by(by_score_desc);
            let mut keep: Vec<NodeId> = scored.iter().take(max_connections).map(|s| s.id).collect();
            keep.sort();
            keep
        };

        if let Some(list) = self
            .nodes
            .get_mut(id.as_usize())
            .and_then(|n| n.neighbors.get_mut(layer))
        {
            *list = keep;
        }
    }

    /// Insert the next node of the table into the graph
    fn insert(&mut self, id: NodeId) {
        let level = self.assign_level(id.as_u32() as u64 + 1);
        self.nodes.push(HnswNode::new(level));

        let entry_id = match self.entry_point {
            Some(ep) => ep,
            None => {
                self.entry_point = Some(id);
                self.max_level = level;
                return;
            }
        };

        let query = match self.table.get(id) {
            Some(v) => v.to_vec(),
            None => return,
        };

        let mut current_entry = entry_id;
        if self.max_level > level {
            current_entry = self.greedy_search_to_layer(&query, entry_id, self.max_level, level + 1);
        }

        let start_layer = level.min(self.max_level);
        for layer in (0..=start_layer).rev() {
            let candidates =
                self.search_layer(&query, current_entry, self.config.ef_construction, layer);

            // The new node gets M links; existing nodes are only pruned past Mmax.
            let selected: Vec<NodeId> = candidates
                .iter()
                .filter(|s| s.id != id)
                .take(self.config.m)
                .map(|s| s.id)
                .collect();

            for &neighbor_id in &selected {
                self.nodes[id.as_usize()].link(layer, neighbor_id);
            }

            let max_conn = self.config.max_connections(layer);
            for &neighbor_id in &selected {
                let len = self.nodes[neighbor_id.as_usize()].link(layer, id);
                if len > max_conn {
                    self.prune_neighbors_for(neighbor_id, layer, max_conn);
                }
            }

            if let Some(closest) = candidates.first() {
                current_entry = closest.id;
            }
        }

        if level > self.max_level {
            self.entry_point = Some(id);
            self.max_level = level;
        }
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Approximate top-`n` search with the configured `ef_search`
    pub fn search(&self, query: &[f32], n: usize) -> IndexResult<Vec<Neighbor>> {
        self.search_with_ef(query, n, self.config.ef_search)
    }

    /// Approximate top-`n` search with an explicit beam width.
    ///
    /// The layer-0 beam is `max(ef, n)`. Results are sorted by
    /// (score desc, NodeId asc).
    pub fn search_with_ef(&self, query: &[f32], n: usize, ef: usize) -> IndexResult<Vec<Neighbor>> {
        if query.len() != self.dimension() {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension(),
                got: query.len(),
            });
        }

        let entry_id = match self.entry_point {
            Some(ep) if n > 0 => ep,
            _ => return Ok(Vec::new()),
        };

        let mut current_entry = entry_id;
        if self.max_level > 0 {
            current_entry = self.greedy_search_to_layer(query, entry_id, self.max_level, 1);
        }

        let beam = ef.max(n);
        let mut found = self.search_layer(query, current_entry, beam, 0);
        found.truncate(n);

        debug!(
            target: "latent::index",
            requested = n,
            beam,
            returned = found.len(),
            "HNSW search"
        );

        Ok(found
            .into_iter()
            .map(|s| Neighbor {
                node: s.id,
                score: s.score,
            })
            .collect())
    }
}

/// SplitMix64 hash function for deterministic level assignment
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
