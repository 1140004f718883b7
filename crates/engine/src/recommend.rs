//! Retrieval & reranking
//!
//! Two stages over one published generation:
//!
//! 1. **Retrieve**: ask the ANN index for `C` candidates by inner product
//!    with the user's vector. When the generation has no more than `C`
//!    items every item is a candidate, ranked by an exact scan.
//! 2. **Rerank**: score each candidate with the full model
//!    `mu + b_u + b_i + p_u . q_i` using the current rows, stable-sort
//!    descending (ties keep retrieval order) and keep the top `k`.
//!
//! The index only knows similarity; the biases only enter in stage 2.

use std::time::Instant;

use latent_core::{predict, ItemId, LatentError, LatentResult, UserId};
use latent_index::{compute_similarity, AnnIndex, Neighbor, NodeId};
use latent_store::Generation;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServingSection;

/// One ranked item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Recommended item
    pub item_id: ItemId,
    /// Model's predicted rating
    pub predicted_rating: f32,
}

/// Recommendation request as received from the serving layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendRequest {
    /// Who to recommend for
    pub user_id: UserId,
    /// How many items; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
}

impl RecommendRequest {
    /// Request with the default `k`
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            k: None,
        }
    }

    /// Request exactly `k` items
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }
}

/// Index-aligned response, ratings non-increasing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendResponse {
    /// Items, best first
    pub item_ids: Vec<ItemId>,
    /// Predicted rating of `item_ids[n]`
    pub predicted_ratings: Vec<f32>,
}

impl From<Vec<Recommendation>> for RecommendResponse {
    fn from(recs: Vec<Recommendation>) -> Self {
        let (item_ids, predicted_ratings) = recs
            .into_iter()
            .map(|r| (r.item_id, r.predicted_rating))
            .unzip();
        Self {
            item_ids,
            predicted_ratings,
        }
    }
}

impl RecommendResponse {
    /// Number of items
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether no items were returned
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

/// How many candidates to retrieve for a given `k`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicy {
    /// Fixed pool size for small `k`
    pub candidate_pool: usize,
    /// Largest `k` served from the fixed pool
    pub oversample_threshold: usize,
    /// Pool multiplier above the threshold
    pub oversample: usize,
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self::from(&ServingSection::default())
    }
}

impl From<&ServingSection> for CandidatePolicy {
    fn from(s: &ServingSection) -> Self {
        Self {
            candidate_pool: s.candidate_pool,
            oversample_threshold: s.oversample_threshold,
            oversample: s.oversample,
        }
    }
}

impl CandidatePolicy {
    /// Candidate count `C` for a request of `k` items; always `>= k`
    pub fn pool_size(&self, k: usize) -> usize {
        if k <= self.oversample_threshold {
            self.candidate_pool.max(k)
        } else {
            k.saturating_mul(self.oversample)
        }
    }
}

/// Stage 1: up to `pool` candidates, best first
pub fn retrieve_candidates(
    index: &dyn AnnIndex,
    query: &[f32],
    pool: usize,
) -> LatentResult<Vec<Neighbor>> {
    if index.len() <= pool {
        return exact_candidates(index, query);
    }
    Ok(index.search(query, pool)?)
}

/// Every indexed item, scored exactly
fn exact_candidates(index: &dyn AnnIndex, query: &[f32]) -> LatentResult<Vec<Neighbor>> {
    if query.len() != index.dimension() {
        return Err(LatentError::dimension_mismatch(index.dimension(), query.len()));
    }
    let metric = index.metric();
    let mut all: Vec<Neighbor> = (0..index.len())
        .filter_map(|n| {
            let node = NodeId::new(n as u32);
            index.vector(node).map(|v| Neighbor {
                node,
                score: compute_similarity(query, v, metric),
            })
        })
        .collect();
    all.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.node.cmp(&b.node))
    });
    Ok(all)
}

/// Serves recommendations from a generation
#[derive(Debug, Clone, Default)]
pub struct Recommender {
    policy: CandidatePolicy,
}

impl Recommender {
    /// Recommender with the given candidate policy
    pub fn new(policy: CandidatePolicy) -> Self {
        Self { policy }
    }

    /// Candidate policy in use
    pub fn policy(&self) -> &CandidatePolicy {
        &self.policy
    }

    /// Top `k` items for `user_id` in `generation`.
    ///
    /// Returns `min(k, items)` recommendations, predicted ratings
    /// non-increasing. `NotFound` if the user has no vector, `InvalidInput`
    /// if `k == 0`.
    pub fn recommend(
        &self,
        generation: &Generation,
        user_id: &UserId,
        k: usize,
    ) -> LatentResult<Vec<Recommendation>> {
        if k == 0 {
            return Err(LatentError::invalid_input("k must be at least 1"));
        }
        let started = Instant::now();
        let user = generation
            .user(user_id)
            .ok_or_else(|| LatentError::user_not_found(user_id))?;

        let pool = self.policy.pool_size(k);
        let candidates = retrieve_candidates(&**generation.index(), &user.vector, pool)?;

        let mu = generation.global().global_mean;
        let mut ranked: Vec<Recommendation> = candidates
            .iter()
            .filter_map(|c| generation.item_at(c.node))
            .map(|row| Recommendation {
                predicted_rating: predict(mu, &user, &row.factor()),
                item_id: row.id().clone(),
            })
            .collect();
        // Stable: equal ratings keep retrieval order.
        ranked.sort_by(|a, b| b.predicted_rating.total_cmp(&a.predicted_rating));
        ranked.truncate(k);

        debug!(
            target: "latent::recommend",
            user = %user_id,
            k,
            pool,
            candidates = candidates.len(),
            returned = ranked.len(),
            generation = generation.id().as_u64(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Recommendations served"
        );
        Ok(ranked)
    }
}
