//! Shared similarity functions for the HNSW and brute-force indexes.
//!
//! All scores are normalized to "higher = more similar". Vectors are used
//! as-is: nothing is normalized implicitly, so inner product keeps the
//! magnitude information the rating model relies on.

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Similarity used to rank item vectors against a query vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Raw inner product (the rating model's interaction term)
    #[default]
    InnerProduct,
    /// Cosine similarity
    Cosine,
    /// 1 / (1 + l2 distance)
    Euclidean,
}

impl DistanceMetric {
    /// Stable byte tag for the encoded index format
    pub fn to_byte(self) -> u8 {
        match self {
            DistanceMetric::InnerProduct => 0,
            DistanceMetric::Cosine => 1,
            DistanceMetric::Euclidean => 2,
        }
    }

    /// Inverse of [`DistanceMetric::to_byte`]
    pub fn from_byte(byte: u8) -> IndexResult<Self> {
        match byte {
            0 => Ok(DistanceMetric::InnerProduct),
            1 => Ok(DistanceMetric::Cosine),
            2 => Ok(DistanceMetric::Euclidean),
            other => Err(IndexError::Format(format!("unknown metric tag {}", other))),
        }
    }
}

/// Compute similarity score between two vectors
pub fn compute_similarity(a: &[f32], b: &[f32], metric: DistanceMetric) -> f32 {
    debug_assert_eq!(
        a.len(),
        b.len(),
        "Dimension mismatch in similarity computation"
    );

    match metric {
        DistanceMetric::InnerProduct => latent_core::dot(a, b),
        DistanceMetric::Cosine => cosine_similarity(a, b),
        DistanceMetric::Euclidean => euclidean_similarity(a, b),
    }
}

/// Returns 0.0 if either vector has zero norm
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        latent_core::dot(a, b) / (norm_a * norm_b)
    }
}

fn euclidean_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dist = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt();
    1.0 / (1.0 + dist)
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_product_keeps_magnitude() {
        let a = [2.0, 0.0];
        let b = [3.0, 0.0];
        let score = compute_similarity(&a, &b, DistanceMetric::InnerProduct);
        assert!((score - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        let a = [2.0, 0.0];
        let b = [3.0, 0.0];
        let score = compute_similarity(&a, &b, DistanceMetric::Cosine);
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let zero = [0.0, 0.0, 0.0];
        let v = [1.0, 2.0, 3.0];
        assert_eq!(compute_similarity(&zero, &v, DistanceMetric::Cosine), 0.0);
    }

    #[test]
    fn test_euclidean_identical_and_distant() {
        let v = [1.0, 2.0, 3.0];
        assert!((compute_similarity(&v, &v, DistanceMetric::Euclidean) - 1.0).abs() < 1e-6);

        let far = compute_similarity(&[0.0, 0.0], &[100.0, 0.0], DistanceMetric::Euclidean);
        assert!(far > 0.0 && far < 0.01);
    }

    #[test]
    fn test_metric_byte_tags() {
        for metric in [
            DistanceMetric::InnerProduct,
            DistanceMetric::Cosine,
            DistanceMetric::Euclidean,
        ] {
            assert_eq!(DistanceMetric::from_byte(metric.to_byte()).unwrap(), metric);
        }
        assert!(DistanceMetric::from_byte(9).is_err());
        assert_eq!(DistanceMetric::default(), DistanceMetric::InnerProduct);
    }
}
