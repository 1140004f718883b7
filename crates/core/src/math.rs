//! Rating prediction and the SGD update rule
//!
//! Shared by the batch trainer and the online updater so that both paths
//! apply exactly the same arithmetic.
//!
//! For a rating `r` of item `i` by user `u`:
//!
//! ```text
//! r_hat = mu + b_u + b_i + p_u . q_i
//! e     = r - r_hat
//! p_u' = p_u + lr * (e * q_i - reg * p_u)
//! q_i' = q_i + lr * (e * p_u - reg * q_i)
//! b_u' = b_u + lr * (e - reg * b_u)
//! b_i' = b_i + lr * (e - reg * b_i)
//! ```
//!
//! Both vector updates read the pre-step values of the other vector.

use serde::{Deserialize, Serialize};

use crate::error::{LatentError, LatentResult};
use crate::types::Factor;

/// Learning rate and regularization of one SGD step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdParams {
    /// Step size (lambda)
    pub learning_rate: f32,
    /// L2 regularization strength (beta)
    pub regularization: f32,
}

impl SgdParams {
    /// Create step parameters
    pub fn new(learning_rate: f32, regularization: f32) -> Self {
        Self {
            learning_rate,
            regularization,
        }
    }
}

impl Default for SgdParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.005,
            regularization: 0.02,
        }
    }
}

/// Result of one SGD step
#[derive(Debug, Clone, PartialEq)]
pub struct SgdStep {
    /// Updated user factor
    pub user: Factor,
    /// Updated item factor
    pub item: Factor,
    /// Prediction error before the step
    pub error: f32,
}

/// Additive change to a factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorDelta {
    /// Added component-wise to the vector
    pub vector: Vec<f32>,
    /// Added to the bias
    pub bias: f32,
}

impl FactorDelta {
    /// Create a delta
    pub fn new(vector: Vec<f32>, bias: f32) -> Self {
        Self { vector, bias }
    }

    /// Add this delta to a factor, producing a new factor
    pub fn apply_to(&self, factor: &Factor) -> LatentResult<Factor> {
        if self.vector.len() != factor.vector.len() {
            return Err(LatentError::dimension_mismatch(
                factor.vector.len(),
                self.vector.len(),
            ));
        }
        let vector = factor
            .vector
            .iter()
            .zip(&self.vector)
            .map(|(v, d)| v + d)
            .collect();
        Ok(Factor::new(vector, factor.bias + self.bias))
    }
}

/// Inner product of two equal-length vectors
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Predicted rating `mu + b_u + b_i + p_u . q_i`
#[inline]
pub fn predict(global_mean: f32, user: &Factor, item: &Factor) -> f32 {
    global_mean + user.bias + item.bias + dot(&user.vector, &item.vector)
}

/// Squared prediction error for an observed rating
pub fn squared_error(global_mean: f32, user: &Factor, item: &Factor, rating: f32) -> f32 {
    let e = rating - predict(global_mean, user, item);
    e * e
}

/// One regularized SGD step on a single observed rating
pub fn sgd_step(
    global_mean: f32,
    user: &Factor,
    item: &Factor,
    rating: f32,
    params: SgdParams,
) -> SgdStep {
    let lr = params.learning_rate;
    let reg = params.regularization;
    let error = rating - predict(global_mean, user, item);

    let user_vector = user
        .vector
        .iter()
        .zip(&item.vector)
        .map(|(p, q)| p + lr * (error * q - reg * p))
        .collect();
    let item_vector = item
        .vector
        .iter()
        .zip(&user.vector)
        .map(|(q, p)| q + lr * (error * p - reg * q))
        .collect();

    SgdStep {
        user: Factor::new(user_vector, user.bias + lr * (error - reg * user.bias)),
        item: Factor::new(item_vector, item.bias + lr * (error - reg * item.bias)),
        error,
    }
}

/// In-place variant used by the batch trainer's inner loop.
///
/// Returns the pre-step error.
pub fn sgd_step_in_place(
    global_mean: f32,
    user: &mut Factor,
    item: &mut Factor,
    rating: f32,
    params: SgdParams,
) -> f32 {
    let lr = params.learning_rate;
    let reg = params.regularization;
    let error = rating - predict(global_mean, user, item);

    for (p, q) in user.vector.iter_mut().zip(item.vector.iter_mut()) {
        let p_old = *p;
        let q_old = *q;
        *p = p_old + lr * (error * q_old - reg * p_old);
        *q = q_old + lr * (error * p_old - reg * q_old);
    }
    user.bias += lr * (error - reg * user.bias);
    item.bias += lr * (error - reg * item.bias);
    error
}
