//! Rating events and the rating scale
//!
//! `RatingEvent` is what the streaming path receives; `Rating` is one row of
//! the historical corpus fed to the batch trainer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LatentError, LatentResult};
use crate::types::{ItemId, UserId};

/// Closed interval of admissible ratings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingScale {
    /// Lowest admissible rating
    pub min: f32,
    /// Highest admissible rating
    pub max: f32,
}

impl RatingScale {
    /// Create a scale, rejecting empty or non-finite intervals
    pub fn new(min: f32, max: f32) -> LatentResult<Self> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(LatentError::invalid_input(format!(
                "rating scale [{}, {}] is not a valid interval",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Whether a rating lies within the scale
    pub fn contains(&self, rating: f32) -> bool {
        rating.is_finite() && rating >= self.min && rating <= self.max
    }

    /// Reject ratings outside the scale
    pub fn check(&self, rating: f32) -> LatentResult<()> {
        if !self.contains(rating) {
            return Err(LatentError::invalid_input(format!(
                "rating {} outside scale [{}, {}]",
                rating, self.min, self.max
            )));
        }
        Ok(())
    }
}

impl Default for RatingScale {
    fn default() -> Self {
        Self { min: 1.0, max: 5.0 }
    }
}

/// One historical rating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    /// Who rated
    pub user_id: UserId,
    /// What was rated
    pub item_id: ItemId,
    /// The rating value
    pub rating: f32,
}

impl Rating {
    /// Create a corpus row
    pub fn new(user_id: impl Into<UserId>, item_id: impl Into<ItemId>, rating: f32) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            rating,
        }
    }
}

/// A rating observed on the streaming path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEvent {
    /// Who rated
    pub user_id: UserId,
    /// What was rated
    pub item_id: ItemId,
    /// The rating value
    pub rating: f32,
    /// When the rating happened
    pub event_time: DateTime<Utc>,
}

impl RatingEvent {
    /// Create an event
    pub fn new(
        user_id: impl Into<UserId>,
        item_id: impl Into<ItemId>,
        rating: f32,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            rating,
            event_time,
        }
    }

    /// Check identifiers and rating value against the scale
    pub fn validate(&self, scale: &RatingScale) -> LatentResult<()> {
        if !self.user_id.is_valid() {
            return Err(LatentError::invalid_input(format!(
                "invalid user id {:?}",
                self.user_id.as_str()
            )));
        }
        if !self.item_id.is_valid() {
            return Err(LatentError::invalid_input(format!(
                "invalid item id {:?}",
                self.item_id.as_str()
            )));
        }
        scale.check(self.rating)
    }
}
