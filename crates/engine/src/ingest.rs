//! Rating event ingestion
//!
//! Decodes a queue payload into a [`RatingEvent`] and hands it to the
//! online updater. The expected payload is a JSON object:
//!
//! ```json
//! { "user_id": "u-17", "item_id": 4521, "rating": 4, "timestamp": "2026-05-01T12:00:00Z" }
//! ```
//!
//! Ids may be strings or integers. The timestamp may be RFC 3339 text or
//! epoch milliseconds.
//!
//! A payload that cannot become a valid event is acknowledged and dropped
//! as [`IngestOutcome::Discarded`]; redelivering it would never succeed.
//! Only failures a redelivery could fix (journal I/O) are returned as errors.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use latent_core::{LatentError, LatentResult, RatingEvent};
use serde::Deserialize;
use tracing::warn;

use crate::updater::{OnlineUpdater, UpdateOutcome};

/// What happened to one payload
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Decoded and handed to the updater
    Processed(UpdateOutcome),
    /// Malformed; acknowledged without touching the model
    Discarded(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTime {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    user_id: RawId,
    item_id: RawId,
    rating: f64,
    timestamp: RawTime,
}

fn parse_time(raw: RawTime) -> Result<DateTime<Utc>, String> {
    match raw {
        RawTime::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| format!("timestamp {} out of range", ms)),
        RawTime::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("timestamp {:?}: {}", s, e)),
    }
}

/// Decode a payload into an event without validating it against the scale
pub fn parse_event(payload: &[u8]) -> Result<RatingEvent, String> {
    let raw: RawEvent = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
    if !raw.rating.is_finite() {
        return Err("rating is not finite".to_string());
    }
    Ok(RatingEvent::new(
        raw.user_id.into_string(),
        raw.item_id.into_string(),
        raw.rating as f32,
        parse_time(raw.timestamp)?,
    ))
}

/// Feeds decoded payloads to an [`OnlineUpdater`]
#[derive(Debug, Default)]
pub struct Ingestor {
    discarded: AtomicU64,
}

impl Ingestor {
    /// New ingestor
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and apply one payload
    pub fn ingest(&self, updater: &OnlineUpdater, payload: &[u8]) -> LatentResult<IngestOutcome> {
        let event = match parse_event(payload) {
            Ok(event) => event,
            Err(reason) => return Ok(self.discard(reason)),
        };
        match updater.apply(&event) {
            Ok(outcome) => Ok(IngestOutcome::Processed(outcome)),
            Err(LatentError::InvalidInput { reason }) => Ok(self.discard(reason)),
            Err(e) => Err(e),
        }
    }

    /// Payloads discarded so far
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    fn discard(&self, reason: String) -> IngestOutcome {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        warn!(target: "latent::ingest", %reason, "Discarded rating payload");
        IngestOutcome::Discarded(reason)
    }
}
