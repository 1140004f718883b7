//! Engine integration tests
//!
//! Concurrency, publish atomicity, ranking properties, ingestion,
//! persistence and retrieval quality, exercised through the public API.

#[path = "../common/mod.rs"]
mod common;

mod concurrent_updates;
mod ingest;
mod persistence;
mod publish;
mod ranking;
mod retrieval;
