//! Streaming ingestion through the engine
//!
//! Malformed payloads are acknowledged and dropped without touching the
//! model; well-formed ones go through the staleness guard.

use crate::common::*;
use chrono::{Duration, Utc};
use latent::{SkipReason, UpdateOutcome};

fn trained() -> TestEngine {
    let test = TestEngine::new(4);
    test.engine
        .train_and_publish(&clustered_corpus(8, 6))
        .unwrap();
    test
}

#[test]
fn malformed_payloads_are_discarded_without_mutation() {
    let test = trained();
    let engine = &test.engine;
    let later = Utc::now() + Duration::hours(1);
    let before_user = engine.store().get_user(&"u0".into()).unwrap();
    let before_item = engine.store().get_item(&"i1".into()).unwrap();
    let generation = engine.generation();

    let bad: Vec<Vec<u8>> = vec![
        b"".to_vec(),
        b"{not json".to_vec(),
        b"[1, 2, 3]".to_vec(),
        br#"{"user_id":"u0","item_id":"i1","timestamp":0}"#.to_vec(),
        br#"{"user_id":"u0","item_id":"i1","rating":"5","timestamp":0}"#.to_vec(),
        br#"{"user_id":"u0","item_id":"i1","rating":4,"timestamp":"last tuesday"}"#.to_vec(),
        br#"{"user_id":true,"item_id":"i1","rating":4,"timestamp":0}"#.to_vec(),
        payload("u0", "i1", 9.0, later),
        payload("u0", "i1", 0.0, later),
        payload("", "i1", 4.0, later),
        payload("u0", "None", 4.0, later),
    ];
    for p in &bad {
        let outcome = engine.ingest(p).unwrap();
        assert!(
            matches!(outcome, IngestOutcome::Discarded(_)),
            "{:?} -> {:?}",
            String::from_utf8_lossy(p),
            outcome
        );
    }

    assert_eq!(engine.stats().discarded, bad.len() as u64);
    assert_eq!(engine.stats().updates.applied, 0);
    assert_eq!(engine.generation(), generation);
    assert_eq!(engine.store().get_user(&"u0".into()).unwrap(), before_user);
    assert_eq!(engine.store().get_item(&"i1".into()).unwrap(), before_item);
}

#[test]
fn fresh_event_is_applied_and_stale_event_skipped() {
    let test = trained();
    let engine = &test.engine;
    let completion = engine.stats().completion_time.unwrap();

    let stale = payload("u0", "i1", 5.0, completion - Duration::minutes(5));
    assert_eq!(
        engine.ingest(&stale).unwrap(),
        IngestOutcome::Processed(UpdateOutcome::Skipped(SkipReason::Stale))
    );

    let before = engine.store().get_user(&"u0".into()).unwrap();
    let fresh = payload("u0", "i1", 5.0, completion + Duration::seconds(1));
    match engine.ingest(&fresh).unwrap() {
        IngestOutcome::Processed(UpdateOutcome::Applied {
            squared_error_before,
            squared_error_after,
            ..
        }) => assert!(squared_error_after <= squared_error_before),
        other => panic!("expected an applied update, got {:?}", other),
    }
    assert_ne!(engine.store().get_user(&"u0".into()).unwrap(), before);

    let stats = engine.stats();
    assert_eq!(stats.updates.applied, 1);
    assert_eq!(stats.updates.skipped_stale, 1);
}

#[test]
fn unknown_rows_are_processed_as_skips() {
    let test = trained();
    let later = Utc::now() + Duration::hours(1);

    assert_eq!(
        test.engine.ingest(&payload("ghost", "i1", 3.0, later)).unwrap(),
        IngestOutcome::Processed(UpdateOutcome::Skipped(SkipReason::UnknownUser))
    );
    assert_eq!(
        test.engine.ingest(&payload("u1", "ghost", 3.0, later)).unwrap(),
        IngestOutcome::Processed(UpdateOutcome::Skipped(SkipReason::UnknownItem))
    );
    assert_eq!(test.engine.stats().updates.skipped_unknown, 2);
    assert_eq!(test.engine.stats().discarded, 0);
}

#[test]
fn integer_ids_and_epoch_millis_are_accepted() {
    let test = TestEngine::new(4);
    let corpus = VecSource::new(vec![
        Rating::new("17", "4521", 4.0),
        Rating::new("17", "4522", 2.0),
        Rating::new("18", "4521", 5.0),
    ]);
    test.engine.train_and_publish(&corpus).unwrap();

    let millis = (Utc::now() + Duration::hours(1)).timestamp_millis();
    let body = format!(
        r#"{{"user_id":17,"item_id":4521,"rating":5,"timestamp":{}}}"#,
        millis
    );
    let outcome = test.engine.ingest(body.as_bytes()).unwrap();
    assert!(matches!(outcome, IngestOutcome::Processed(ref o) if o.is_applied()));
}
