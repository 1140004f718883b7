//! Model artifacts, journal replay and reload across engine restarts

use crate::common::*;
use chrono::{Duration, Utc};
use latent::{Engine, RecommendResponse, DIR_LOCK_FILE_NAME, JOURNAL_FILE_NAME};

fn top(engine: &Engine, user: &str) -> RecommendResponse {
    engine
        .recommend(&RecommendRequest::new(user).with_k(5))
        .unwrap()
}

/// Ingest one fresh rating and return the user's bias after it
fn apply_fresh(engine: &Engine, user: &str, item: &str) -> f32 {
    let later = Utc::now() + Duration::hours(1);
    let outcome = engine.ingest(&payload(user, item, 5.0, later)).unwrap();
    assert!(
        matches!(outcome, IngestOutcome::Processed(ref o) if o.is_applied()),
        "{:?}",
        outcome
    );
    engine.store().get_user(&user.into()).unwrap().factor.bias
}

#[test]
fn published_model_survives_restart() {
    let test = TestEngine::new(4);
    let report = test
        .engine
        .train_and_publish(&clustered_corpus(10, 8))
        .unwrap();
    assert_eq!(report.artifact_sequence, Some(1));
    let before = top(&test.engine, "u3");
    let stats = test.engine.stats();

    let test = test.reopen();
    assert_eq!(top(&test.engine, "u3"), before);
    let reopened = test.engine.stats();
    assert_eq!(reopened.users, stats.users);
    assert_eq!(reopened.items, stats.items);
    assert_eq!(reopened.completion_time, stats.completion_time);
    assert!(test.path().join("CURRENT").exists());
}

#[test]
fn online_updates_replay_from_journal() {
    let test = TestEngine::new(4);
    test.engine
        .train_and_publish(&clustered_corpus(10, 8))
        .unwrap();

    let later = Utc::now() + Duration::hours(1);
    for (n, item) in ["i0", "i1", "i2"].iter().enumerate() {
        let p = payload("u4", item, 5.0, later + Duration::seconds(n as i64));
        assert!(matches!(
            test.engine.ingest(&p).unwrap(),
            IngestOutcome::Processed(ref o) if o.is_applied()
        ));
    }
    let user = test.engine.store().get_user(&"u4".into()).unwrap();
    let item = test.engine.store().get_item(&"i2".into()).unwrap();
    assert!(std::fs::metadata(test.path().join(JOURNAL_FILE_NAME))
        .unwrap()
        .len() > 0);

    let test = test.reopen();
    assert_eq!(test.engine.store().get_user(&"u4".into()).unwrap(), user);
    assert_eq!(test.engine.store().get_item(&"i2".into()).unwrap(), item);
}

#[test]
fn publish_truncates_the_journal() {
    let test = TestEngine::new(4);
    let corpus = clustered_corpus(10, 8);
    test.engine.train_and_publish(&corpus).unwrap();

    let later = Utc::now() + Duration::hours(1);
    test.engine
        .ingest(&payload("u4", "i0", 5.0, later))
        .unwrap();
    let journal = test.path().join(JOURNAL_FILE_NAME);
    assert!(std::fs::metadata(&journal).unwrap().len() > 0);

    test.engine.train_and_publish(&corpus).unwrap();
    assert_eq!(std::fs::metadata(&journal).unwrap().len(), 0);
}

#[test]
fn corrupted_artifact_is_detected_on_open() {
    let test = TestEngine::new(4);
    test.engine
        .train_and_publish(&clustered_corpus(10, 8))
        .unwrap();
    let TestEngine { engine, dir } = test;
    engine.shutdown();
    drop(engine);

    let table = dir
        .path()
        .join("models")
        .join(format!("{:020}", 1))
        .join("items.vec");
    let mut bytes = std::fs::read(&table).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&table, bytes).unwrap();

    let err = Engine::open(dir.path()).unwrap_err();
    assert!(matches!(err, LatentError::Corruption { .. }), "{:?}", err);
}

#[test]
fn reload_adopts_newer_artifact_only() {
    let server = TestEngine::new(4);
    let trainer = Engine::open_secondary(server.path()).unwrap();
    assert_eq!(server.engine.reload().unwrap(), 0);

    trainer.train_and_publish(&clustered_corpus(10, 8)).unwrap();
    assert_eq!(server.engine.reload().unwrap(), 8);
    assert_eq!(server.engine.generation(), GenerationId::new(1));
    assert_eq!(top(&server.engine, "u1"), top(&trainer, "u1"));

    // Nothing newer on disk: the live generation stays.
    assert_eq!(server.engine.reload().unwrap(), 8);
    assert_eq!(server.engine.generation(), GenerationId::new(1));
}

#[test]
fn scheduled_reload_runs_in_background() {
    let server = TestEngine::new(4);
    let trainer = Engine::open_secondary(server.path()).unwrap();
    trainer.train_and_publish(&clustered_corpus(10, 8)).unwrap();

    server.engine.schedule_reload().unwrap();
    server.engine.wait_for_background();
    assert_eq!(server.engine.stats().items, 8);
}

#[test]
fn second_primary_is_refused_and_journal_survives() {
    let test = TestEngine::new(4);
    test.engine
        .train_and_publish(&clustered_corpus(10, 8))
        .unwrap();
    assert!(test.path().join(DIR_LOCK_FILE_NAME).exists());

    let err = Engine::open(test.path()).unwrap_err();
    assert!(matches!(err, LatentError::Persistence { .. }), "{:?}", err);

    // A secondary on the same directory leaves the primary's journal alone.
    let secondary = Engine::open_secondary(test.path()).unwrap();
    assert_eq!(secondary.stats().items, 8);
    let bias = apply_fresh(&test.engine, "u2", "i4");
    drop(secondary);

    let test = test.reopen();
    assert_eq!(
        test.engine.store().get_user(&"u2".into()).unwrap().factor.bias,
        bias
    );
}

#[test]
fn updates_after_reload_replay_on_restart() {
    let server = TestEngine::new(4);
    let trainer = Engine::open_secondary(server.path()).unwrap();
    let corpus = clustered_corpus(10, 8);
    trainer.train_and_publish(&corpus).unwrap();
    trainer.train_and_publish(&corpus).unwrap();
    assert_eq!(trainer.generation(), GenerationId::new(2));

    assert_eq!(server.engine.reload().unwrap(), 8);
    assert_eq!(server.engine.generation(), GenerationId::new(2));
    let bias = apply_fresh(&server.engine, "u5", "i1");
    let item = server.engine.store().get_item(&"i1".into()).unwrap();
    drop(trainer);

    let server = server.reopen();
    assert_eq!(server.engine.generation(), GenerationId::new(2));
    assert_eq!(
        server.engine.store().get_user(&"u5".into()).unwrap().factor.bias,
        bias
    );
    assert_eq!(server.engine.store().get_item(&"i1".into()).unwrap(), item);
}

#[test]
fn stale_secondary_cannot_overwrite_newer_model() {
    let server = TestEngine::new(4);
    let corpus = clustered_corpus(10, 8);
    server.engine.train_and_publish(&corpus).unwrap();

    let trainer = Engine::open_secondary(server.path()).unwrap();
    assert_eq!(trainer.generation(), GenerationId::new(1));
    server.engine.train_and_publish(&corpus).unwrap();
    let saved = server.engine.stats().completion_time;

    // Both engines built generation 2; the one already on disk wins.
    let err = trainer.train_and_publish(&corpus).unwrap_err();
    assert!(matches!(err, LatentError::PublishConflict { .. }), "{:?}", err);
    assert_eq!(server.engine.reload().unwrap(), 8);
    assert_eq!(server.engine.stats().completion_time, saved);

    drop(trainer);
    let server = server.reopen();
    assert_eq!(server.engine.stats().completion_time, saved);
}

#[test]
fn config_round_trips_through_data_dir() {
    let test = TestEngine::new(6);
    let written = test.engine.config().clone();
    let test = test.reopen();
    assert_eq!(test.engine.config(), &written);
    assert_eq!(test.engine.config().model.dimension, 6);
}
