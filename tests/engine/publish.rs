//! Generation publish
//!
//! A reader never observes a half-published model, and a publish that
//! fails for any reason leaves the previous generation serving.

use crate::common::*;
use latent::{PublishEvent, PublishNotifier};
use latent::core::LatentResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Model `n`: global mean `n`, every item bias `n`, `n + 1` items
fn versioned(n: usize) -> NewGeneration {
    let tag = n as f32;
    let items = (0..=n)
        .map(|i| ItemFactor::new(format!("i{}", i), vec![1.0, i as f32], tag))
        .collect();
    let users = vec![UserFactor::new("u", vec![1.0, 0.0], tag)];
    generation_of(users, items, tag, after_completion(n as i64))
}

#[test]
fn polling_reader_sees_only_whole_generations() {
    let store = Arc::new(FactorStore::new(2).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let store = store.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0u64;
            let mut last = GenerationId::INITIAL;
            while !done.load(Ordering::Acquire) {
                let generation = store.snapshot();
                assert!(generation.id() >= last, "generation went backwards");
                last = generation.id();
                if generation.id() != GenerationId::INITIAL {
                    let tag = generation.global().global_mean;
                    assert_eq!(generation.item_count(), tag as usize + 1);
                    assert_eq!(generation.index().len(), generation.item_count());
                    for row in generation.items() {
                        assert_eq!(row.factor().bias, tag, "item from another generation");
                    }
                    assert_eq!(generation.user(&"u".into()).unwrap().bias, tag);
                }
                reads += 1;
            }
            reads
        })
    };

    let mut expected = GenerationId::INITIAL;
    for n in 1..=30 {
        expected = store.compare_and_swap_all(expected, versioned(n)).unwrap();
    }
    done.store(true, Ordering::Release);
    let reads = reader.join().unwrap();

    assert!(reads > 0);
    assert_eq!(store.generation_id(), GenerationId::new(30));
}

#[test]
fn failed_publish_keeps_prior_generation() {
    let store = store_with(
        2,
        vec![UserFactor::new("u", vec![1.0, 0.0], 0.0)],
        vec![ItemFactor::new("i0", vec![1.0, 0.0], 0.0)],
        3.0,
    );
    let before = store.snapshot();

    // Index holds one vector, the item table two.
    let mut broken = versioned(1);
    broken.index = versioned(0).index;
    assert!(store
        .compare_and_swap_all(before.id(), broken)
        .is_err());

    let after = store.snapshot();
    assert_eq!(after.id(), before.id());
    assert_eq!(after.item_count(), 1);
    assert_eq!(after.global().global_mean, 3.0);
}

#[test]
fn concurrent_publishers_conflict() {
    let store = Arc::new(FactorStore::new(2).unwrap());
    store
        .compare_and_swap_all(GenerationId::INITIAL, versioned(1))
        .unwrap();

    let err = store
        .compare_and_swap_all(GenerationId::INITIAL, versioned(2))
        .unwrap_err();
    assert!(matches!(
        err,
        LatentError::PublishConflict {
            expected: 0,
            actual: 1
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(store.snapshot().global().global_mean, 1.0);
}

#[test]
fn completion_time_cannot_move_backwards() {
    let store = Arc::new(FactorStore::new(2).unwrap());
    store
        .compare_and_swap_all(GenerationId::INITIAL, versioned(5))
        .unwrap();
    let err = store
        .compare_and_swap_all(GenerationId::new(1), versioned(2))
        .unwrap_err();
    assert!(matches!(err, LatentError::InvalidInput { .. }));
    assert_eq!(store.generation_id(), GenerationId::new(1));
}

#[test]
fn online_writes_do_not_leak_into_next_generation() {
    let store = store_with(
        2,
        vec![UserFactor::new("u", vec![1.0, 0.0], 0.0)],
        vec![ItemFactor::new("i0", vec![1.0, 0.0], 0.0)],
        3.0,
    );
    store
        .apply_user_item_delta(
            &"u".into(),
            &"i0".into(),
            &FactorDelta::new(vec![1.0, 1.0], 1.0),
            &FactorDelta::new(vec![0.0, 0.0], 0.0),
        )
        .unwrap();
    assert_eq!(store.get_user(&"u".into()).unwrap().factor.bias, 1.0);

    store
        .compare_and_swap_all(GenerationId::new(1), versioned(4))
        .unwrap();
    let user = store.get_user(&"u".into()).unwrap();
    assert_eq!(user.factor.vector, vec![1.0, 0.0]);
    assert_eq!(user.factor.bias, 4.0);
}

struct Recorder {
    events: Mutex<Vec<PublishEvent>>,
}

impl PublishNotifier for Recorder {
    fn notify(&self, event: &PublishEvent) -> LatentResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[test]
fn engine_notifies_after_each_publish() {
    let test = TestEngine::new(4);
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    test.engine.set_notifier(recorder.clone());

    let corpus = clustered_corpus(10, 8);
    test.engine.train_and_publish(&corpus).unwrap();
    test.engine.train_and_publish(&corpus).unwrap();

    let events = recorder.events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].generation, GenerationId::new(1));
    assert_eq!(events[1].generation, GenerationId::new(2));
    assert_eq!(events[1].items, 8);
    assert_eq!(events[1].artifact_sequence, Some(2));
    assert!(events[0].completion_time <= events[1].completion_time);
}
