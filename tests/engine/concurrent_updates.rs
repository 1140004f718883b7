//! Concurrent online updates
//!
//! Row writes for one user are serialized by the store's per-key locks:
//! additive deltas never lose an increment, and concurrent SGD steps end
//! in a state some serial order would have produced.

use crate::common::*;
use latent::core::{RatingScale, SgdParams};
use latent::OnlineUpdater;
use std::sync::{Arc, Barrier};
use std::thread;

fn items(n: usize) -> Vec<ItemFactor> {
    (0..n)
        .map(|i| ItemFactor::new(format!("i{}", i), vec![0.5, -0.25], 0.0))
        .collect()
}

/// 4 threads × 100 deltas on one user, each thread through its own item.
/// Components are exactly representable, so the sum must be exact.
#[test]
fn concurrent_deltas_on_one_user_sum_exactly() {
    let store = store_with(
        2,
        vec![UserFactor::new("u", vec![0.0, 0.0], 0.0)],
        items(4),
        3.0,
    );
    let threads = 4;
    let per_thread = 100;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let user_delta = FactorDelta::new(vec![1.0, 0.25], 0.5);
                let item_delta = FactorDelta::new(vec![0.0, 0.0], 1.0);
                let user: UserId = "u".into();
                let item: ItemId = format!("i{}", t).into();
                barrier.wait();
                for _ in 0..per_thread {
                    store
                        .apply_user_item_delta(&user, &item, &user_delta, &item_delta)
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total = (threads * per_thread) as f32;
    let user = store.get_user(&"u".into()).unwrap();
    assert_eq!(user.factor.vector, vec![total, total * 0.25]);
    assert_eq!(user.factor.bias, total * 0.5);
    for t in 0..threads {
        let item = store.get_item(&format!("i{}", t).into()).unwrap();
        assert_eq!(item.factor.bias, per_thread as f32);
        assert_eq!(item.factor.vector, vec![0.5, -0.25]);
    }
}

fn updater_for(store: &Arc<FactorStore>) -> OnlineUpdater {
    OnlineUpdater::new(store.clone(), SgdParams::new(0.05, 0.02), RatingScale::default())
}

fn sgd_store() -> Arc<FactorStore> {
    store_with(
        2,
        vec![UserFactor::new("u", vec![0.3, -0.7], 0.1)],
        vec![
            ItemFactor::new("a", vec![0.9, 0.2], -0.2),
            ItemFactor::new("b", vec![-0.4, 0.8], 0.3),
        ],
        3.2,
    )
}

fn user_state(store: &FactorStore) -> (Vec<f32>, f32) {
    let user = store.get_user(&"u".into()).unwrap();
    (user.factor.vector, user.factor.bias)
}

/// Two events for the same user on two threads: the final user row must
/// equal one of the two serial orders, bit for bit.
#[test]
fn concurrent_sgd_steps_match_a_serial_order() {
    let first = RatingEvent::new("u", "a", 5.0, after_completion(10));
    let second = RatingEvent::new("u", "b", 1.0, after_completion(20));

    let serial = |order: [&RatingEvent; 2]| {
        let store = sgd_store();
        let updater = updater_for(&store);
        for event in order {
            assert!(updater.apply(event).unwrap().is_applied());
        }
        user_state(&store)
    };
    let a_then_b = serial([&first, &second]);
    let b_then_a = serial([&second, &first]);
    assert_ne!(a_then_b, b_then_a);

    for _ in 0..25 {
        let store = sgd_store();
        let updater = Arc::new(updater_for(&store));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|event| {
                let updater = updater.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    updater.apply(&event).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_applied());
        }

        let state = user_state(&store);
        assert!(
            state == a_then_b || state == b_then_a,
            "concurrent result {:?} matches neither serial order",
            state
        );
    }
}

/// Independent users update in parallel without losing any event.
#[test]
fn many_users_update_in_parallel() {
    let users: Vec<UserFactor> = (0..16)
        .map(|u| UserFactor::new(format!("u{}", u), vec![0.1, 0.1], 0.0))
        .collect();
    let store = store_with(2, users, items(8), 3.0);
    let updater = Arc::new(updater_for(&store));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let updater = updater.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for n in 0..50 {
                    let user = format!("u{}", (t * 2 + n) % 16);
                    let item = format!("i{}", n % 8);
                    let event = RatingEvent::new(user, item, 4.0, after_completion(n as i64));
                    assert!(updater.apply(&event).unwrap().is_applied());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(updater.stats().applied, 400);
    for u in 0..16 {
        let user = store.get_user(&format!("u{}", u).into()).unwrap();
        assert!(user.factor.vector.iter().all(|v| v.is_finite()));
        assert!(user.factor.bias > 0.0);
    }
}
