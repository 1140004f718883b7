//! Ranking properties of recommend
//!
//! For any model: the response has `min(k, items)` entries, predicted
//! ratings never increase down the list, and every rating is the
//! bias-adjusted prediction for that item.

use crate::common::*;
use latent::core::predict;
use latent::{CandidatePolicy, Recommender};
use proptest::prelude::*;

fn item_strategy(dimension: usize) -> impl Strategy<Value = (Vec<f32>, f32)> {
    (
        prop::collection::vec(-2.0f32..2.0, dimension),
        -1.0f32..1.0,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn recommend_is_sorted_sized_and_exact(
        rows in prop::collection::vec(item_strategy(3), 1..60),
        user in prop::collection::vec(-2.0f32..2.0, 3),
        user_bias in -1.0f32..1.0,
        mu in 1.0f32..5.0,
        k in 1usize..80,
    ) {
        let items: Vec<ItemFactor> = rows
            .into_iter()
            .enumerate()
            .map(|(i, (v, b))| ItemFactor::new(format!("i{}", i), v, b))
            .collect();
        let n = items.len();
        let store = store_with(3, vec![UserFactor::new("u", user, user_bias)], items, mu);
        let generation = store.snapshot();
        let user_row = generation.user(&"u".into()).unwrap();

        let recs = Recommender::new(CandidatePolicy::default())
            .recommend(&generation, &"u".into(), k)
            .unwrap();

        prop_assert_eq!(recs.len(), k.min(n));
        for pair in recs.windows(2) {
            prop_assert!(pair[0].predicted_rating >= pair[1].predicted_rating);
        }
        for rec in &recs {
            let item = generation.item(&rec.item_id).unwrap();
            prop_assert_eq!(rec.predicted_rating, predict(mu, &user_row, &item));
        }
    }
}

/// With more items than the candidate pool the ANN path is used; the
/// response must still be sized and ordered.
#[test]
fn large_catalogue_uses_ann_and_stays_ordered() {
    let rows = random_rows(900, 6, 7);
    let items: Vec<ItemFactor> = rows
        .into_iter()
        .enumerate()
        .map(|(i, v)| ItemFactor::new(format!("i{}", i), v, (i % 5) as f32 * 0.1))
        .collect();
    let store = store_with(6, vec![UserFactor::new("u", vec![0.5; 6], 0.0)], items, 3.0);
    let generation = store.snapshot();

    let policy = CandidatePolicy::default();
    for k in [1, 10, 50, 120] {
        assert!(policy.pool_size(k) >= k);
        assert!(policy.pool_size(k) < 900);
        let recs = Recommender::new(policy.clone())
            .recommend(&generation, &"u".into(), k)
            .unwrap();
        assert_eq!(recs.len(), k);
        assert!(recs
            .windows(2)
            .all(|w| w[0].predicted_rating >= w[1].predicted_rating));
    }
}

#[test]
fn engine_response_is_index_aligned() {
    let test = TestEngine::new(4);
    test.engine
        .train_and_publish(&clustered_corpus(12, 10))
        .unwrap();

    let response = test
        .engine
        .recommend(&RecommendRequest::new("u2").with_k(25))
        .unwrap();
    assert_eq!(response.len(), 10);
    assert_eq!(response.item_ids.len(), response.predicted_ratings.len());

    let generation = test.engine.store().snapshot();
    let user = generation.user(&"u2".into()).unwrap();
    let mu = generation.global().global_mean;
    for (id, rating) in response.item_ids.iter().zip(&response.predicted_ratings) {
        let item = generation.item(id).unwrap();
        assert_eq!(*rating, predict(mu, &user, &item));
    }
}

#[test]
fn trained_model_prefers_the_users_cluster() {
    let test = TestEngine::new(4);
    test.engine
        .train_and_publish(&clustered_corpus(20, 10))
        .unwrap();

    // Users rate items of their own parity 5 and the rest 1.
    for (user, parity) in [("u0", 0), ("u1", 1)] {
        let response = test
            .engine
            .recommend(&RecommendRequest::new(user).with_k(3))
            .unwrap();
        let same_cluster = response
            .item_ids
            .iter()
            .filter(|id| id.as_str()[1..].parse::<usize>().unwrap() % 2 == parity)
            .count();
        assert!(same_cluster >= 2, "{} got {:?}", user, response.item_ids);
    }
}

#[test]
fn unknown_user_and_zero_k_are_errors() {
    let test = TestEngine::new(4);
    test.engine
        .train_and_publish(&clustered_corpus(6, 6))
        .unwrap();

    let err = test
        .engine
        .recommend(&RecommendRequest::new("stranger"))
        .unwrap_err();
    assert!(err.is_not_found());

    let err = test
        .engine
        .recommend(&RecommendRequest::new("u1").with_k(0))
        .unwrap_err();
    assert!(matches!(err, LatentError::InvalidInput { .. }));
}
