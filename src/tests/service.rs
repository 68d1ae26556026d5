use std::collections::HashMap;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;

use super::fakes::{created, image_url, product, FakeFetcher, FAKE_MODEL_ID};
use super::{cosine, Fixture, JEANS, TSHIRTS};
use crate::catalog::{Catalog, Category};
use crate::lock::FileLock;
use crate::recommend::{
    BatchItem, ErrorKind, Method, RecommendError, RecommendOptions, RuleTarget, VisualQuery,
    FALLBACK_SCORE,
};
use crate::semantic::{build, RetrievalMode};

fn vectors() -> HashMap<&'static str, Vec<f32>> {
    HashMap::from([
        ("t1", vec![1.0, 0.0, 0.0]),
        ("t2", vec![0.9, 0.1, 0.0]),
        ("t3", vec![0.7, 0.7, 0.0]),
        ("t4", vec![0.2, 1.0, 0.0]),
        ("j1", vec![0.95, 0.05, 0.0]),
        ("j2", vec![0.0, 0.0, 1.0]),
        ("s1", vec![0.0, 0.3, 1.0]),
    ])
}

fn any_category() -> RecommendOptions {
    RecommendOptions {
        same_category_only: Some(false),
        ..Default::default()
    }
}

#[test]
fn test_similar_by_product_excludes_self() {
    let fixture = Fixture::new();

    for service in [fixture.on_the_fly(), fixture.indexed()] {
        let recs = service
            .similar_by_product("t1", Some(10), &RecommendOptions::default())
            .unwrap();
        assert!(!recs.ids().contains(&"t1"));
        assert_eq!(recs.ids(), vec!["t2", "t3", "t4"]);
        assert_eq!(recs.method, Method::Visual);
        assert_eq!(recs.target.as_ref().map(|p| p.id.as_str()), Some("t1"));
    }
}

#[test]
fn test_same_category_only_never_leaks_other_categories() {
    let fixture = Fixture::new();
    let service = fixture.indexed();
    let target = Category::new(TSHIRTS.0, TSHIRTS.1, TSHIRTS.2);

    let recs = service
        .similar_by_product("t1", Some(10), &RecommendOptions::default())
        .unwrap();
    assert!(recs.items.iter().all(|c| target.admits(&c.product.category)));

    // j1 is the closest product overall but it is a pair of jeans
    let loose = service.similar_by_product("t1", Some(10), &any_category()).unwrap();
    assert_eq!(loose.ids(), vec!["j1", "t2", "t3", "t4", "j2", "s1"]);
}

#[test]
fn test_indexed_and_on_the_fly_agree() {
    let fixture = Fixture::new();
    let indexed = fixture.indexed();
    let on_the_fly = fixture.on_the_fly();

    for id in ["t1", "t3", "j2", "s1"] {
        let a = indexed.similar_by_product(id, Some(10), &any_category()).unwrap();
        let b = on_the_fly.similar_by_product(id, Some(10), &any_category()).unwrap();

        assert_eq!(a.mode, RetrievalMode::Indexed);
        assert_eq!(b.mode, RetrievalMode::OnTheFly);
        assert_eq!(a.ids(), b.ids(), "order differs for {id}");
        for (x, y) in a.items.iter().zip(&b.items) {
            assert!((x.similarity - y.similarity).abs() < 1e-5);
        }
    }
}

#[test]
fn test_scores_are_cosine_similarities() {
    let fixture = Fixture::new();
    let v = vectors();

    let recs = fixture
        .indexed()
        .similar_by_product("t1", Some(10), &any_category())
        .unwrap();
    for item in &recs.items {
        let expected = cosine(&v["t1"], &v[item.product.id.as_str()]);
        assert!(
            (item.similarity - expected).abs() < 1e-5,
            "{}: {} != {expected}",
            item.product.id,
            item.similarity
        );
    }
}

#[test]
fn test_min_similarity_threshold() {
    let fixture = Fixture::new();
    let options = RecommendOptions {
        min_similarity: Some(0.5),
        ..Default::default()
    };

    let recs = fixture
        .indexed()
        .similar_by_product("t1", Some(10), &options)
        .unwrap();
    assert_eq!(recs.ids(), vec!["t2", "t3"]);
}

#[test]
fn test_limit_is_validated() {
    let fixture = Fixture::new();
    let service = fixture.indexed();

    for limit in [0, 51] {
        assert!(matches!(
            service.similar_by_product("t1", Some(limit), &RecommendOptions::default()),
            Err(RecommendError::Validation(_))
        ));
    }

    let via_options = RecommendOptions {
        limit: Some(2),
        ..Default::default()
    };
    let recs = service.similar_by_product("t1", None, &via_options).unwrap();
    assert_eq!(recs.ids(), vec!["t2", "t3"]);
}

#[test]
fn test_unknown_product_is_not_found() {
    let fixture = Fixture::new();
    let err = fixture
        .indexed()
        .similar_by_product("ghost", None, &RecommendOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_catalog_outage_is_upstream_unavailable() {
    let fixture = Fixture::new();
    let service = fixture.indexed();
    fixture.catalog.set_unavailable(true);

    let err = service
        .similar_by_product("t1", None, &RecommendOptions::default())
        .unwrap_err();
    assert!(matches!(err, RecommendError::UpstreamUnavailable(_)));

    // personalization only needs the store; items fall back to stored references
    let recs = service
        .personalized(&["t1".to_string()], None, Some(3), &RecommendOptions::default())
        .unwrap();
    assert_eq!(recs.ids(), vec!["j1", "t2", "t3"]);
    assert_eq!(recs.items[0].product.name, "Product j1");
    assert_eq!(recs.items[0].product.images, vec![image_url("j1")]);
}

#[test]
fn test_index_unavailable_without_on_the_fly() {
    let mut fixture = Fixture::new();
    fixture.config.retrieval.on_the_fly = false;

    let err = fixture
        .on_the_fly()
        .similar_by_product("t1", None, &RecommendOptions::default())
        .unwrap_err();
    assert!(matches!(err, RecommendError::IndexUnavailable));

    assert!(fixture
        .indexed()
        .similar_by_product("t1", None, &RecommendOptions::default())
        .is_ok());
}

#[test]
fn test_personalized_keeps_max_score_per_candidate() {
    let fixture = Fixture::new();
    let v = vectors();
    let seeds = vec!["t1".to_string(), "j2".to_string()];

    for service in [fixture.indexed(), fixture.on_the_fly()] {
        let recs = service
            .personalized(&seeds, None, Some(10), &RecommendOptions::default())
            .unwrap();

        assert_eq!(recs.method, Method::Personalized);
        assert_eq!(recs.ids(), vec!["j1", "t2", "s1", "t3", "t4"]);
        for item in &recs.items {
            let id = item.product.id.as_str();
            let expected = cosine(&v["t1"], &v[id]).max(cosine(&v["j2"], &v[id]));
            let summed = cosine(&v["t1"], &v[id]) + cosine(&v["j2"], &v[id]);
            assert!((item.score - expected).abs() < 1e-5, "{id}");
            if cosine(&v["j2"], &v[id]) > 0.0 && cosine(&v["t1"], &v[id]) > 0.0 {
                assert!((item.score - summed).abs() > 1e-3);
            }
        }
    }
}

#[test]
fn test_personalized_empty_seeds() {
    let fixture = Fixture::new();
    let recs = fixture
        .indexed()
        .personalized(&[], None, None, &RecommendOptions::default())
        .unwrap();
    assert!(recs.items.is_empty());
}

#[test]
fn test_personalized_skips_unresolvable_seeds() {
    let fixture = Fixture::new();

    for service in [fixture.indexed(), fixture.on_the_fly()] {
        let only_t1 = service
            .personalized(&["t1".to_string()], None, Some(10), &RecommendOptions::default())
            .unwrap();
        let with_ghost = service
            .personalized(
                &["ghost".to_string(), "t1".to_string(), "broken".to_string(), "t1".to_string()],
                None,
                Some(10),
                &RecommendOptions::default(),
            )
            .unwrap();
        assert_eq!(only_t1.ids(), with_ghost.ids());
        assert!(!with_ghost.ids().contains(&"broken"));
    }
}

#[test]
fn test_personalized_seed_limit() {
    let fixture = Fixture::new();
    let seeds: Vec<String> = (0..11).map(|i| format!("p{i}")).collect();
    assert!(matches!(
        fixture
            .indexed()
            .personalized(&seeds, None, None, &RecommendOptions::default()),
        Err(RecommendError::Validation(_))
    ));
}

#[test]
fn test_personalized_with_reference_profile() {
    let fixture = Fixture::new();
    let reference = RuleTarget {
        category: Category::new(JEANS.0, JEANS.1, JEANS.2),
        ..Default::default()
    };

    let recs = fixture
        .indexed()
        .personalized(&["t1".to_string()], Some(&reference), Some(10), &RecommendOptions::default())
        .unwrap();
    assert_eq!(recs.ids(), vec!["j1", "j2"]);
}

#[test]
fn test_batch_partial_failure() {
    let fixture = Fixture::new();
    let service = fixture.on_the_fly();
    let ids = vec!["t1".to_string(), "broken".to_string(), "ghost".to_string()];

    let results = service
        .batch(&ids, Some(2), &RecommendOptions::default())
        .unwrap();

    assert_eq!(results.len(), 3);
    match &results["t1"] {
        BatchItem::Ok { ok } => assert_eq!(ok.ids(), vec!["t2", "t3"]),
        BatchItem::Failed { error, .. } => panic!("t1 failed: {error}"),
    }
    assert!(matches!(
        results["broken"],
        BatchItem::Failed {
            kind: ErrorKind::EncodingFailure,
            ..
        }
    ));
    assert!(matches!(
        results["ghost"],
        BatchItem::Failed {
            kind: ErrorKind::NotFound,
            ..
        }
    ));
}

#[test]
fn test_batch_size_is_validated() {
    let fixture = Fixture::new();
    let service = fixture.indexed();
    let too_many: Vec<String> = (0..11).map(|i| format!("p{i}")).collect();

    assert!(service.batch(&[], None, &RecommendOptions::default()).is_err());
    assert!(service.batch(&too_many, None, &RecommendOptions::default()).is_err());
}

#[test]
fn test_results_are_deterministic() {
    let fixture = Fixture::new();
    let service = fixture.indexed();

    let first = service.similar_by_product("t3", Some(10), &any_category()).unwrap();
    let second = service.similar_by_product("t3", Some(10), &any_category()).unwrap();
    assert_eq!(
        serde_json::to_string(&first.items).unwrap(),
        serde_json::to_string(&second.items).unwrap()
    );
}

#[test]
fn test_similar_by_image_and_text() {
    let fixture = Fixture::new();
    let service = fixture.indexed();
    let options = RecommendOptions::default();

    let by_image = service
        .similar_by_image(VisualQuery::Image(b"vec:1,0,0".to_vec()), None, Some(3), &options)
        .unwrap();
    assert_eq!(by_image.ids(), vec!["t1", "j1", "t2"]);
    assert_eq!(by_image.method, Method::Visual);
    assert!(by_image.target.is_none());

    let by_url = service
        .similar_by_image(VisualQuery::ImageUrl(image_url("j2")), None, Some(2), &options)
        .unwrap();
    assert_eq!(by_url.ids(), vec!["j2", "s1"]);

    let by_text = service
        .similar_by_image(VisualQuery::Text("vec:0,0,1".into()), None, Some(1), &options)
        .unwrap();
    assert_eq!(by_text.ids(), vec!["j2"]);
    assert_eq!(by_text.method, Method::Text);
}

#[test]
fn test_similar_by_image_reference_enables_rules() {
    let fixture = Fixture::new();
    let reference = RuleTarget {
        category: Category::new(JEANS.0, JEANS.1, JEANS.2),
        ..Default::default()
    };

    let recs = fixture
        .indexed()
        .similar_by_image(
            VisualQuery::Image(b"vec:1,0,0".to_vec()),
            Some(&reference),
            Some(10),
            &RecommendOptions::default(),
        )
        .unwrap();
    assert_eq!(recs.ids(), vec!["j1", "j2"]);
}

#[test]
fn test_similar_by_image_rejects_bad_input() {
    let fixture = Fixture::new();
    let service = fixture.indexed();
    let options = RecommendOptions::default();

    assert!(matches!(
        service.similar_by_image(VisualQuery::Text("   ".into()), None, None, &options),
        Err(RecommendError::Validation(_))
    ));
    assert!(matches!(
        service.similar_by_image(VisualQuery::Image(vec![]), None, None, &options),
        Err(RecommendError::Validation(_))
    ));

    let err = service
        .similar_by_image(VisualQuery::Image(b"\x89PNG garbage".to_vec()), None, None, &options)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EncodingFailure);
}

#[test]
fn test_category_fallback() {
    let watches = ("Accessories", "Watches", "Watches");
    let products = vec![
        product("t1", TSHIRTS),
        product("w1", watches),
        created(product("w2", watches), "2024-01-01T00:00:00Z"),
        created(product("w3", watches), "2024-06-01T00:00:00Z"),
    ];
    // only t1 and w1 have images that can be fetched
    let fetcher = FakeFetcher::new()
        .with_vector(&image_url("t1"), &[1.0, 0.0])
        .with_vector(&image_url("w1"), &[0.0, 1.0]);

    let mut fixture = Fixture::with(products, fetcher);
    let recs = fixture
        .on_the_fly()
        .similar_by_product("w1", Some(5), &RecommendOptions::default())
        .unwrap();

    assert_eq!(recs.method, Method::Fallback);
    assert_eq!(recs.ids(), vec!["w3", "w2"]);
    assert!(recs.items.iter().all(|c| c.score == FALLBACK_SCORE));

    fixture.config.retrieval.category_fallback = false;
    let recs = fixture
        .on_the_fly()
        .similar_by_product("w1", Some(5), &RecommendOptions::default())
        .unwrap();
    assert_eq!(recs.method, Method::Visual);
    assert!(recs.items.is_empty());
}

#[test]
fn test_category_search_when_top_candidates_miss_the_category() {
    let mut fixture = Fixture::new();
    // t1's single nearest neighbour is j1, a pair of jeans
    fixture.config.retrieval.candidate_k = 1;
    let v = vectors();

    for service in [fixture.on_the_fly(), fixture.indexed()] {
        let recs = service
            .similar_by_product("t1", Some(1), &RecommendOptions::default())
            .unwrap();

        assert_eq!(recs.method, Method::Visual);
        assert_eq!(recs.ids(), vec!["t2"]);
        let expected = cosine(&v["t1"], &v["t2"]);
        assert!((recs.items[0].similarity - expected).abs() < 1e-5);
        assert_ne!(recs.items[0].score, FALLBACK_SCORE);
    }
}

#[test]
fn test_slow_lookups_keep_stored_references() {
    let mut fixture = Fixture::new();
    fixture.config.catalog.lookup_budget_ms = 200;
    let service = fixture.indexed();
    fixture.catalog.set_delay("t3", Duration::from_secs(2));

    let started = Instant::now();
    let recs = service
        .similar_by_product("t1", Some(3), &any_category())
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(recs.ids(), vec!["j1", "t2", "t3"]);
    assert_eq!(
        recs.items[1].product.category,
        Category::new(TSHIRTS.0, TSHIRTS.1, TSHIRTS.2)
    );

    // t3 missed the budget: name and image come from the store
    let late = &recs.items[2].product;
    assert_eq!(late.name, "Product t3");
    assert_eq!(late.primary_image(), Some(image_url("t3").as_str()));
    assert_eq!(late.category, Category::default());
}

#[cfg(unix)]
#[test]
fn test_reload_refused_while_build_holds_lock() {
    let fixture = Fixture::new();
    let service = fixture.on_the_fly();

    let build = FileLock::try_acquire(fixture.data_dir.path()).unwrap();
    assert!(matches!(service.reload(), Err(RecommendError::Busy(_))));

    drop(build);
    assert!(service.reload().is_ok());
}

#[test]
fn test_reload_swaps_snapshot() {
    let fixture = Fixture::new();
    let service = fixture.on_the_fly();
    let held = service.snapshot();
    assert_eq!(service.health().mode, RetrievalMode::OnTheFly);

    let products = fixture.catalog.products(100).unwrap();
    let (store, failures) = build::build_store(&products, &fixture.pool, &ProgressBar::hidden());
    assert_eq!(failures.len(), 1);
    build::write_artifacts(fixture.data_dir.path(), &store, &FAKE_MODEL_ID).unwrap();

    let stats = service.reload().unwrap();
    assert_eq!(stats.mode, RetrievalMode::Indexed);
    assert_eq!(stats.store_size, 7);
    assert_eq!(stats.index_size, 7);
    assert_eq!(service.health().indexed_products, 7);

    // a request that started before the swap keeps its snapshot
    assert_eq!(held.mode(), RetrievalMode::OnTheFly);
    assert_eq!(held.store_len(), 0);
}

#[test]
fn test_on_the_fly_encodings_are_cached() {
    let fixture = Fixture::new();
    let service = fixture.on_the_fly();

    service
        .similar_by_product("t1", None, &RecommendOptions::default())
        .unwrap();
    let cached = service.stats().cached_embeddings;
    assert_eq!(cached, 7);

    service
        .similar_by_product("t2", None, &RecommendOptions::default())
        .unwrap();
    assert_eq!(service.stats().cached_embeddings, cached);
}
