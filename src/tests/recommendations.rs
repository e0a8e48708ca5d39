use crate::{
    activity::{ActionKind, Logged},
    catalog::GeoPoint,
    errors::CoreError,
    ranking::RankingStrategy,
    tests::support::{
        Harness, GOWN_GALLERY, GROOM_SHERWANI, KURTI_CORNER, ORIGIN, RED_LEHENGA, SILK_ROUTE,
        ZARI_HOUSE,
    },
};

fn labels(ranking: &crate::ranking::CategoryRanking) -> Vec<&str> {
    ranking.categories.iter().map(|c| c.label.as_str()).collect()
}

#[test]
fn test_nearby_ranking() {
    let h = Harness::new();

    let ranked = h.service.recommended_near("u1", ORIGIN).unwrap();
    let ids: Vec<u64> = ranked.iter().map(|r| r.entity.id).collect();

    // Gown Gallery is out of range but its 5.0 rating still beats closer shops
    assert_eq!(
        ids,
        vec![ZARI_HOUSE, GOWN_GALLERY, GROOM_SHERWANI, RED_LEHENGA, SILK_ROUTE]
    );
    assert!(!ids.contains(&KURTI_CORNER));
    assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));

    let far = &ranked[1];
    assert!(far.distance_km > 30.0);
    assert_eq!(far.proximity, 0.0);
    assert!((far.score - 3.0).abs() < 1e-9);

    let near = &ranked[0];
    assert!(near.distance_km < 1.0);
    assert!(near.proximity > 0.95);

    assert_eq!(h.distance.calls(), 1);
}

#[test]
fn test_nearby_logs_top_views() {
    let h = Harness::with_config(|config| config.ranking.nearby.view_log_top_k = 3);

    h.service.recommended_near("u1", ORIGIN).unwrap();

    let views = h.ctx().ledger.recent_embeddings("u1", ActionKind::View, 50);
    assert_eq!(views.len(), 3);

    // the stored entity vectors are logged, nothing is re-embedded
    let zari = h.ctx().catalog.get(ZARI_HOUSE).unwrap().unwrap();
    let zari_vector = zari.embedding.unwrap();
    assert!((views[2].cosine(&zari_vector) - 1.0).abs() < 1e-5);
}

#[test]
fn test_unroutable_entities_are_excluded() {
    let h = Harness::new();
    h.distance.unroutable(GeoPoint {
        lat: 17.900,
        lng: 79.000,
    });

    let ranked = h.service.recommended_near("u1", ORIGIN).unwrap();
    let ids: Vec<u64> = ranked.iter().map(|r| r.entity.id).collect();

    assert_eq!(
        ids,
        vec![ZARI_HOUSE, GROOM_SHERWANI, RED_LEHENGA, SILK_ROUTE]
    );
}

#[test]
fn test_nearby_limit() {
    let h = Harness::with_config(|config| config.ranking.nearby.limit = 2);

    let ranked = h.service.recommended_near("u1", ORIGIN).unwrap();
    assert_eq!(ranked.len(), 2);
}

#[test]
fn test_distance_service_failure() {
    let h = Harness::new();
    h.distance.fail(true);

    let result = h.service.recommended_near("u1", ORIGIN);
    assert!(matches!(result, Err(CoreError::DistanceService(_))));

    let result = h.service.recommended_categories("u1", ORIGIN);
    assert!(matches!(result, Err(CoreError::DistanceService(_))));

    assert_eq!(h.ctx().ledger.len(), 0);
}

#[test]
fn test_invalid_origin() {
    let h = Harness::new();

    let result = h.service.recommended_near(
        "u1",
        GeoPoint {
            lat: 123.0,
            lng: 78.4,
        },
    );
    assert!(matches!(result, Err(CoreError::MalformedInput(_))));
    assert_eq!(h.distance.calls(), 0);
}

#[test]
fn test_categories_cold_start_by_popularity() {
    let h = Harness::new();

    let ranking = h.service.recommended_categories("newcomer", ORIGIN).unwrap();

    assert_eq!(ranking.strategy, RankingStrategy::Popularity);
    // two lehenga sellers nearby, one of each of the others in ranking order
    assert_eq!(labels(&ranking), vec!["Lehenga", "Gown", "Sherwani", "Saree"]);
    assert_eq!(ranking.categories[0].popularity, 2);
    assert_eq!(
        ranking.categories[0].image.as_deref(),
        Some("categories/lehenga.webp")
    );
    assert!(ranking.categories.iter().all(|c| c.relevance.is_none()));
}

#[test]
fn test_categories_follow_recent_views() {
    let h = Harness::new();
    for content in ["groom sherwani", "wedding sherwani"] {
        assert_eq!(
            h.ctx().ledger.record("u2", ActionKind::View, content, None),
            Logged::Written
        );
    }

    let ranking = h.service.recommended_categories("u2", ORIGIN).unwrap();

    assert_eq!(ranking.strategy, RankingStrategy::Personalized);
    assert_eq!(ranking.categories[0].label, "Sherwani");
    assert_eq!(ranking.categories[0].popularity, 1);
    assert_eq!(ranking.categories.len(), 4);
}

#[test]
fn test_cold_start_survives_provider_outage() {
    let h = Harness::new();
    h.provider.fail_text(true);

    // only categories that already are canonical can be resolved
    let ranking = h.service.recommended_categories("newcomer", ORIGIN).unwrap();

    assert_eq!(ranking.strategy, RankingStrategy::Popularity);
    assert_eq!(labels(&ranking), vec!["Gown", "Sherwani", "Lehenga", "Saree"]);
}

#[test]
fn test_personalized_needs_provider() {
    let h = Harness::new();
    let _ = h
        .ctx()
        .ledger
        .record("u2", ActionKind::View, "silk saree", None);
    h.provider.fail_text(true);

    let result = h.service.recommended_categories("u2", ORIGIN);
    assert!(matches!(result, Err(CoreError::ProviderUnavailable(_))));
}
