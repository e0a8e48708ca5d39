use serde::Serialize;

use crate::{catalog::CatalogEntity, config::NearbyRanking};

const METERS_PER_KM: f64 = 1000.0;

/// 1 at the origin, falling linearly to 0 at `max_km` and beyond.
pub fn proximity_score(distance_km: f64, max_km: f64) -> f64 {
    if max_km <= 0.0 {
        return 0.0;
    }
    1.0 - distance_km.max(0.0).min(max_km) / max_km
}

/// Weighted sum of the raw 0-5 mean rating and the proximity score.
pub fn composite_score(rating_mean: f64, proximity: f64, weights: &NearbyRanking) -> f64 {
    weights.rating_weight * rating_mean + weights.proximity_weight * proximity
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedEntity {
    #[serde(flatten)]
    pub entity: CatalogEntity,
    pub distance_km: f64,
    pub proximity: f64,
    pub score: f64,
}

/// Rank candidates by composite score.
///
/// `distances_m` is aligned with `candidates`. Candidates without a distance
/// are dropped, never scored as if they were at the origin. The sort is
/// stable, so equal scores keep their catalogue order.
pub fn rank_nearby(
    candidates: Vec<CatalogEntity>,
    distances_m: &[Option<f64>],
    weights: &NearbyRanking,
) -> Vec<RankedEntity> {
    let mut ranked: Vec<RankedEntity> = candidates
        .into_iter()
        .zip(distances_m.iter())
        .filter_map(|(entity, distance)| {
            let distance_km = (*distance)? / METERS_PER_KM;
            let proximity = proximity_score(distance_km, weights.max_distance_km);
            let score = composite_score(entity.rating.mean, proximity, weights);
            Some(RankedEntity {
                entity,
                distance_km,
                proximity,
                score,
            })
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(weights.limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityKind, GeoPoint, RatingSummary};

    fn entity(id: u64, rating: f64) -> CatalogEntity {
        CatalogEntity {
            id,
            kind: EntityKind::Boutique,
            boutique_id: None,
            name: format!("Boutique {id}"),
            area: "Madhapur".into(),
            category: "lehenga".into(),
            catalogue: String::new(),
            location: Some(GeoPoint {
                lat: 17.44,
                lng: 78.39,
            }),
            rating: RatingSummary {
                mean: rating,
                count: 10,
            },
            image: None,
            created_at: 0,
            content_hash: None,
            embedding: None,
        }
    }

    #[test]
    fn test_proximity_bounds() {
        assert_eq!(proximity_score(0.0, 30.0), 1.0);
        assert_eq!(proximity_score(15.0, 30.0), 0.5);
        assert_eq!(proximity_score(30.0, 30.0), 0.0);
        assert_eq!(proximity_score(120.0, 30.0), 0.0);
    }

    #[test]
    fn test_composite_monotonic() {
        let weights = NearbyRanking::default();

        let mut previous = f64::INFINITY;
        for km in [0.0, 1.0, 5.0, 12.5, 29.0, 30.0, 45.0] {
            let score = composite_score(4.0, proximity_score(km, 30.0), &weights);
            assert!(score <= previous, "score rose with distance at {km} km");
            previous = score;
        }

        let mut previous = f64::NEG_INFINITY;
        for rating in [0.0, 1.0, 2.5, 4.0, 5.0] {
            let score = composite_score(rating, proximity_score(10.0, 30.0), &weights);
            assert!(score >= previous, "score fell with rating {rating}");
            previous = score;
        }
    }

    #[test]
    fn test_default_weights() {
        let weights = NearbyRanking::default();
        // 0.6 * 5 + 0.4 * 1
        assert!((composite_score(5.0, 1.0, &weights) - 3.4).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_distance_excluded() {
        let weights = NearbyRanking::default();
        let ranked = rank_nearby(
            vec![entity(1, 3.0), entity(2, 5.0), entity(3, 4.0)],
            &[Some(2_000.0), None, Some(40_000.0)],
            &weights,
        );

        let ids: Vec<u64> = ranked.iter().map(|r| r.entity.id).collect();
        // 1: 0.6*3 + 0.4*(28/30) = 2.173; 3: 0.6*4 + 0 = 2.4
        assert_eq!(ids, vec![3, 1]);
        assert!((ranked[1].distance_km - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_ties_keep_catalogue_order_and_limit() {
        let weights = NearbyRanking {
            limit: 2,
            ..Default::default()
        };
        let ranked = rank_nearby(
            vec![entity(1, 4.0), entity(2, 4.0), entity(3, 4.0)],
            &[Some(1_000.0), Some(1_000.0), Some(1_000.0)],
            &weights,
        );

        let ids: Vec<u64> = ranked.iter().map(|r| r.entity.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
