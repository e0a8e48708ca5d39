use serde::Serialize;

use super::query::ParsedQuery;
use crate::{catalog::CatalogEntity, config::SearchRanking};

const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub entity: CatalogEntity,
    /// Vector similarity, 0 for results that did not come from a vector hit
    pub relevance: f32,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub used_fallback: bool,
    pub parsed: ParsedQuery,
}

/// Post-filters extracted from the query: rating floor and area substring.
pub fn matches_filters(entity: &CatalogEntity, parsed: &ParsedQuery) -> bool {
    if let Some(min_rating) = parsed.min_rating {
        if entity.rating.mean < min_rating {
            return false;
        }
    }

    if let Some(area) = &parsed.area {
        if !entity
            .area
            .to_lowercase()
            .contains(&area.trim().to_lowercase())
        {
            return false;
        }
    }

    true
}

pub fn rerank_score(relevance: f32, rating_mean: f64, weights: &SearchRanking) -> f64 {
    let rating = (rating_mean / MAX_RATING).clamp(0.0, 1.0);
    weights.relevance_weight * relevance as f64 + weights.rating_weight * rating
}

/// Filter hydrated vector hits, rerank them and keep the best `limit`.
pub fn rank_hits(
    hits: Vec<(CatalogEntity, f32)>,
    parsed: &ParsedQuery,
    weights: &SearchRanking,
    limit: usize,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = hits
        .into_iter()
        .filter(|(entity, _)| matches_filters(entity, parsed))
        .map(|(entity, relevance)| SearchResult {
            score: rerank_score(relevance, entity.rating.mean, weights),
            entity,
            relevance,
        })
        .collect();

    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(limit);
    results
}

/// Results shown when nothing matched: the given entities in order, unscored.
pub fn fallback_results(entities: Vec<CatalogEntity>) -> Vec<SearchResult> {
    entities
        .into_iter()
        .map(|entity| SearchResult {
            entity,
            relevance: 0.0,
            score: 0.0,
        })
        .collect()
}
