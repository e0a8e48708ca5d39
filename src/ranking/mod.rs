//! Scoring and ranking.
//!
//! - `geo`: rating + proximity composite for nearby entities
//! - `personalize`: category ordering from recent views, popularity on cold start
//! - `query`: rating/area extraction from free-text queries
//! - `search`: post-filters and relevance/rating rerank for text search

mod geo;
mod personalize;
mod query;
mod search;

pub use geo::{composite_score, proximity_score, rank_nearby, RankedEntity};
pub use personalize::{
    mean_cosine, popularity_counts, rank_categories, CategoryRanking, RankedCategory,
    RankingStrategy,
};
pub use query::{parse_query, ParsedQuery};
pub use search::{fallback_results, matches_filters, rank_hits, rerank_score, SearchResponse, SearchResult};
