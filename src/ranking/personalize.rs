//! Category ranking for a single user.
//!
//! With recent view history, canonical labels are ordered by their mean
//! cosine similarity to the viewed embeddings. Without history (cold start)
//! they are ordered by how often they occur among the top nearby entities,
//! and no label is embedded at all.

use serde::Serialize;

use crate::semantic::{Embedding, Taxonomy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    Popularity,
    Personalized,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCategory {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub popularity: usize,
    /// Mean similarity to recent views; absent on cold start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryRanking {
    pub strategy: RankingStrategy,
    pub categories: Vec<RankedCategory>,
}

/// Occurrence count per label, in first-seen order.
pub fn popularity_counts<I, S>(labels: I) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut counts: Vec<(String, usize)> = vec![];
    for label in labels {
        let label = label.into();
        match counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, count)) => *count += 1,
            None => counts.push((label, 1)),
        }
    }
    counts
}

pub fn mean_cosine(candidate: &Embedding, window: &[Embedding]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window
        .iter()
        .map(|v| candidate.cosine(v) as f64)
        .sum::<f64>()
        / window.len() as f64
}

/// Order `popular` labels for a user whose recent view embeddings are `window`.
///
/// `embed_labels` is only invoked when the window is non-empty.
pub fn rank_categories<F, E>(
    popular: Vec<(String, usize)>,
    window: &[Embedding],
    taxonomy: &Taxonomy,
    embed_labels: F,
) -> Result<CategoryRanking, E>
where
    F: FnOnce(&[String]) -> Result<Vec<Embedding>, E>,
{
    let image = |label: &str| taxonomy.image_for(label).map(str::to_string);

    if window.is_empty() {
        let mut categories: Vec<RankedCategory> = popular
            .into_iter()
            .map(|(label, popularity)| RankedCategory {
                image: image(&label),
                label,
                popularity,
                relevance: None,
            })
            .collect();
        categories.sort_by(|a, b| b.popularity.cmp(&a.popularity));

        return Ok(CategoryRanking {
            strategy: RankingStrategy::Popularity,
            categories,
        });
    }

    let labels: Vec<String> = popular.iter().map(|(l, _)| l.clone()).collect();
    let embeddings = embed_labels(&labels)?;

    let mut categories: Vec<RankedCategory> = popular
        .into_iter()
        .zip(embeddings.iter())
        .map(|((label, popularity), embedding)| RankedCategory {
            image: image(&label),
            label,
            popularity,
            relevance: Some(mean_cosine(embedding, window)),
        })
        .collect();
    categories.sort_by(|a, b| {
        b.relevance
            .unwrap_or_default()
            .total_cmp(&a.relevance.unwrap_or_default())
    });

    Ok(CategoryRanking {
        strategy: RankingStrategy::Personalized,
        categories,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::EmbeddingProvider;
    use crate::tests::support::StubProvider;
    use std::convert::Infallible;

    fn taxonomy() -> Taxonomy {
        Taxonomy::new(crate::config::Config::default().taxonomy)
    }

    #[test]
    fn test_popularity_counts_keep_first_seen_order() {
        let counts = popularity_counts(["Saree", "Lehenga", "Saree", "Gown", "Lehenga", "Saree"]);
        assert_eq!(
            counts,
            vec![
                ("Saree".to_string(), 3),
                ("Lehenga".to_string(), 2),
                ("Gown".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_cold_start_orders_by_popularity_without_embedding() {
        let popular = popularity_counts(["Gown", "Saree", "Saree", "Lehenga", "Lehenga"]);

        let ranking = rank_categories(popular, &[], &taxonomy(), |_| -> Result<_, Infallible> {
            panic!("labels must not be embedded on cold start")
        })
        .unwrap();

        assert_eq!(ranking.strategy, RankingStrategy::Popularity);
        let labels: Vec<&str> = ranking.categories.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["Saree", "Lehenga", "Gown"]);
        assert_eq!(
            ranking.categories[0].image.as_deref(),
            Some("categories/saree.webp")
        );
        assert!(ranking.categories.iter().all(|c| c.relevance.is_none()));
    }

    #[test]
    fn test_personalized_follows_view_history() {
        let provider = StubProvider::new();
        let window = vec![
            provider.embed_text("sherwani").unwrap(),
            provider.embed_text("sherwani wedding").unwrap(),
        ];
        // Sherwani is the least popular label
        let popular = popularity_counts(["Saree", "Saree", "Lehenga", "Sherwani"]);

        let ranking = rank_categories(popular, &window, &taxonomy(), |labels| {
            provider.embed_texts(labels)
        })
        .unwrap();

        assert_eq!(ranking.strategy, RankingStrategy::Personalized);
        assert_eq!(ranking.categories[0].label, "Sherwani");
        assert_eq!(ranking.categories[0].popularity, 1);
        let relevances: Vec<f64> = ranking
            .categories
            .iter()
            .map(|c| c.relevance.unwrap())
            .collect();
        assert!(relevances.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_personalized_propagates_embedding_failure() {
        let provider = StubProvider::new();
        let window = vec![provider.embed_text("saree").unwrap()];
        provider.fail_text(true);

        let result = rank_categories(
            popularity_counts(["Saree"]),
            &window,
            &taxonomy(),
            |labels| provider.embed_texts(labels),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_mean_cosine() {
        let provider = StubProvider::new();
        let saree = provider.embed_text("saree").unwrap();
        assert!((mean_cosine(&saree, &[saree.clone(), saree.clone()]) - 1.0).abs() < 1e-6);
        assert_eq!(mean_cosine(&saree, &[]), 0.0);
    }
}
