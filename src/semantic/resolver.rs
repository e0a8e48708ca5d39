//! Canonical label resolution.
//!
//! Maps a free-text category label onto the nearest member of a small
//! canonical set by embedding similarity. There is no threshold: a weak best
//! match is still returned. Ties go to the earlier canonical label.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use super::embeddings::{Embedding, EmbeddingError, EmbeddingProvider};
use crate::config::CanonicalCategory;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("canonical label set is empty")]
    EmptyCanonicalSet,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// The curated display categories and their fixed images.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    categories: Vec<CanonicalCategory>,
}

impl Taxonomy {
    pub fn new(categories: Vec<CanonicalCategory>) -> Self {
        Self { categories }
    }

    pub fn labels(&self) -> Vec<String> {
        self.categories.iter().map(|c| c.label.clone()).collect()
    }

    /// Static lookup of the representative image for a canonical label.
    pub fn image_for(&self, label: &str) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.label.eq_ignore_ascii_case(label))
            .map(|c| c.image.as_str())
    }
}

pub struct LabelResolver {
    provider: Arc<dyn EmbeddingProvider>,
    /// Canonical label -> embedding. Canonical sets are small and fixed.
    cache: RwLock<HashMap<String, Embedding>>,
}

impl LabelResolver {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Embed every canonical label, batching the ones not cached yet into one call.
    fn canonical_embeddings(&self, canonical: &[String]) -> Result<Vec<Embedding>, ResolveError> {
        let missing: Vec<String> = {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            let mut seen = HashSet::new();
            let missing: Vec<String> = canonical
                .iter()
                .filter(|label| !cache.contains_key(*label) && seen.insert(label.as_str()))
                .cloned()
                .collect();
            missing
        };

        if !missing.is_empty() {
            let embedded = self.provider.embed_texts(&missing)?;
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            for (label, embedding) in missing.into_iter().zip(embedded) {
                cache.insert(label, embedding);
            }
        }

        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        canonical
            .iter()
            .map(|label| {
                cache.get(label).cloned().ok_or_else(|| {
                    ResolveError::Embedding(EmbeddingError::Unavailable(format!(
                        "no embedding returned for '{label}'"
                    )))
                })
            })
            .collect()
    }

    pub fn resolve(&self, raw_label: &str, canonical: &[String]) -> Result<String, ResolveError> {
        if canonical.is_empty() {
            return Err(ResolveError::EmptyCanonicalSet);
        }

        let raw = self.provider.embed_text(raw_label)?;
        let candidates = self.canonical_embeddings(canonical)?;

        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (idx, candidate) in candidates.iter().enumerate() {
            let score = raw.cosine(candidate);
            // strict comparison keeps the first-seen label on ties
            if score > best_score {
                best = idx;
                best_score = score;
            }
        }

        log::debug!("resolved '{raw_label}' to '{}' ({best_score:.3})", canonical[best]);

        Ok(canonical[best].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::StubProvider;

    fn canonical() -> Vec<String> {
        ["Lehenga", "Saree", "Sherwani"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_resolve_picks_nearest() {
        let resolver = LabelResolver::new(Arc::new(StubProvider::new()));

        assert_eq!(
            resolver.resolve("bridal lehenga choli", &canonical()).unwrap(),
            "Lehenga"
        );
        assert_eq!(
            resolver.resolve("silk saree", &canonical()).unwrap(),
            "Saree"
        );
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = LabelResolver::new(Arc::new(StubProvider::new()));
        let first = resolver.resolve("wedding wear", &canonical()).unwrap();
        let second = resolver.resolve("wedding wear", &canonical()).unwrap();
        assert_eq!(first, second);

        let fresh = LabelResolver::new(Arc::new(StubProvider::new()));
        assert_eq!(fresh.resolve("wedding wear", &canonical()).unwrap(), first);
    }

    #[test]
    fn test_resolve_always_returns_a_match() {
        let resolver = LabelResolver::new(Arc::new(StubProvider::new()));
        let label = resolver.resolve("zzz qqq", &canonical()).unwrap();
        assert!(canonical().contains(&label));
    }

    #[test]
    fn test_repeated_labels_embedded_once() {
        let provider = Arc::new(StubProvider::new());
        let resolver = LabelResolver::new(provider.clone());
        let repeated: Vec<String> = ["Lehenga", "Saree", "Lehenga", "Saree"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(resolver.resolve("silk saree", &repeated).unwrap(), "Saree");
        // the raw label plus two distinct canonical ones
        assert_eq!(provider.texts_embedded(), 3);
    }

    #[test]
    fn test_ties_go_to_first_label() {
        let resolver = LabelResolver::new(Arc::new(StubProvider::new()));
        let duplicated = vec!["Saree".to_string(), "saree".to_string()];
        // both canonical labels embed identically
        assert_eq!(resolver.resolve("saree", &duplicated).unwrap(), "Saree");
    }

    #[test]
    fn test_canonical_set_embedded_once() {
        let provider = Arc::new(StubProvider::new());
        let resolver = LabelResolver::new(provider.clone());

        resolver.resolve("lehenga", &canonical()).unwrap();
        resolver.resolve("saree", &canonical()).unwrap();

        // two raw labels + one batched canonical call
        assert_eq!(provider.text_calls(), 3);
    }

    #[test]
    fn test_empty_canonical_set() {
        let resolver = LabelResolver::new(Arc::new(StubProvider::new()));
        assert!(matches!(
            resolver.resolve("lehenga", &[]),
            Err(ResolveError::EmptyCanonicalSet)
        ));
    }

    #[test]
    fn test_taxonomy_image_lookup() {
        let taxonomy = Taxonomy::new(crate::config::Config::default().taxonomy);
        assert_eq!(taxonomy.image_for("lehenga"), Some("categories/lehenga.webp"));
        assert_eq!(taxonomy.image_for("Tuxedo"), None);
    }
}
