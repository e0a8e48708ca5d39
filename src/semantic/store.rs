//! Vector store boundary: the trait every backend implements and the typed
//! payloads stored next to each vector.

use serde::{Deserialize, Serialize};

use super::embeddings::Embedding;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("vector store rejected request: {0}")]
    Rejected(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Denormalized fields of a boutique, kept for result display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoutiqueHit {
    pub entity_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Denormalized fields of a dress-type offering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DressTypeHit {
    pub entity_id: u64,
    pub boutique_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HitPayload {
    Boutique(BoutiqueHit),
    DressType(DressTypeHit),
}

impl HitPayload {
    /// Parse a raw payload map, rejecting anything that is not a known kind.
    pub fn from_value(value: serde_json::Value) -> Result<Self, StoreError> {
        serde_json::from_value(value).map_err(|e| StoreError::InvalidPayload(e.to_string()))
    }

    pub fn entity_id(&self) -> u64 {
        match self {
            HitPayload::Boutique(hit) => hit.entity_id,
            HitPayload::DressType(hit) => hit.entity_id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            HitPayload::Boutique(hit) => hit.name.as_deref(),
            HitPayload::DressType(hit) => hit.name.as_deref(),
        }
    }

    pub fn area(&self) -> Option<&str> {
        match self {
            HitPayload::Boutique(hit) => hit.area.as_deref(),
            HitPayload::DressType(hit) => hit.area.as_deref(),
        }
    }

    /// A hit can be shown to users only with a non-empty name and area.
    pub fn is_displayable(&self) -> bool {
        let present = |v: Option<&str>| v.map(|s| !s.trim().is_empty()).unwrap_or(false);
        present(self.name()) && present(self.area())
    }
}

/// One similarity search result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub id: u64,
    pub payload: HitPayload,
    pub score: f32,
}

/// A remote (or in-process) similarity index over one collection.
///
/// Each operation is atomic from the caller's point of view; implementations
/// are shared between request threads and job workers.
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist yet.
    fn provision(&self) -> Result<(), StoreError>;

    fn upsert(&self, id: u64, vector: &Embedding, payload: &HitPayload) -> Result<(), StoreError>;

    /// Hits ordered by descending score, none below `score_threshold`.
    fn search(
        &self,
        vector: &Embedding,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredHit>, StoreError>;

    fn delete(&self, id: u64) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_round_trip_tag() {
        let payload = HitPayload::DressType(DressTypeHit {
            entity_id: 7,
            boutique_id: 3,
            name: Some("Bridal Lehenga".into()),
            ..Default::default()
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "dress_type");
        assert_eq!(value["boutique_id"], 3);
        assert!(value.get("area").is_none());
    }

    #[test]
    fn test_payload_rejects_unknown_kind() {
        let result = HitPayload::from_value(json!({"kind": "order", "entity_id": 1}));
        assert!(matches!(result, Err(StoreError::InvalidPayload(_))));

        let result = HitPayload::from_value(json!({"name": "no kind"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_displayable_requires_name_and_area() {
        let full = HitPayload::from_value(json!({
            "kind": "boutique", "entity_id": 1, "name": "Zari House", "area": "Banjara Hills"
        }))
        .unwrap();
        let no_area = HitPayload::from_value(json!({
            "kind": "boutique", "entity_id": 2, "name": "Zari House"
        }))
        .unwrap();
        let blank_name = HitPayload::from_value(json!({
            "kind": "boutique", "entity_id": 3, "name": "  ", "area": "Kondapur"
        }))
        .unwrap();

        assert!(full.is_displayable());
        assert!(!no_area.is_displayable());
        assert!(!blank_name.is_displayable());
    }
}
