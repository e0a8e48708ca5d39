//! Embedding and vector-search infrastructure.
//!
//! # Architecture
//!
//! - `embeddings`: text/image embedding provider with a hash fallback tier for images
//! - `store`: vector store contract and the typed payloads stored with each vector
//! - `qdrant`: reconnecting Qdrant REST gateway
//! - `index`: in-process cosine index implementing the same contract
//! - `resolver`: nearest-label mapping onto the canonical taxonomy
//! - `preprocess`: entity text preparation and content hashing

pub mod embeddings;
mod index;
mod preprocess;
mod qdrant;
mod resolver;
mod store;

pub use embeddings::{
    Embedding, EmbeddingError, EmbeddingProvider, EmbeddingTier, FastEmbedProvider, ImageEmbedding,
    ImageSource, TierCounts,
};
pub use index::MemoryVectorStore;
pub use preprocess::{content_hash, preprocess_content};
pub use qdrant::QdrantGateway;
pub use resolver::{LabelResolver, ResolveError, Taxonomy};
pub use store::{BoutiqueHit, DressTypeHit, HitPayload, ScoredHit, StoreError, VectorStore};
