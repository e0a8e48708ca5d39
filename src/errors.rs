use crate::{
    distance::DistanceError,
    semantic::{EmbeddingError, ResolveError, StoreError},
};

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ranking unavailable: {0}")]
    DistanceService(#[from] DistanceError),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("entity {0} not found")]
    EntityNotFound(u64),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<EmbeddingError> for CoreError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::InvalidSource(msg) => CoreError::MalformedInput(msg),
            EmbeddingError::Inference(msg) => CoreError::MalformedInput(msg),
            other => CoreError::ProviderUnavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::StoreUnavailable(err.to_string())
    }
}

impl From<ResolveError> for CoreError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::EmptyCanonicalSet => CoreError::MalformedInput(err.to_string()),
            ResolveError::Embedding(err) => err.into(),
        }
    }
}
