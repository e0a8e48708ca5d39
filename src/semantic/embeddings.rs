//! Embedding provider for text and images.
//!
//! - Text goes through a fastembed text model; there is no fallback, a
//!   failure surfaces as [`EmbeddingError::Unavailable`].
//! - Images go through a fastembed image model first. When that tier cannot
//!   be used, local files fall back to a vector derived from a SHA-256 of the
//!   raw bytes. The tier is carried on [`ImageEmbedding`] and counted, the
//!   vector shape is the same for both.
//! - Every vector leaves this module L2-normalized.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fastembed::{ImageEmbedding as FastImageModel, ImageInitOptions, InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The model is loaded but could not embed this input.
    #[error("embedding failed: {0}")]
    Inference(String),

    #[error("invalid model name: {0}")]
    InvalidModel(String),

    #[error("cannot normalize a zero or non-finite vector")]
    ZeroNorm,

    #[error("invalid image source: {0}")]
    InvalidSource(String),

    #[error("failed to fetch image: {0}")]
    Fetch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A unit-length embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Normalize a raw model output to unit length.
    pub fn from_raw(mut values: Vec<f32>) -> Result<Self, EmbeddingError> {
        let norm = values
            .iter()
            .map(|x| (*x as f64) * (*x as f64))
            .sum::<f64>()
            .sqrt();

        if !norm.is_finite() || norm < f32::EPSILON as f64 {
            return Err(EmbeddingError::ZeroNorm);
        }

        for value in values.iter_mut() {
            *value = (*value as f64 / norm) as f32;
        }

        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Cosine similarity; both sides are unit length so this is the dot product.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum()
    }

    /// Base64 of the little-endian f32 bytes, for CSV columns.
    pub fn to_base64(&self) -> String {
        let bytes: Vec<u8> = self.0.iter().flat_map(|x| x.to_le_bytes()).collect();
        STANDARD.encode(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, EmbeddingError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EmbeddingError::InvalidSource(format!("bad vector encoding: {e}")))?;
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::InvalidSource(format!(
                "vector byte length {} is not a multiple of 4",
                bytes.len()
            )));
        }

        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_raw(values)
    }
}

/// Where an image to embed lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Path(PathBuf),
    Url(String),
}

impl ImageSource {
    /// Classify a raw image reference. `http(s)://` is a URL, anything else a path.
    pub fn parse(reference: &str) -> Result<Self, EmbeddingError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(EmbeddingError::InvalidSource("empty image reference".into()));
        }

        if reference.starts_with("http://") || reference.starts_with("https://") {
            let url = url::Url::parse(reference)
                .map_err(|e| EmbeddingError::InvalidSource(format!("{reference}: {e}")))?;
            return Ok(Self::Url(url.to_string()));
        }

        Ok(Self::Path(PathBuf::from(reference)))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ImageSource::Path(path) => Some(path),
            ImageSource::Url(_) => None,
        }
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSource::Path(path) => write!(f, "{}", path.display()),
            ImageSource::Url(url) => write!(f, "{url}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingTier {
    Model,
    HashFallback,
}

impl std::fmt::Display for EmbeddingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingTier::Model => write!(f, "model"),
            EmbeddingTier::HashFallback => write!(f, "hash_fallback"),
        }
    }
}

/// Image embedding tagged with the tier that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageEmbedding {
    Model(Embedding),
    HashFallback(Embedding),
}

impl ImageEmbedding {
    pub fn tier(&self) -> EmbeddingTier {
        match self {
            ImageEmbedding::Model(_) => EmbeddingTier::Model,
            ImageEmbedding::HashFallback(_) => EmbeddingTier::HashFallback,
        }
    }

    pub fn vector(&self) -> &Embedding {
        match self {
            ImageEmbedding::Model(v) | ImageEmbedding::HashFallback(v) => v,
        }
    }
}

/// Per-tier image embedding counters.
#[derive(Debug, Default)]
pub struct TierCounters {
    model: AtomicU64,
    hash_fallback: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub model: u64,
    pub hash_fallback: u64,
}

impl TierCounters {
    pub fn record(&self, tier: EmbeddingTier) {
        match tier {
            EmbeddingTier::Model => self.model.fetch_add(1, Ordering::Relaxed),
            EmbeddingTier::HashFallback => self.hash_fallback.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> TierCounts {
        TierCounts {
            model: self.model.load(Ordering::Relaxed),
            hash_fallback: self.hash_fallback.load(Ordering::Relaxed),
        }
    }
}

/// Converts text and images into unit-length vectors.
pub trait EmbeddingProvider: Send + Sync {
    fn text_dimensions(&self) -> usize;

    fn image_dimensions(&self) -> usize;

    /// Embed a batch of texts in one model call.
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError>;

    fn embed_text(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        self.embed_texts(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Unavailable("no embedding returned".to_string()))
    }

    fn embed_image(&self, source: &ImageSource) -> Result<ImageEmbedding, EmbeddingError>;

    fn tier_counts(&self) -> TierCounts {
        TierCounts::default()
    }
}

/// Derive a stable vector from raw image bytes.
///
/// SHA-256 of the bytes seeds a counter-mode SHA-256 stream; every 4 bytes
/// of the stream map to one component in [-1, 1]. Same bytes, same vector.
/// The result carries no semantic meaning.
pub fn hash_fallback_embedding(bytes: &[u8], dimensions: usize) -> Result<Embedding, EmbeddingError> {
    if dimensions == 0 {
        return Err(EmbeddingError::ZeroNorm);
    }

    let seed: [u8; 32] = Sha256::digest(bytes).into();
    let mut values = Vec::with_capacity(dimensions);
    let mut counter: u32 = 0;

    while values.len() < dimensions {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_le_bytes());
        let block = hasher.finalize();

        for chunk in block.chunks_exact(4) {
            if values.len() == dimensions {
                break;
            }
            let n = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            values.push(((n as f64 / u32::MAX as f64) * 2.0 - 1.0) as f32);
        }

        counter += 1;
    }

    Embedding::from_raw(values)
}

/// Two-tier image embedding: try `model`, fall back to the byte hash for
/// local files when allowed and the model itself is unavailable. Any other
/// model error belongs to the input and is returned as is.
pub fn embed_image_tiered<F>(
    source: &ImageSource,
    dimensions: usize,
    allow_fallback: bool,
    model: F,
) -> Result<ImageEmbedding, EmbeddingError>
where
    F: FnOnce(&ImageSource) -> Result<Embedding, EmbeddingError>,
{
    let model_err = match model(source) {
        Ok(vector) => return Ok(ImageEmbedding::Model(vector)),
        Err(err @ EmbeddingError::Unavailable(_)) => err,
        Err(err) => return Err(err),
    };

    if !allow_fallback {
        return Err(model_err);
    }

    let Some(path) = source.local_path() else {
        return Err(EmbeddingError::Unavailable(format!(
            "image model failed ({model_err}) and the hash fallback only accepts local files"
        )));
    };

    log::warn!("image model unavailable for {}: {model_err}; using hash fallback", path.display());

    let bytes = std::fs::read(path)?;
    Ok(ImageEmbedding::HashFallback(hash_fallback_embedding(
        &bytes, dimensions,
    )?))
}

/// Known text model with its output size.
#[derive(Debug, Clone)]
pub struct TextModelSpec {
    pub model: fastembed::EmbeddingModel,
    pub dimensions: usize,
}

/// Known image model with its output size.
#[derive(Debug, Clone)]
pub struct ImageModelSpec {
    pub model: fastembed::ImageEmbeddingModel,
    pub dimensions: usize,
}

/// Parse a text model name string to the fastembed enum.
pub fn parse_text_model(name: &str) -> Result<TextModelSpec, EmbeddingError> {
    let (model, dimensions) = match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => (fastembed::EmbeddingModel::AllMiniLML6V2Q, 384),
        "bge-small-en-v1.5" | "bgesmallenv15" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
        "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
            (fastembed::EmbeddingModel::BGESmallENV15Q, 384)
        }
        "bge-base-en-v1.5" | "bgebaseenv15" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
        "bge-base-en-v1.5-q" | "bgebaseenv15q" => (fastembed::EmbeddingModel::BGEBaseENV15Q, 768),
        "bge-large-en-v1.5" | "bgelargeenv15" => (fastembed::EmbeddingModel::BGELargeENV15, 1024),
        "bge-large-en-v1.5-q" | "bgelargeenv15q" => {
            (fastembed::EmbeddingModel::BGELargeENV15Q, 1024)
        }
        _ => {
            return Err(EmbeddingError::InvalidModel(format!(
                "Unknown text model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
                name
            )))
        }
    };

    Ok(TextModelSpec { model, dimensions })
}

/// Parse an image model name string to the fastembed enum.
pub fn parse_image_model(name: &str) -> Result<ImageModelSpec, EmbeddingError> {
    let (model, dimensions) = match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => (fastembed::ImageEmbeddingModel::ClipVitB32, 512),
        "resnet50" | "resnet-50" => (fastembed::ImageEmbeddingModel::Resnet50, 2048),
        "unicom-vit-b-16" | "unicomvitb16" => (fastembed::ImageEmbeddingModel::UnicomVitB16, 768),
        "unicom-vit-b-32" | "unicomvitb32" => (fastembed::ImageEmbeddingModel::UnicomVitB32, 512),
        _ => {
            return Err(EmbeddingError::InvalidModel(format!(
                "Unknown image model: {}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32",
                name
            )))
        }
    };

    Ok(ImageModelSpec { model, dimensions })
}

enum ImageModelState {
    Unloaded,
    Loaded(FastImageModel),
    /// Loading failed once; the reason is kept so it is logged only once.
    Unavailable(String),
}

/// fastembed-backed provider.
///
/// Models are loaded on first use into `<cache_dir>/models`.
/// Uses Mutexes because fastembed's embed() requires &mut self.
pub struct FastEmbedProvider {
    config: EmbeddingConfig,
    cache_dir: PathBuf,
    text_spec: TextModelSpec,
    image_spec: ImageModelSpec,
    text: Mutex<Option<TextEmbedding>>,
    image: Mutex<ImageModelState>,
    http: reqwest::blocking::Client,
    counters: TierCounters,
}

impl FastEmbedProvider {
    pub fn new(config: EmbeddingConfig, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let text_spec = parse_text_model(&config.text_model)?;
        let image_spec = parse_image_model(&config.image_model)?;

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Unavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            config,
            cache_dir,
            text_spec,
            image_spec,
            text: Mutex::new(None),
            image: Mutex::new(ImageModelState::Unloaded),
            http,
            counters: TierCounters::default(),
        })
    }

    fn models_dir(&self) -> Result<PathBuf, EmbeddingError> {
        let models_dir = self.cache_dir.join("models");
        std::fs::create_dir_all(&models_dir)?;
        Ok(models_dir)
    }

    fn load_text_model(&self) -> Result<TextEmbedding, EmbeddingError> {
        log::info!("loading text embedding model '{}'", self.config.text_model);

        let options = InitOptions::new(self.text_spec.model.clone())
            .with_cache_dir(self.models_dir()?)
            .with_show_download_progress(false);

        TextEmbedding::try_new(options).map_err(|e| EmbeddingError::Unavailable(e.to_string()))
    }

    fn load_image_model(&self) -> Result<FastImageModel, EmbeddingError> {
        log::info!("loading image embedding model '{}'", self.config.image_model);

        let options = ImageInitOptions::new(self.image_spec.model.clone())
            .with_cache_dir(self.models_dir()?)
            .with_show_download_progress(false);

        FastImageModel::try_new(options).map_err(|e| EmbeddingError::Unavailable(e.to_string()))
    }

    /// Run the image model on a local file, loading it on first use.
    fn model_embed_path(&self, path: &Path) -> Result<Embedding, EmbeddingError> {
        let mut state = self
            .image
            .lock()
            .map_err(|e| EmbeddingError::Unavailable(format!("image model lock poisoned: {e}")))?;

        if let ImageModelState::Unloaded = *state {
            *state = match self.load_image_model() {
                Ok(model) => ImageModelState::Loaded(model),
                Err(err) => {
                    log::error!("image model failed to load: {err}");
                    ImageModelState::Unavailable(err.to_string())
                }
            };
        }

        let model = match &mut *state {
            ImageModelState::Loaded(model) => model,
            ImageModelState::Unavailable(reason) => {
                return Err(EmbeddingError::Unavailable(reason.clone()))
            }
            ImageModelState::Unloaded => {
                return Err(EmbeddingError::Unavailable("image model not loaded".into()))
            }
        };

        let raw = model
            .embed(vec![path.to_path_buf()], None)
            .map_err(|e| EmbeddingError::Inference(format!("{}: {e}", path.display())))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Inference("no embedding returned".to_string()))?;

        Embedding::from_raw(raw)
    }

    /// Download a remote image into a temp file that lives as long as the handle.
    fn fetch_to_tempfile(&self, url: &str) -> Result<tempfile::NamedTempFile, EmbeddingError> {
        let response = self
            .http
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| EmbeddingError::Fetch(e.to_string()))?;
        let bytes = response
            .bytes()
            .map_err(|e| EmbeddingError::Fetch(e.to_string()))?;

        let mut file = tempfile::Builder::new().prefix("drape-img-").tempfile()?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(file)
    }

    fn model_embed(&self, source: &ImageSource) -> Result<Embedding, EmbeddingError> {
        match source {
            ImageSource::Path(path) => self.model_embed_path(path),
            ImageSource::Url(url) => {
                let file = self.fetch_to_tempfile(url)?;
                self.model_embed_path(file.path())
            }
        }
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn text_dimensions(&self) -> usize {
        self.text_spec.dimensions
    }

    fn image_dimensions(&self) -> usize {
        self.image_spec.dimensions
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut guard = self
            .text
            .lock()
            .map_err(|e| EmbeddingError::Unavailable(format!("text model lock poisoned: {e}")))?;

        if guard.is_none() {
            *guard = Some(self.load_text_model()?);
        }

        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::Unavailable("text model not loaded".into()))?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
            .into_iter()
            .map(Embedding::from_raw)
            .collect()
    }

    fn embed_image(&self, source: &ImageSource) -> Result<ImageEmbedding, EmbeddingError> {
        let embedding = embed_image_tiered(
            source,
            self.image_spec.dimensions,
            self.config.image_hash_fallback,
            |source| self.model_embed(source),
        )?;

        let tier = embedding.tier();
        self.counters.record(tier);
        tracing::info!(%tier, source = %source, "image embedded");

        Ok(embedding)
    }

    fn tier_counts(&self) -> TierCounts {
        self.counters.snapshot()
    }
}
