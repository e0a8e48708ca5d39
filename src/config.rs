use crate::storage::{self, StorageManager};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_WORKERS: u16 = 3;
const DEFAULT_KEEP_COMPLETED: usize = 100;
const DEFAULT_KEEP_FAILED: usize = 50;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_STALLED_JOBS: usize = 3;

/// Default text model (384 dimensions)
const DEFAULT_TEXT_MODEL: &str = "all-MiniLM-L6-v2";
/// Default image model (512 dimensions)
const DEFAULT_IMAGE_MODEL: &str = "clip-vit-b-32";
/// Default model download timeout in seconds
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;

const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

const DEFAULT_DISTANCE_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/distancematrix/json";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Number of concurrent similarity-search workers
    #[serde(default = "default_workers")]
    pub workers: u16,

    /// Completed jobs retained for inspection
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,

    /// Failed jobs retained for inspection
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,

    /// A job still running after this many seconds is failed
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Timed-out jobs whose threads may still be running before new jobs are
    /// refused outright
    #[serde(default = "default_max_stalled_jobs")]
    pub max_stalled_jobs: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            keep_completed: DEFAULT_KEEP_COMPLETED,
            keep_failed: DEFAULT_KEEP_FAILED,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            max_stalled_jobs: DEFAULT_MAX_STALLED_JOBS,
        }
    }
}

/// Configuration for the embedding provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Text model name (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_text_model")]
    pub text_model: String,

    /// Image model name (e.g., "clip-vit-b-32")
    #[serde(default = "default_image_model")]
    pub image_model: String,

    /// Use the hash-derived vector when the image model cannot be loaded
    #[serde(default = "default_true")]
    pub image_hash_fallback: bool,

    /// Timeout for downloading remote images in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            image_hash_fallback: true,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Qdrant,
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_backend")]
    pub backend: VectorBackend,

    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_text_collection")]
    pub text_collection: String,

    #[serde(default = "default_image_collection")]
    pub image_collection: String,

    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            url: DEFAULT_QDRANT_URL.to_string(),
            api_key: None,
            text_collection: default_text_collection(),
            image_collection: default_image_collection(),
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistanceConfig {
    #[serde(default = "default_distance_endpoint")]
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DISTANCE_ENDPOINT.to_string(),
            api_key: None,
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Geo+rating weights for the nearby ranking
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NearbyRanking {
    #[serde(default = "default_rating_weight")]
    pub rating_weight: f64,
    #[serde(default = "default_proximity_weight")]
    pub proximity_weight: f64,
    /// Distance at which proximity bottoms out at 0
    #[serde(default = "default_max_distance_km")]
    pub max_distance_km: f64,
    #[serde(default = "default_nearby_limit")]
    pub limit: usize,
    /// How many of the returned entities are logged as views
    #[serde(default = "default_view_log_top_k")]
    pub view_log_top_k: usize,
}

impl Default for NearbyRanking {
    fn default() -> Self {
        Self {
            rating_weight: default_rating_weight(),
            proximity_weight: default_proximity_weight(),
            max_distance_km: default_max_distance_km(),
            limit: default_nearby_limit(),
            view_log_top_k: default_view_log_top_k(),
        }
    }
}

/// Relevance+rating weights for text search reranking
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchRanking {
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,
    #[serde(default = "default_search_rating_weight")]
    pub rating_weight: f64,
}

impl Default for SearchRanking {
    fn default() -> Self {
        Self {
            relevance_weight: default_relevance_weight(),
            rating_weight: default_search_rating_weight(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default)]
    pub nearby: NearbyRanking,
    #[serde(default)]
    pub search: SearchRanking,
    /// Number of recent views used for category personalization
    #[serde(default = "default_personalization_window")]
    pub personalization_window: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            nearby: NearbyRanking::default(),
            search: SearchRanking::default(),
            personalization_window: default_personalization_window(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Minimum similarity score for vector hits [0.0, 1.0]
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    /// Hits fetched from the vector store before post-filters
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
    /// Entities returned when a search comes back empty
    #[serde(default = "default_fallback_sample_size")]
    pub fallback_sample_size: usize,
    /// Hits returned by an image search job
    #[serde(default = "default_image_result_limit")]
    pub image_result_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            candidate_limit: default_candidate_limit(),
            result_limit: default_result_limit(),
            fallback_sample_size: default_fallback_sample_size(),
            image_result_limit: default_image_result_limit(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityConfig {
    #[serde(default = "default_max_records_per_user")]
    pub max_records_per_user: usize,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            max_records_per_user: default_max_records_per_user(),
            max_age_days: default_max_age_days(),
        }
    }
}

/// A curated display category with its fixed representative image
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCategory {
    pub label: String,
    pub image: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub distance: DistanceConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default = "default_taxonomy")]
    pub taxonomy: Vec<CanonicalCategory>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: JobsConfig::default(),
            embeddings: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            distance: DistanceConfig::default(),
            ranking: RankingConfig::default(),
            search: SearchConfig::default(),
            activity: ActivityConfig::default(),
            taxonomy: default_taxonomy(),
            listen_addr: default_listen_addr(),
            base_path: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_workers() -> u16 {
    DEFAULT_WORKERS
}

fn default_keep_completed() -> usize {
    DEFAULT_KEEP_COMPLETED
}

fn default_keep_failed() -> usize {
    DEFAULT_KEEP_FAILED
}

fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}

fn default_max_stalled_jobs() -> usize {
    DEFAULT_MAX_STALLED_JOBS
}

fn default_text_model() -> String {
    DEFAULT_TEXT_MODEL.to_string()
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_vector_backend() -> VectorBackend {
    VectorBackend::Qdrant
}

fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

fn default_text_collection() -> String {
    "catalog_text".to_string()
}

fn default_image_collection() -> String {
    "catalog_images".to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_distance_endpoint() -> String {
    DEFAULT_DISTANCE_ENDPOINT.to_string()
}

fn default_rating_weight() -> f64 {
    0.6
}

fn default_proximity_weight() -> f64 {
    0.4
}

fn default_max_distance_km() -> f64 {
    30.0
}

fn default_nearby_limit() -> usize {
    10
}

fn default_view_log_top_k() -> usize {
    5
}

fn default_relevance_weight() -> f64 {
    0.75
}

fn default_search_rating_weight() -> f64 {
    0.25
}

fn default_personalization_window() -> usize {
    50
}

fn default_score_threshold() -> f32 {
    0.35
}

fn default_candidate_limit() -> usize {
    60
}

fn default_result_limit() -> usize {
    20
}

fn default_fallback_sample_size() -> usize {
    3
}

fn default_image_result_limit() -> usize {
    12
}

fn default_max_records_per_user() -> usize {
    500
}

fn default_max_age_days() -> u32 {
    90
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_taxonomy() -> Vec<CanonicalCategory> {
    [
        ("Lehenga", "categories/lehenga.webp"),
        ("Saree", "categories/saree.webp"),
        ("Anarkali", "categories/anarkali.webp"),
        ("Salwar Suit", "categories/salwar-suit.webp"),
        ("Gown", "categories/gown.webp"),
        ("Kurti", "categories/kurti.webp"),
        ("Sherwani", "categories/sherwani.webp"),
        ("Blouse", "categories/blouse.webp"),
    ]
    .into_iter()
    .map(|(label, image)| CanonicalCategory {
        label: label.to_string(),
        image: image.to_string(),
    })
    .collect()
}

impl Config {
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.jobs.workers == 0 {
            self.jobs.workers = 1
        }

        if self.jobs.job_timeout_secs == 0 {
            bail!("jobs.job_timeout_secs must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.search.score_threshold) {
            bail!(
                "search.score_threshold must be between 0.0 and 1.0, got {}",
                self.search.score_threshold
            );
        }

        if self.search.result_limit == 0 || self.search.fallback_sample_size == 0 {
            bail!("search.result_limit and search.fallback_sample_size must be positive");
        }

        if self.search.candidate_limit < self.search.result_limit {
            self.search.candidate_limit = self.search.result_limit;
        }

        let nearby = &self.ranking.nearby;
        if nearby.max_distance_km <= 0.0 {
            bail!(
                "ranking.nearby.max_distance_km must be positive, got {}",
                nearby.max_distance_km
            );
        }
        if nearby.rating_weight < 0.0 || nearby.proximity_weight < 0.0 {
            bail!("ranking.nearby weights must not be negative");
        }
        let search = &self.ranking.search;
        if search.relevance_weight < 0.0 || search.rating_weight < 0.0 {
            bail!("ranking.search weights must not be negative");
        }

        if self.taxonomy.is_empty() {
            bail!("taxonomy must contain at least one category");
        }

        if self.activity.max_records_per_user == 0 {
            bail!("activity.max_records_per_user must be greater than 0");
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}
