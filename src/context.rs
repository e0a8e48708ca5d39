use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context};
use homedir::my_home;

use crate::{
    activity::ActivityLedger,
    catalog::{CatalogCsv, CatalogStore},
    config::{Config, VectorBackend},
    distance::{DistanceMatrixClient, DistanceService},
    semantic::{
        EmbeddingProvider, FastEmbedProvider, ImageSource, LabelResolver, MemoryVectorStore,
        QdrantGateway, StoreError, Taxonomy, VectorStore,
    },
    storage::{BackendLocal, StorageManager},
};

pub const CATALOG_FILE: &str = "catalog.csv";
pub const ACTIVITY_FILE: &str = "activity.csv";
pub const UPLOADS_DIR: &str = "uploads";

/// Every initialized client the engine works with.
///
/// Built once at startup and passed by reference (or cheaply cloned) into
/// each component; there are no global clients.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub text_store: Arc<dyn VectorStore>,
    pub image_store: Arc<dyn VectorStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub ledger: Arc<ActivityLedger>,
    pub distance: Arc<dyn DistanceService>,
    pub resolver: Arc<LabelResolver>,
    pub taxonomy: Arc<Taxonomy>,
    /// Base directory: job queue dump
    pub storage: Arc<dyn StorageManager>,
    /// Transient image uploads, deleted once their job finishes
    pub uploads: Arc<BackendLocal>,
}

/// `DRAPE_BASE_PATH`, or `~/.local/share/drape`.
pub fn default_base_path() -> anyhow::Result<String> {
    if let Ok(base_path) = std::env::var("DRAPE_BASE_PATH") {
        return Ok(base_path);
    }

    let home = my_home()
        .context("could not determine home directory")?
        .ok_or_else(|| anyhow!("home directory path is empty"))?;

    Ok(format!("{}/.local/share/drape", home.to_string_lossy()))
}

impl AppContext {
    pub fn init(config: Config) -> anyhow::Result<Self> {
        let base_path = PathBuf::from(config.base_path());
        std::fs::create_dir_all(&base_path)?;

        let provider: Arc<dyn EmbeddingProvider> = Arc::new(FastEmbedProvider::new(
            config.embeddings.clone(),
            base_path.clone(),
        )?);

        let text_dims = provider.text_dimensions();
        let image_dims = provider.image_dimensions();
        let (text_store, image_store): (Arc<dyn VectorStore>, Arc<dyn VectorStore>) =
            match config.vector_store.backend {
                VectorBackend::Qdrant => (
                    Arc::new(QdrantGateway::new(
                        &config.vector_store,
                        &config.vector_store.text_collection,
                        text_dims,
                    )),
                    Arc::new(QdrantGateway::new(
                        &config.vector_store,
                        &config.vector_store.image_collection,
                        image_dims,
                    )),
                ),
                VectorBackend::Memory => {
                    log::warn!("using in-memory vector store; vectors are lost on exit");
                    (
                        Arc::new(MemoryVectorStore::new(text_dims)),
                        Arc::new(MemoryVectorStore::new(image_dims)),
                    )
                }
            };

        let catalog = Arc::new(CatalogCsv::load(base_path.join(CATALOG_FILE))?);
        let ledger = Arc::new(ActivityLedger::open(
            base_path.join(ACTIVITY_FILE),
            provider.clone(),
            config.activity.clone(),
        )?);
        let distance = Arc::new(DistanceMatrixClient::new(&config.distance)?);

        Ok(Self {
            resolver: Arc::new(LabelResolver::new(provider.clone())),
            taxonomy: Arc::new(Taxonomy::new(config.taxonomy.clone())),
            storage: Arc::new(BackendLocal::new(&base_path)?),
            uploads: Arc::new(BackendLocal::new(base_path.join(UPLOADS_DIR))?),
            config: Arc::new(config),
            provider,
            text_store,
            image_store,
            catalog,
            ledger,
            distance,
        })
    }

    pub fn base_path(&self) -> &Path {
        Path::new(self.config.base_path())
    }

    /// Create both collections. Safe to call on every start.
    pub fn provision(&self) -> Result<(), StoreError> {
        self.text_store.provision()?;
        self.image_store.provision()?;
        Ok(())
    }

    /// Resolve a catalogue image reference; relative paths live under the base directory.
    pub fn image_source(&self, reference: &str) -> Option<ImageSource> {
        match ImageSource::parse(reference).ok()? {
            ImageSource::Path(path) if path.is_relative() => {
                Some(ImageSource::Path(self.base_path().join(path)))
            }
            source => Some(source),
        }
    }
}
