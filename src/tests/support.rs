//! Deterministic stand-ins for the embedding model and the distance service,
//! plus a harness that wires them into a real service over a temp directory.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::{
    activity::ActivityLedger,
    catalog::{CatalogCsv, CatalogEntity, CatalogStore, EntityKind, GeoPoint, RatingSummary},
    config::Config,
    context::{AppContext, ACTIVITY_FILE, CATALOG_FILE, UPLOADS_DIR},
    distance::{DistanceError, DistanceService},
    jobs::JobView,
    semantic::{
        embeddings::{embed_image_tiered, TierCounters},
        Embedding, EmbeddingError, EmbeddingProvider, ImageEmbedding, ImageSource, LabelResolver,
        MemoryVectorStore, Taxonomy, TierCounts,
    },
    service::RecommendationService,
    storage::BackendLocal,
};

pub const DIM: usize = 768;

/// Bag-of-words embedding: each lowercase token adds 1 to a hashed bucket,
/// bucket 0 carries a small constant so no text maps to the zero vector.
pub fn bag_of_words(text: &str) -> Result<Embedding, EmbeddingError> {
    let mut values = vec![0.0f32; DIM];
    values[0] = 0.25;

    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let bucket = 1 + (u64::from_le_bytes(bytes) % (DIM as u64 - 1)) as usize;
        values[bucket] += 1.0;
    }

    Embedding::from_raw(values)
}

#[derive(Debug, Default)]
pub struct StubProvider {
    text_calls: AtomicUsize,
    texts_embedded: AtomicUsize,
    fail_text: AtomicBool,
    fail_image: AtomicBool,
    image_model_down: AtomicBool,
    undecodable_images: AtomicBool,
    image_delay_ms: AtomicU64,
    images_in_flight: AtomicUsize,
    images_peak: AtomicUsize,
    tiers: TierCounters,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `embed_texts` calls so far.
    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    /// Number of individual texts embedded so far.
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    pub fn fail_text(&self, fail: bool) {
        self.fail_text.store(fail, Ordering::SeqCst);
    }

    /// Every image request fails, fallback included.
    pub fn fail_image(&self, fail: bool) {
        self.fail_image.store(fail, Ordering::SeqCst);
    }

    /// Only the model tier fails; local files go through the hash fallback.
    pub fn image_model_down(&self, down: bool) {
        self.image_model_down.store(down, Ordering::SeqCst);
    }

    /// The model is up but cannot decode any image it is given.
    pub fn undecodable_images(&self, undecodable: bool) {
        self.undecodable_images.store(undecodable, Ordering::SeqCst);
    }

    pub fn image_delay(&self, delay: Duration) {
        self.image_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Most `embed_image` calls that were ever running at the same time.
    pub fn images_peak(&self) -> usize {
        self.images_peak.load(Ordering::SeqCst)
    }

    fn embed_image_now(&self, source: &ImageSource) -> Result<ImageEmbedding, EmbeddingError> {
        let delay = self.image_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_image.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("image provider is down".into()));
        }

        let model_down = self.image_model_down.load(Ordering::SeqCst);
        let undecodable = self.undecodable_images.load(Ordering::SeqCst);
        let embedding = embed_image_tiered(source, DIM, true, |source| {
            if model_down {
                return Err(EmbeddingError::Unavailable("image model is down".into()));
            }
            if undecodable {
                return Err(EmbeddingError::Inference(format!("{source}: cannot decode")));
            }
            match source {
                // "pixels" are the words in the file
                ImageSource::Path(path) => bag_of_words(&String::from_utf8_lossy(&std::fs::read(path)?)),
                ImageSource::Url(url) => Err(EmbeddingError::Fetch(format!("{url}: offline"))),
            }
        })?;

        self.tiers.record(embedding.tier());
        Ok(embedding)
    }
}

impl EmbeddingProvider for StubProvider {
    fn text_dimensions(&self) -> usize {
        DIM
    }

    fn image_dimensions(&self) -> usize {
        DIM
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_text.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("text model is down".into()));
        }
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        texts.iter().map(|t| bag_of_words(t)).collect()
    }

    fn embed_image(&self, source: &ImageSource) -> Result<ImageEmbedding, EmbeddingError> {
        let running = self.images_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.images_peak.fetch_max(running, Ordering::SeqCst);

        let result = self.embed_image_now(source);

        self.images_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn tier_counts(&self) -> TierCounts {
        self.tiers.snapshot()
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[derive(Debug, Default)]
pub struct StubDistance {
    calls: AtomicUsize,
    failing: AtomicBool,
    unroutable: Mutex<Vec<GeoPoint>>,
}

impl StubDistance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Report no route to `point` from now on.
    pub fn unroutable(&self, point: GeoPoint) {
        self.unroutable.lock().unwrap().push(point);
    }
}

impl DistanceService for StubDistance {
    fn distances(
        &self,
        origin: GeoPoint,
        destinations: &[GeoPoint],
    ) -> Result<Vec<Option<f64>>, DistanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DistanceError::Unreachable("connection refused".into()));
        }

        let unroutable = self.unroutable.lock().unwrap();
        Ok(destinations
            .iter()
            .map(|d| (!unroutable.contains(d)).then(|| haversine_m(origin, *d)))
            .collect())
    }
}

/// Where the user stands in the harness catalogue.
pub const ORIGIN: GeoPoint = GeoPoint {
    lat: 17.415,
    lng: 78.435,
};

pub const ZARI_HOUSE: u64 = 1;
pub const SILK_ROUTE: u64 = 2;
pub const GROOM_SHERWANI: u64 = 3;
pub const GOWN_GALLERY: u64 = 4;
pub const KURTI_CORNER: u64 = 5;
pub const RED_LEHENGA: u64 = 6;

#[allow(clippy::too_many_arguments)]
pub fn entity(
    id: u64,
    kind: EntityKind,
    name: &str,
    area: &str,
    category: &str,
    catalogue: &str,
    location: Option<(f64, f64)>,
    rating: f64,
) -> CatalogEntity {
    CatalogEntity {
        id,
        kind,
        boutique_id: (kind == EntityKind::DressType).then_some(ZARI_HOUSE),
        name: name.into(),
        area: area.into(),
        category: category.into(),
        catalogue: catalogue.into(),
        location: location.map(|(lat, lng)| GeoPoint { lat, lng }),
        rating: RatingSummary {
            mean: rating,
            count: 12,
        },
        image: None,
        created_at: id as i64 * 1000,
        content_hash: None,
        embedding: None,
    }
}

/// A small Hyderabad catalogue. Image files hold the words they "show".
pub fn seed_catalogue() -> Vec<CatalogEntity> {
    use EntityKind::{Boutique, DressType};

    let mut zari = entity(
        ZARI_HOUSE,
        Boutique,
        "Zari House",
        "Banjara Hills",
        "bridal lehenga",
        "silk lehenga choli",
        Some((17.412, 78.440)),
        4.6,
    );
    zari.image = Some("images/zari.jpg".into());

    let mut silk_route = entity(
        SILK_ROUTE,
        Boutique,
        "Silk Route",
        "Jubilee Hills",
        "saree",
        "kanjivaram silk saree",
        Some((17.430, 78.410)),
        3.9,
    );
    silk_route.image = Some("images/silk-route.jpg".into());

    let mut gowns = entity(
        GOWN_GALLERY,
        Boutique,
        "Gown Gallery",
        "Secunderabad",
        "gown",
        "evening gown",
        Some((17.900, 79.000)),
        5.0,
    );
    gowns.image = Some("https://cdn.example.com/gown.jpg".into());

    vec![
        zari,
        silk_route,
        entity(
            GROOM_SHERWANI,
            DressType,
            "Groom Sherwani",
            "Banjara Hills",
            "sherwani",
            "wedding sherwani",
            Some((17.413, 78.441)),
            4.2,
        ),
        gowns,
        entity(
            KURTI_CORNER,
            Boutique,
            "Kurti Corner",
            "Kondapur",
            "kurti",
            "cotton kurti",
            None,
            4.8,
        ),
        entity(
            RED_LEHENGA,
            DressType,
            "Red Lehenga",
            "Banjara Hills",
            "lehenga",
            "red bridal lehenga",
            Some((17.412, 78.440)),
            4.0,
        ),
    ]
}

pub struct Harness {
    pub provider: Arc<StubProvider>,
    pub distance: Arc<StubDistance>,
    pub service: Arc<RecommendationService>,
    tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Seeded, fully indexed service; `tweak` adjusts the loaded config.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().to_path_buf();

        let mut config = Config::load_with(base.to_str().unwrap()).unwrap();
        config.jobs.workers = 2;
        tweak(&mut config);

        std::fs::create_dir_all(base.join("images")).unwrap();
        std::fs::write(base.join("images/zari.jpg"), "zari bridal lehenga choli").unwrap();
        std::fs::write(base.join("images/silk-route.jpg"), "kanjivaram silk saree").unwrap();

        let catalog = Arc::new(CatalogCsv::load(base.join(CATALOG_FILE)).unwrap());
        for entity in seed_catalogue() {
            catalog.upsert(entity).unwrap();
        }

        let provider = Arc::new(StubProvider::new());
        let distance = Arc::new(StubDistance::new());
        let dyn_provider: Arc<dyn EmbeddingProvider> = provider.clone();

        let ctx = AppContext {
            ledger: Arc::new(
                ActivityLedger::open(
                    base.join(ACTIVITY_FILE),
                    dyn_provider.clone(),
                    config.activity.clone(),
                )
                .unwrap(),
            ),
            resolver: Arc::new(LabelResolver::new(dyn_provider.clone())),
            taxonomy: Arc::new(Taxonomy::new(config.taxonomy.clone())),
            text_store: Arc::new(MemoryVectorStore::new(DIM)),
            image_store: Arc::new(MemoryVectorStore::new(DIM)),
            storage: Arc::new(BackendLocal::new(&base).unwrap()),
            uploads: Arc::new(BackendLocal::new(base.join(UPLOADS_DIR)).unwrap()),
            config: Arc::new(config),
            provider: dyn_provider,
            catalog,
            distance: distance.clone(),
        };

        let service = RecommendationService::new(ctx).unwrap();
        let report = service.reindex(|_, _| {}).unwrap();
        assert_eq!(report.failed, 0);

        Self {
            provider,
            distance,
            service: Arc::new(service),
            tmp,
        }
    }

    pub fn ctx(&self) -> &AppContext {
        self.service.context()
    }

    pub fn base(&self) -> &Path {
        self.tmp.path()
    }

    /// Drop a file into the uploads directory, as `save_upload` would.
    pub fn write_upload(&self, name: &str, content: &str) -> PathBuf {
        let path = self.base().join(UPLOADS_DIR).join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn wait_for(&self, job_id: &str) -> JobView {
        wait_for(&self.service, job_id)
    }
}

/// Poll a job until it reaches a terminal state.
pub fn wait_for(service: &RecommendationService, job_id: &str) -> JobView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = service.get_job(job_id).unwrap();
        if view.state == "completed" || view.state == "failed" {
            return view;
        }
        assert!(Instant::now() < deadline, "job {job_id} did not finish");
        std::thread::sleep(Duration::from_millis(20));
    }
}
