use crate::{
    catalog::GeoPoint,
    errors::CoreError,
    jobs::JobView,
    ranking::{CategoryRanking, RankedEntity, SearchResponse},
    semantic::ImageSource,
    service::{RecommendationService, Stats},
};
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt::Debug, sync::Arc};
use tokio::signal;

/// Uploads are base64 in JSON, so the limit is a bit above the largest image we accept.
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

#[derive(Clone)]
struct SharedState {
    service: Arc<RecommendationService>,
}

pub fn router(service: Arc<RecommendationService>) -> Router {
    let shared_state = Arc::new(SharedState { service });

    Router::new()
        .route("/api/search", post(search))
        .route("/api/image-search", post(image_search))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/recommendations/nearby", post(nearby))
        .route("/api/recommendations/categories", post(categories))
        .route("/api/catalog/:id/changed", post(entity_changed))
        .route("/api/stats", get(stats))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutdown requested");
}

async fn start_app(service: Arc<RecommendationService>, listen_addr: String) -> anyhow::Result<()> {
    let app = router(service.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    log::info!("listening on {listen_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // join on worker threads
    tokio::task::block_in_place(|| service.shutdown());
    Ok(())
}

pub fn start_daemon(service: RecommendationService) -> anyhow::Result<()> {
    let listen_addr = service.context().config.listen_addr.clone();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(Arc::new(service), listen_addr).await })
}

#[derive(Debug)]
struct HttpError(CoreError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            CoreError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            CoreError::JobNotFound(_) | CoreError::EntityNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::DistanceService(_) => {
                log::warn!("{self:?}");
                StatusCode::BAD_GATEWAY
            }
            CoreError::ProviderUnavailable(_) | CoreError::StoreUnavailable(_) => {
                log::error!("{self:?}");
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<CoreError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub user_id: String,
    pub query: String,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        service
            .text_search(&payload.user_id, &payload.query)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Deserialize)]
pub struct ImageSearchRequest {
    pub user_id: String,
    pub image_b64: Option<String>,
    pub url: Option<String>,
}

impl Debug for ImageSearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ImageSearchRequest {{ user_id: {:?}, image_b64: [REDACTED], url: {:?} }}",
            self.user_id, self.url
        )
    }
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
}

async fn image_search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ImageSearchRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), HttpError> {
    log::debug!("payload: {payload:?}");

    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        if payload.user_id.trim().is_empty() {
            return Err(CoreError::MalformedInput("user_id is required".into()).into());
        }

        let (source, transient) = match (payload.image_b64, payload.url) {
            (Some(image_b64), None) => {
                let bytes = STANDARD
                    .decode(image_b64.trim())
                    .map_err(|e| CoreError::MalformedInput(format!("image_b64: {e}")))?;
                (service.save_upload(&bytes)?, true)
            }
            (None, Some(url)) => match ImageSource::parse(&url)? {
                source @ ImageSource::Url(_) => (source, false),
                ImageSource::Path(_) => {
                    return Err(
                        CoreError::MalformedInput("url must be http(s)".into()).into()
                    )
                }
            },
            _ => {
                return Err(CoreError::MalformedInput(
                    "exactly one of image_b64 and url is required".into(),
                )
                .into())
            }
        };

        let job_id = service.enqueue_image_search(&payload.user_id, source, transient)?;
        Ok((
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id: job_id.to_string(),
            }),
        ))
    })
}

async fn get_job(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || service.get_job(&id).map(Json).map_err(Into::into))
}

async fn list_jobs(State(state): State<Arc<SharedState>>) -> Json<Vec<JobView>> {
    let service = state.service.clone();
    Json(tokio::task::block_in_place(move || service.list_jobs()))
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    #[serde(default)]
    pub user_id: String,
    pub lat: f64,
    pub lng: f64,
}

impl LocationRequest {
    fn origin(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NearbyResponse {
    pub results: Vec<RankedEntity>,
}

async fn nearby(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<NearbyResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        service
            .recommended_near(&payload.user_id, payload.origin())
            .map(|results| Json(NearbyResponse { results }))
            .map_err(Into::into)
    })
}

async fn categories(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<CategoryRanking>, HttpError> {
    log::debug!("payload: {payload:?}");

    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        service
            .recommended_categories(&payload.user_id, payload.origin())
            .map(Json)
            .map_err(Into::into)
    })
}

async fn entity_changed(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
) -> Result<(StatusCode, Json<JobAccepted>), HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        let job_id = service.notify_entity_changed(id)?;
        Ok((
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id: job_id.to_string(),
            }),
        ))
    })
}

async fn stats(State(state): State<Arc<SharedState>>) -> Result<Json<Stats>, HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || service.stats().map(Json).map_err(Into::into))
}
