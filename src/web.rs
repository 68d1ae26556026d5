use crate::images::FetchError;
use crate::recommend::{
    BatchItem, Health, RecommendError, RecommendOptions, RecommendationService, Recommendations,
    RuleTarget, Stats, VisualQuery,
};
use crate::semantic::EncodingError;
use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    set_header::SetResponseHeaderLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Base64 uploads are about 4/3 of the image size.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
struct SharedState {
    service: Arc<RecommendationService>,
}

pub fn router(service: Arc<RecommendationService>) -> Router {
    let shared_state = Arc::new(SharedState { service });

    Router::new()
        .route("/health", get(health))
        .route("/api/recommendations/stats", get(stats))
        .route("/api/recommendations/similar", post(similar))
        .route("/api/recommendations/product/:id", get(product))
        .route("/api/recommendations/search-by-image", post(search_by_image))
        .route("/api/recommendations/personalized", post(personalized))
        .route("/api/recommendations/batch", post(batch))
        .route("/api/admin/reload", post(reload))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                        .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
                )
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                )),
        )
        .with_state(shared_state)
}

async fn start_app(service: Arc<RecommendationService>, listen: String) -> anyhow::Result<()> {
    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(err) = signal::ctrl_c().await {
                log::error!("failed to install Ctrl+C handler: {err}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    log::error!("failed to install signal handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        log::warn!("shutting down");
    }

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    log::info!("listening on {listen}");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

pub fn start_daemon(service: Arc<RecommendationService>, listen: String) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?
        .block_on(async { start_app(service, listen).await })
}

#[derive(Debug)]
struct HttpError(RecommendError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            RecommendError::NotFound(_) => StatusCode::NOT_FOUND,
            RecommendError::Validation(_) => StatusCode::BAD_REQUEST,
            RecommendError::Encoding(err) => encoding_status(err),
            RecommendError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            RecommendError::IndexUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            RecommendError::Busy(_) => StatusCode::CONFLICT,
            RecommendError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("{self:?}");
        }

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

/// Bad input is the caller's fault; everything else is ours or upstream's.
fn encoding_status(err: &EncodingError) -> StatusCode {
    match err {
        EncodingError::Decode(_) | EncodingError::EmptyText | EncodingError::NoImage(_) => {
            StatusCode::BAD_REQUEST
        }
        EncodingError::Fetch(FetchError::InvalidUrl(_) | FetchError::TooLarge(_)) => {
            StatusCode::BAD_REQUEST
        }
        EncodingError::Fetch(FetchError::Request(_) | FetchError::Status(_)) => {
            StatusCode::BAD_GATEWAY
        }
        EncodingError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        EncodingError::InitFailed(_)
        | EncodingError::InvalidModel(_)
        | EncodingError::Inference(_)
        | EncodingError::Degenerate
        | EncodingError::DimensionMismatch { .. }
        | EncodingError::WorkerLost => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl<E> From<E> for HttpError
where
    E: Into<RecommendError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<Health> {
    Json(state.service.health())
}

async fn stats(State(state): State<Arc<SharedState>>) -> Json<Stats> {
    Json(state.service.stats())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarRequest {
    pub product_id: String,
    pub limit: Option<usize>,
    #[serde(default)]
    pub options: RecommendOptions,
}

async fn similar(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SimilarRequest>,
) -> Result<Json<Recommendations>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .similar_by_product(&payload.product_id, payload.limit, &payload.options)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductQuery {
    pub limit: Option<usize>,
    pub same_category_only: Option<bool>,
    pub min_similarity: Option<f32>,
}

async fn product(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    Query(query): Query<ProductQuery>,
) -> Result<Json<Recommendations>, HttpError> {
    let options = RecommendOptions {
        same_category_only: query.same_category_only,
        min_similarity: query.min_similarity,
        ..Default::default()
    };

    tokio::task::block_in_place(move || {
        state
            .service
            .similar_by_product(&id, query.limit, &options)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSearchRequest {
    pub image_url: Option<String>,
    pub image_b64: Option<String>,
    pub text: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub options: RecommendOptions,
    pub reference: Option<RuleTarget>,
}

impl Debug for ImageSearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImageSearchRequest {{ image_url: {:?}, image_b64: [REDACTED], text: {:?}, limit: {:?}, options: {:?}, reference: {:?} }}", self.image_url, self.text, self.limit, self.options, self.reference)
    }
}

impl ImageSearchRequest {
    fn query(&self) -> Result<VisualQuery, RecommendError> {
        match (&self.image_url, &self.image_b64, &self.text) {
            (Some(url), None, None) => Ok(VisualQuery::ImageUrl(url.clone())),
            (None, Some(b64), None) => STANDARD
                .decode(b64.trim())
                .map(VisualQuery::Image)
                .map_err(|e| RecommendError::Validation(format!("imageB64 is not valid base64: {e}"))),
            (None, None, Some(text)) => Ok(VisualQuery::Text(text.clone())),
            _ => Err(RecommendError::Validation(
                "exactly one of imageUrl, imageB64 or text is required".into(),
            )),
        }
    }
}

async fn search_by_image(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ImageSearchRequest>,
) -> Result<Json<Recommendations>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || -> Result<Json<Recommendations>, HttpError> {
        let query = payload.query()?;
        state
            .service
            .similar_by_image(
                query,
                payload.reference.as_ref(),
                payload.limit,
                &payload.options,
            )
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalizedRequest {
    #[serde(default)]
    pub recent_item_ids: Vec<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub options: RecommendOptions,
    pub reference: Option<RuleTarget>,
}

async fn personalized(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<PersonalizedRequest>,
) -> Result<Json<Recommendations>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .personalized(
                &payload.recent_item_ids,
                payload.reference.as_ref(),
                payload.limit,
                &payload.options,
            )
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub product_ids: Vec<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub options: RecommendOptions,
}

async fn batch(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<BatchRequest>,
) -> Result<Json<BTreeMap<String, BatchItem>>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .batch(&payload.product_ids, payload.limit, &payload.options)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn reload(State(state): State<Arc<SharedState>>) -> Result<Json<Stats>, HttpError> {
    tokio::task::block_in_place(move || state.service.reload().map(Json).map_err(Into::into))
}
