use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tenderlens::analysis::{
    ChatReply, CleanupReport, InsightsReport, OverviewReport, SectionsReport, SessionInit,
    SessionStatusView,
};
use tenderlens::config::init_tracing;
use tenderlens::session::SessionSummary;
use tenderlens::{AnalysisService, ChatTurn, RagError, ServiceConfig, StoreStats};
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(
    name = "tenderlens-api",
    about = "HTTP API for session-scoped tender analysis over pgvector"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "TENDERLENS_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    #[command(flatten)]
    service: ServiceConfig,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,

    /// Seconds between expired-session sweeps (0 disables the sweep).
    #[arg(long, env = "TENDERLENS_CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    cleanup_interval_secs: u64,
}

#[derive(Clone)]
struct AppState {
    service: AnalysisService,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct InitRequest {
    tender_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SectionsRequest {
    session_id: String,
    #[serde(default)]
    sections: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    session_id: String,
    question: String,
    #[serde(default)]
    conversation_history: Vec<ChatTurn>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self {
            status,
            body: ErrorBody {
                error: err.category(),
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn status_for(err: &RagError) -> StatusCode {
    match err {
        RagError::Validation(_) => StatusCode::BAD_REQUEST,
        RagError::NotFound(_) => StatusCode::NOT_FOUND,
        RagError::NotReady { .. } | RagError::InvalidTransition { .. } => StatusCode::CONFLICT,
        RagError::EmbeddingProvider { .. }
        | RagError::EmbeddingDimension { .. }
        | RagError::LlmProvider { .. }
        | RagError::LlmResponseFormat { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn too_many_requests() -> ApiError {
    ApiError {
        status: StatusCode::TOO_MANY_REQUESTS,
        body: ErrorBody {
            error: "rate_limited",
            message: "rate limit exceeded".to_string(),
        },
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = ApiCli::parse();
    let (service, _worker) = cli.service.build_service().await?;
    let state = AppState {
        service: service.clone(),
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };
    if cli.cleanup_interval_secs > 0 {
        spawn_cleanup(service, Duration::from_secs(cli.cleanup_interval_secs));
    }

    let app = router(state);
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    tracing::info!(%addr, "tenderlens-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/sessions", post(init_session).get(list_sessions))
        .route(
            "/v1/sessions/{session_id}",
            get(session_status).delete(delete_session),
        )
        .route("/v1/analysis/overview", post(overview))
        .route("/v1/analysis/sections", post(sections))
        .route("/v1/analysis/insights", post(insights))
        .route("/v1/chat", post(chat))
        .route("/v1/cleanup", post(cleanup))
        .route("/v1/stats", get(stats))
        .with_state(state)
}

fn spawn_cleanup(service: AnalysisService, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(err) = service.cleanup_expired(Utc::now()).await {
                tracing::warn!(error = %err, "expired session sweep failed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

impl AppState {
    async fn throttle(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.acquire(caller_key(headers)).await {
                return Err(too_many_requests());
            }
        }
        Ok(())
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn caller_key(headers: &HeaderMap) -> &str {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("anonymous")
}

fn user_id(headers: &HeaderMap) -> Result<i64, ApiError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| RagError::validation("x-user-id header is required"))?;
    raw.trim()
        .parse()
        .map_err(|_| RagError::validation("x-user-id must be an integer").into())
}

async fn init_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitRequest>,
) -> ApiResult<SessionInit> {
    state.throttle(&headers).await?;
    let user_id = user_id(&headers)?;
    let tender_id = request
        .tender_id
        .ok_or_else(|| RagError::validation("tender_id is required"))?;
    Ok(Json(state.service.init_session(tender_id, user_id).await?))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Vec<SessionSummary>> {
    Ok(Json(state.service.list_sessions().await?))
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionStatusView> {
    Ok(Json(state.service.session_status(&session_id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn overview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SessionRequest>,
) -> ApiResult<OverviewReport> {
    state.throttle(&headers).await?;
    Ok(Json(state.service.overview(&request.session_id).await?))
}

async fn sections(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SectionsRequest>,
) -> ApiResult<SectionsReport> {
    state.throttle(&headers).await?;
    Ok(Json(
        state
            .service
            .section_summaries(&request.session_id, &request.sections)
            .await?,
    ))
}

async fn insights(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SessionRequest>,
) -> ApiResult<InsightsReport> {
    state.throttle(&headers).await?;
    Ok(Json(state.service.insights(&request.session_id).await?))
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatReply> {
    state.throttle(&headers).await?;
    Ok(Json(
        state
            .service
            .chat(
                &request.session_id,
                &request.question,
                &request.conversation_history,
            )
            .await?,
    ))
}

async fn cleanup(State(state): State<AppState>) -> ApiResult<CleanupReport> {
    Ok(Json(state.service.cleanup_expired(Utc::now()).await?))
}

async fn stats(State(state): State<AppState>) -> ApiResult<StoreStats> {
    Ok(Json(state.service.stats().await?))
}

/// Token buckets per caller, keyed on the raw `x-user-id` header.
#[derive(Clone)]
struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
    }
}

/// Buckets tracked before full (idle) ones are dropped.
const MAX_TRACKED_CALLERS: usize = 4096;

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        Some(Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            capacity: burst as f64,
            refill_per_sec: max_per_minute as f64 / 60.0,
        })
    }

    async fn acquire(&self, caller: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        if buckets.len() >= MAX_TRACKED_CALLERS && !buckets.contains_key(caller) {
            let (capacity, rate) = (self.capacity, self.refill_per_sec);
            buckets.retain(|_, bucket| {
                bucket.refill(now, capacity, rate);
                bucket.tokens < capacity
            });
        }
        let bucket = buckets.entry(caller.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        bucket.refill(now, self.capacity, self.refill_per_sec);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
