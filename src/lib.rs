//! Core library for Ouija.  This module wires the admission controller,
//! question validation, the streaming oracle client and the bounded
//! history into an Axum router.

mod config;
pub mod history;
pub mod limiter;
pub mod metrics;
pub mod oracle;
pub mod prompt;
pub mod validate;

pub use config::AppConfig;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody},
    DefaultBodyLimit, Request, State,
};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::history::{History, MemoryHistory, QuestionAnswerPair};
use crate::limiter::{client_identity, Admission, RateLimiter, SWEEP_INTERVAL};
use crate::metrics::{Metrics, Snapshot};
use crate::oracle::OracleClient;

pub use crate::oracle::{InferenceOutcome, FALLBACK_ANSWER};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AskResponse {
    pub answer: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

/// Application state shared across handlers.  Every mutable structure is
/// owned here and reached through an `Arc`; nothing is process-global.
#[derive(Clone)]
pub struct AppState {
    pub oracle: Arc<OracleClient>,
    pub history: Arc<dyn History>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    /// Cancelled when in-flight upstream calls must be abandoned.
    pub shutdown: CancellationToken,
    /// Maximum accepted raw request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    /// Requests still running after this long are answered with 408.
    pub request_timeout: Duration,
    pub template_dir: PathBuf,
    pub static_dir: PathBuf,
}

/// Build state from an explicit configuration.  Spawns the rate limiter's
/// expiry sweep on the current runtime.
pub async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let oracle = OracleClient::new(
        config.ollama_url.clone(),
        config.ollama_model.clone(),
        config.ollama_timeout,
        config.max_tokens,
    )?;
    let limiter = Arc::new(RateLimiter::new(config.rate_limit));
    limiter.spawn_sweeper(SWEEP_INTERVAL);

    tracing::debug!(
        url = %config.ollama_url,
        model = %config.ollama_model,
        timeout_ms = config.ollama_timeout.as_millis() as u64,
        history = config.max_history_size,
        rate = config.rate_limit,
        "state initialised"
    );

    Ok(AppState {
        oracle: Arc::new(oracle),
        history: Arc::new(MemoryHistory::new(config.max_history_size)),
        limiter,
        metrics: Arc::new(Metrics::new()),
        shutdown: CancellationToken::new(),
        max_request_bytes: config.max_request_bytes,
        request_timeout: config.request_timeout,
        template_dir: config.template_dir.clone(),
        static_dir: config.static_dir.clone(),
    })
}

/// Build state from environment variables.  See [`AppConfig::from_env`]
/// for the variables read.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state(&config).await
}

/// Build the Axum router and attach handlers.  `/`, `/ask`, `/history` and
/// `/static` sit behind the rate limiter; `/healthz` and `/metrics` do not.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;
    let request_timeout = state.request_timeout;

    let router = Router::new()
        .route("/", get(index_handler))
        .route("/ask", post(ask_handler))
        .route("/history", get(history_handler))
        .nest_service("/static", ServeDir::new(&state.static_dir))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(
                "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; img-src 'self' data:",
            ),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Time given to handlers to write their fallback answers once in-flight
/// generations are cancelled at the end of the shutdown grace period.
pub const CANCEL_DRAIN: Duration = Duration::from_secs(1);

/// Serves the app on `listener` until `stopping` is cancelled.
///
/// Shutdown stops accepting connections and lets in-flight requests finish
/// for up to `grace`. Generations still running after that are cancelled,
/// which makes their handlers answer with the fallback, and the server gets
/// [`CANCEL_DRAIN`] more to flush those responses before it is dropped.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    stopping: CancellationToken,
    grace: Duration,
) -> std::io::Result<()> {
    let in_flight = state.shutdown.clone();
    let graceful = stopping.clone();
    let server = axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { graceful.cancelled().await });
    let server = async move { server.await };
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => return res,
        _ = grace_expired(&stopping, grace) => {}
    }

    tracing::warn!(
        grace_ms = grace.as_millis() as u64,
        "graceful shutdown timed out, cancelling in-flight generations"
    );
    in_flight.cancel();
    match tokio::time::timeout(CANCEL_DRAIN, &mut server).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!("connections still open after cancellation, dropping them");
            Ok(())
        }
    }
}

async fn grace_expired(stopping: &CancellationToken, grace: Duration) {
    stopping.cancelled().await;
    tokio::time::sleep(grace).await;
}

fn respond_with_error(status: StatusCode, message: impl Into<String>) -> Response {
    let err = ErrorResponse {
        error: message.into(),
    };
    (status, Json(err)).into_response()
}

/// Rejects the request with 429 before any other work when the caller's
/// bucket is empty.
async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = client_identity(request.headers(), request.extensions());
    match state.limiter.check(&identity) {
        Admission::Allowed => next.run(request).await,
        Admission::Limited { retry_after } => {
            Metrics::incr(&state.metrics.rate_limited_total);
            tracing::info!(identity = %identity, path = %request.uri().path(), "rate limit exceeded");
            let mut resp = respond_with_error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
            resp
        }
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    (wait.as_secs_f64().ceil() as u64).max(1)
}

/// Handler for `POST /ask`.  Validates the question, asks the oracle and
/// records the pair.  Upstream failures arrive here as the fallback answer
/// and are answered with 200 like any other answer.
async fn ask_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    Metrics::incr(&state.metrics.ask_requests_total);

    let body = match body {
        Ok(body) => body,
        Err(rejection) => return handle_body_rejection(&state, rejection),
    };

    let question = match validate::validate_request(&headers, &body) {
        Ok(question) => question,
        Err(err) => {
            Metrics::incr(&state.metrics.validation_failures_total);
            tracing::debug!(error = %err, "question rejected");
            return respond_with_error(StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    let start = Instant::now();
    let outcome = match state
        .oracle
        .generate_outcome(question.as_str(), &state.shutdown)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "error generating answer");
            return respond_with_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate answer",
            );
        }
    };
    state.metrics.observe_upstream(start.elapsed());
    if outcome.is_fallback() {
        Metrics::incr(&state.metrics.fallbacks_total);
    } else {
        Metrics::incr(&state.metrics.answers_total);
    }

    let answer = outcome.into_answer();
    let pair = QuestionAnswerPair::new(question.into_inner(), answer.clone());
    if let Err(err) = state.history.add(pair) {
        Metrics::incr(&state.metrics.history_write_errors_total);
        tracing::warn!(error = %err, "failed to store question/answer pair");
    }

    (StatusCode::OK, Json(AskResponse { answer })).into_response()
}

fn handle_body_rejection(state: &AppState, rejection: BytesRejection) -> Response {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            tracing::warn!(
                limit = ?state.max_request_bytes,
                "request body exceeded limit"
            );
            respond_with_error(StatusCode::PAYLOAD_TOO_LARGE, "Request too large")
        }
        other => {
            tracing::debug!(error = %other, "failed to read request body");
            respond_with_error(StatusCode::BAD_REQUEST, "Invalid request format")
        }
    }
}

/// Handler for `GET /history`: retained pairs, oldest first.
async fn history_handler(State(state): State<AppState>) -> Response {
    match state.history.get_all() {
        Ok(pairs) => (StatusCode::OK, Json(pairs)).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "error retrieving history");
            respond_with_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to retrieve history",
            )
        }
    }
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let path = state.template_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Html(page).into_response(),
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "error loading index template");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "model": state.oracle.model(),
        "historyLen": state.history.len(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.metrics.render(&Snapshot {
        tracked_clients: state.limiter.tracked(),
        history_len: state.history.len(),
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
