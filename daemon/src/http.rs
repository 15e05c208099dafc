//! HTTP/Metrics Surface
//!
//! The REST surface the core's scheduling subsystem drives, per the route
//! table the original daemon's `QHttpServer`-based `HttpServer` exposed
//! (`examples/original_source/daemon/src/http_server.cpp`): `/v1/status`,
//! `/v1/summarize`, `/v1/watch/start`/`stop`, `/v1/config`, `/metrics`.
//! That server wrapped every handler in a `wrap()` helper adding
//! `Access-Control-Allow-Origin: http://localhost` and a per-request timing
//! log; here the equivalent is a `tower_http::cors::CorsLayer` restricted
//! to loopback origins plus a `TraceLayer`, since this workspace has axum
//! in its dependency stack (borrowed from `apollographql-router`, which
//! the teacher crate itself does not use HTTP for at all).

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use vibenote_core::{
    AdmissionRejectedReason, BoxedTokenSink, CoreError, GpuGuard, InferenceClient, Priority, Task,
    TaskClass, TaskIdAllocator, TaskParams, TaskQueue, Terminal, TokenSink, VibenoteConfig,
    VibenoteMetrics,
};

/// Shared state handed to every axum handler.
pub struct DaemonState {
    pub queue: Arc<TaskQueue>,
    pub gpu_guard: Arc<GpuGuard>,
    pub inference: Arc<InferenceClient>,
    pub metrics: Arc<VibenoteMetrics>,
    pub task_ids: TaskIdAllocator,
    pub config: parking_lot::RwLock<VibenoteConfig>,
    pub watch_enabled: AtomicBool,
}

pub fn router(state: Arc<DaemonState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin([
            HeaderValue::from_static("http://localhost"),
            HeaderValue::from_static("http://127.0.0.1"),
        ]);

    Router::new()
        .route("/v1/status", get(get_status))
        .route("/v1/summarize", post(post_summarize))
        .route("/v1/watch/start", post(post_watch_start))
        .route("/v1/watch/stop", post(post_watch_stop))
        .route("/v1/config", put(put_config))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct GpuStatusView {
    utilization: f32,
    #[serde(rename = "memoryUsed")]
    memory_used: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(rename = "queueDepth")]
    queue_depth: usize,
    gpu: GpuStatusView,
    model: vibenote_core::ModelStatus,
    watch: bool,
}

async fn get_status(State(state): State<Arc<DaemonState>>) -> Json<StatusResponse> {
    let stats = state.queue.stats();
    let gpu = state.gpu_guard.stats();
    Json(StatusResponse {
        queue_depth: stats.total_queued,
        gpu: GpuStatusView {
            utilization: gpu.utilisation_percent,
            memory_used: gpu.vram_total_mb.saturating_sub(gpu.vram_free_mb),
        },
        model: state.inference.status(),
        watch: state.watch_enabled.load(Ordering::Relaxed),
    })
}

#[derive(Deserialize)]
struct SummarizeRequest {
    prompt: String,
    params: Option<SummarizeParams>,
}

#[derive(Deserialize, Default)]
struct SummarizeParams {
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    #[serde(default)]
    stop: Vec<String>,
}

/// Forwards streamed tokens and the terminal event into an mpsc channel
/// that backs the HTTP response body. This is the "capability set"
/// `TokenSink` realized as a channel writer rather than a callback
/// closure, so it can cross the handler/response boundary.
struct ChannelSink {
    tx: mpsc::UnboundedSender<Result<axum::body::Bytes, Infallible>>,
}

impl TokenSink for ChannelSink {
    fn invoke(&self, token: &str) {
        let _ = self.tx.send(Ok(axum::body::Bytes::copy_from_slice(token.as_bytes())));
    }

    fn invoke_terminal(&self, _terminal: Terminal) {
        // Dropping the sender closes the stream; the body ends there.
    }
}

async fn post_summarize(
    State(state): State<Arc<DaemonState>>,
    Json(request): Json<SummarizeRequest>,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: BoxedTokenSink = Arc::new(ChannelSink { tx });
    let params = request.params.unwrap_or_default();

    let task = Task::new(
        state.task_ids.next(),
        TaskClass::Interactive,
        Priority::Normal,
        request.prompt,
        sink,
    )
    .with_params(TaskParams {
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        stop: params.stop,
    });

    match state.queue.enqueue(task) {
        Ok(_) => {
            let stream = ReceiverStream::new(rx);
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; charset=utf-8")
                .body(Body::from_stream(stream))
                .expect("valid streamed response")
        }
        Err(CoreError::AdmissionRejected(AdmissionRejectedReason::QueueFull)) => {
            (StatusCode::TOO_MANY_REQUESTS, "queue is at capacity").into_response()
        }
        Err(CoreError::AdmissionRejected(AdmissionRejectedReason::ClassDisabled)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "interactive class is disabled").into_response()
        }
        Err(other) => {
            warn!(error = %other, "unexpected admission error");
            (StatusCode::INTERNAL_SERVER_ERROR, "admission failed").into_response()
        }
    }
}

async fn post_watch_start(State(state): State<Arc<DaemonState>>) -> StatusCode {
    state.watch_enabled.store(true, Ordering::Relaxed);
    StatusCode::OK
}

async fn post_watch_stop(State(state): State<Arc<DaemonState>>) -> StatusCode {
    state.watch_enabled.store(false, Ordering::Relaxed);
    StatusCode::OK
}

async fn put_config(
    State(state): State<Arc<DaemonState>>,
    Json(new_config): Json<VibenoteConfig>,
) -> Response {
    if let Err(errors) = new_config.validate() {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "errors": errors })))
            .into_response();
    }

    state.queue.apply_config(new_config.queue.to_queue_config());
    state.gpu_guard.apply_config(new_config.gpu.to_guard_config());
    let new_endpoint = new_config.inference.to_endpoint();
    let endpoint_changed = {
        let current = state.config.read();
        current.inference.host != new_config.inference.host
            || current.inference.port != new_config.inference.port
    };
    state.inference.apply_endpoint(new_endpoint);
    *state.config.write() = new_config;

    if endpoint_changed {
        let ngl = state.inference.status().ngl;
        let inference = Arc::clone(&state.inference);
        tokio::spawn(async move {
            if let Err(e) = inference.restart_with_layers(ngl).await {
                warn!(error = %e, "reconnect after endpoint change failed");
            }
        });
    }

    StatusCode::OK.into_response()
}

async fn get_metrics(State(state): State<Arc<DaemonState>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
