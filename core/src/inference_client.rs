//! Inference Client
//!
//! A reconnecting, multiplexed streaming client for a local llama.cpp-style
//! completion server. Ported from the original daemon's `LlamaClient`
//! (`examples/original_source/daemon/src/llama_client.cpp`): that code held
//! a `QTcpSocket` to a `QProcess`-spawned server, multiplexed many
//! in-flight completions by request id under a `QMutex`-guarded `QHash`,
//! and reparsed `data: `-prefixed SSE frames out of the raw socket buffer.
//! Here the socket is a keep-alive `reqwest::Client` (HTTP/1.1 chunked
//! streaming is equivalent to the raw socket read loop but gets us
//! connection pooling and TLS-readiness for free, the way
//! `backend::ollama::OllamaBackend` already streams from a local server),
//! the request table is a `DashMap`, and process supervision uses
//! `tokio::process::Command` with a graceful SIGTERM before SIGKILL.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::metrics::VibenoteMetrics;
use crate::task::{BoxedTokenSink, CancelToken, Terminal};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Connection lifecycle, mirroring the original client's internal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Restarting,
}

/// How to reach and (optionally) supervise a local completion server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceEndpoint {
    pub host: String,
    pub port: u16,
    /// Path to the `llama-server`-style binary. `None` means the server is
    /// externally managed and the client only connects, never spawns it.
    pub server_binary: Option<String>,
    pub model_path: Option<String>,
}

impl InferenceEndpoint {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Validate the endpoint has a resolvable host and a non-privileged,
    /// non-zero port.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.host.trim().is_empty() {
            errors.push("inference endpoint host must not be empty".to_string());
        }
        if self.port == 0 {
            errors.push("inference endpoint port must be nonzero".to_string());
        }
        if self.server_binary.is_some() && self.model_path.is_none() {
            errors.push("model_path is required when server_binary is set".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A snapshot of the managed server process, exposed on `/v1/status`.
#[derive(Clone, Debug, Serialize)]
pub struct ModelStatus {
    pub state: &'static str,
    pub ngl: u32,
    pub pid: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunkChoice {
    #[serde(default)]
    delta: Option<CompletionDelta>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChunkChoice>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    id: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: &'a [String],
}

/// Errors from the inference transport. `Transient` is retried internally
/// with backoff and never surfaces to a caller directly; `Fatal` means the
/// server could not be (re)spawned after exhausting attempts.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

struct ManagedProcess {
    child: Child,
}

/// A reconnecting, multiplexed streaming client for the completion server.
pub struct InferenceClient {
    http: reqwest::Client,
    endpoint: parking_lot::RwLock<InferenceEndpoint>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    pending: DashMap<String, BoxedTokenSink>,
    process: Mutex<Option<ManagedProcess>>,
    current_ngl: AtomicU32,
    reconnect_attempts: AtomicU64,
    metrics: Option<Arc<VibenoteMetrics>>,
}

impl InferenceClient {
    #[must_use]
    pub fn new(endpoint: InferenceEndpoint, metrics: Option<Arc<VibenoteMetrics>>) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            http: reqwest::Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .expect("reqwest client builds"),
            endpoint: parking_lot::RwLock::new(endpoint),
            state_tx,
            state_rx,
            pending: DashMap::new(),
            process: Mutex::new(None),
            current_ngl: AtomicU32::new(0),
            reconnect_attempts: AtomicU64::new(0),
            metrics,
        })
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn status(&self) -> ModelStatus {
        let state = match self.state() {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Restarting => "restarting",
        };
        ModelStatus {
            state,
            ngl: self.current_ngl.load(Ordering::Relaxed),
            pid: None,
        }
    }

    /// Spawn the managed server (if `server_binary` is configured) with the
    /// given offload layer count, waiting for it to accept connections.
    /// Subsequent calls while already restarting are coalesced: a second
    /// caller observes `Restarting` and returns immediately rather than
    /// racing a duplicate spawn.
    pub async fn restart_with_layers(&self, ngl: u32) -> Result<(), InferenceError> {
        if *self.state_rx.borrow() == ConnectionState::Restarting {
            debug!("restart already in progress, skipping duplicate request");
            return Ok(());
        }
        let _ = self.state_tx.send(ConnectionState::Restarting);

        let endpoint = self.endpoint.read().clone();
        let Some(binary) = endpoint.server_binary.clone() else {
            // Externally managed server: nothing to spawn, just mark connected.
            self.current_ngl.store(ngl, Ordering::Relaxed);
            let _ = self.state_tx.send(ConnectionState::Connected);
            return Ok(());
        };
        let model_path = endpoint
            .model_path
            .clone()
            .ok_or_else(|| InferenceError::Fatal("model_path not configured".to_string()))?;

        self.terminate_managed_process().await;

        let mut command = Command::new(&binary);
        command
            .arg("--model")
            .arg(&model_path)
            .arg("--host")
            .arg(&endpoint.host)
            .arg("--port")
            .arg(endpoint.port.to_string())
            .arg("--ngl")
            .arg(ngl.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| InferenceError::Fatal(format!("failed to spawn inference server: {e}")))?;

        *self.process.lock().await = Some(ManagedProcess { child });
        self.current_ngl.store(ngl, Ordering::Relaxed);

        self.wait_until_reachable(&endpoint).await?;
        let _ = self.state_tx.send(ConnectionState::Connected);
        info!(ngl, "inference server restarted with new offload");
        Ok(())
    }

    async fn wait_until_reachable(&self, endpoint: &InferenceEndpoint) -> Result<(), InferenceError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        let url = format!("{}/health", endpoint.base_url());
        let mut interval = tokio::time::interval(HEALTH_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if tokio::time::Instant::now() >= deadline {
                return Err(InferenceError::Fatal(
                    "inference server did not become reachable in time".to_string(),
                ));
            }
            if self.http.get(&url).send().await.is_ok() {
                return Ok(());
            }
        }
    }

    /// Gracefully terminate the managed process: SIGTERM, wait up to 5s,
    /// then SIGKILL. Mirrors `terminate()`/`waitForFinished(5000)`/`kill()`
    /// from the original client.
    async fn terminate_managed_process(&self) {
        let mut guard = self.process.lock().await;
        let Some(mut managed) = guard.take() else {
            return;
        };
        if let Some(pid) = managed.child.id() {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        }
        let wait = tokio::time::timeout(GRACEFUL_SHUTDOWN_WAIT, managed.child.wait()).await;
        if wait.is_err() {
            warn!("inference server did not exit after SIGTERM, killing");
            let _ = managed.child.kill().await;
        }
    }

    /// Stream a completion request, invoking `sink` with each token and
    /// exactly one terminal event. Reconnects with exponential backoff on
    /// transport failure; never returns until a terminal event has been
    /// delivered to `sink`. Checks `cancel` between chunks so a caller
    /// flipping the shared token stops further token delivery without
    /// waiting for the upstream stream to end; in that case `stop` is
    /// sent upstream before returning.
    ///
    /// Returns the `Terminal` that was delivered to `sink`, so the caller
    /// (the dispatcher loop) can record the matching task outcome without
    /// re-deriving it.
    pub async fn stream_completion(
        self: &Arc<Self>,
        request_id: String,
        prompt: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        stop: &[String],
        cancel: CancelToken,
        sink: BoxedTokenSink,
    ) -> Terminal {
        self.pending.insert(request_id.clone(), Arc::clone(&sink));

        let mut attempt: u32 = 0;
        loop {
            match self
                .try_stream_once(&request_id, prompt, temperature, max_tokens, stop, &cancel, &sink)
                .await
            {
                Ok(terminal) => {
                    self.pending.remove(&request_id);
                    if terminal == Terminal::Cancelled {
                        self.send_stop_request(&request_id).await;
                    }
                    return terminal;
                }
                Err(InferenceError::Fatal(reason)) => {
                    error!(request_id, reason, "inference request failed fatally");
                    self.pending.remove(&request_id);
                    sink.invoke_terminal(Terminal::Disconnected);
                    return Terminal::Disconnected;
                }
                Err(InferenceError::Transient(reason)) => {
                    attempt += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_inference_reconnect_attempts();
                    }
                    self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                    let backoff = Self::backoff_for_attempt(attempt);
                    warn!(request_id, reason, attempt, ?backoff, "retrying after transient error");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn backoff_for_attempt(attempt: u32) -> Duration {
        let millis = INITIAL_BACKOFF.as_millis() as u64 * (1u64 << attempt.min(5));
        Duration::from_millis(millis).min(MAX_BACKOFF)
    }

    async fn try_stream_once(
        &self,
        request_id: &str,
        prompt: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        stop: &[String],
        cancel: &CancelToken,
        sink: &BoxedTokenSink,
    ) -> Result<Terminal, InferenceError> {
        let endpoint = self.endpoint.read().clone();
        let url = format!("{}/v1/completions", endpoint.base_url());
        let body = CompletionRequest {
            id: request_id,
            prompt,
            stream: true,
            temperature,
            max_tokens,
            stop,
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Transient(format!("connect failed: {e}")))?;

        if !response.status().is_success() {
            return Err(InferenceError::Transient(format!(
                "server returned {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buffer: VecDeque<u8> = VecDeque::new();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                sink.invoke_terminal(Terminal::Cancelled);
                return Ok(Terminal::Cancelled);
            }

            let chunk: Bytes = chunk.map_err(|e| InferenceError::Transient(format!("stream error: {e}")))?;
            buffer.extend(chunk);

            while let Some(event) = Self::extract_event(&mut buffer) {
                if event.trim() == "[DONE]" {
                    sink.invoke_terminal(Terminal::Finished);
                    return Ok(Terminal::Finished);
                }
                match serde_json::from_str::<CompletionChunk>(&event) {
                    Ok(parsed) => {
                        if let Some(choice) = parsed.choices.into_iter().next() {
                            let text = choice
                                .delta
                                .and_then(|d| d.content)
                                .or(choice.text)
                                .unwrap_or_default();
                            if !text.is_empty() {
                                sink.invoke(&text);
                            }
                        }
                    }
                    Err(e) => debug!(request_id, error = %e, "skipping unparsable SSE frame"),
                }
            }
        }

        // Stream ended without a `[DONE]` marker: the connection dropped
        // mid-generation, which is a transient condition worth retrying.
        Err(InferenceError::Transient(
            "stream ended without terminal marker".to_string(),
        ))
    }

    /// Pull one complete `data: ...\n\n` SSE frame out of `buffer`, if
    /// present. Tolerant of chunk boundaries landing mid-frame or
    /// mid-UTF-8-sequence: bytes that don't yet form a complete frame are
    /// left in the buffer for the next chunk.
    fn extract_event(buffer: &mut VecDeque<u8>) -> Option<String> {
        let bytes: Vec<u8> = buffer.iter().copied().collect();
        let marker = b"\n\n";
        let pos = bytes.windows(2).position(|w| w == marker)?;
        let frame: Vec<u8> = bytes[..pos].to_vec();
        for _ in 0..pos + 2 {
            buffer.pop_front();
        }
        let text = String::from_utf8_lossy(&frame);
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
            .unwrap_or("")
            .to_string();
        Some(data)
    }

    /// Ask the server to stop generation for `request_id`, mirroring the
    /// original client's always-available (but not always invoked)
    /// `stopGeneration`. Firing this on every cancellation is the
    /// redesigned behaviour: every cancelled request now sends `/v1/stop`
    /// instead of leaving it to the caller's discretion.
    pub async fn stop(&self, request_id: &str) {
        if let Some((_, sink)) = self.pending.remove(request_id) {
            sink.invoke_terminal(Terminal::Cancelled);
        }
        self.send_stop_request(request_id).await;
    }

    async fn send_stop_request(&self, request_id: &str) {
        let endpoint = self.endpoint.read().clone();
        let url = format!("{}/v1/stop", endpoint.base_url());
        if let Err(e) = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "id": request_id }))
            .send()
            .await
        {
            debug!(request_id, error = %e, "stop request failed (best effort)");
        }
    }

    /// Apply a validated endpoint change. Any in-flight completions keep
    /// running against the old endpoint value they captured at request
    /// time; only subsequent requests use the new endpoint.
    pub fn apply_endpoint(&self, endpoint: InferenceEndpoint) {
        *self.endpoint.write() = endpoint;
    }
}
