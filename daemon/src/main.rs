//! VibeNote Daemon
//!
//! Standalone process hosting the scheduling core behind a REST/metrics
//! surface. Wires `GpuGuard`, `TaskQueue` and `InferenceClient` together
//! via `vibenote_core::dispatch`, then serves the HTTP surface described
//! in `http.rs`. PID file handling follows the `$XDG_RUNTIME_DIR`
//! fallback pattern the teacher's standalone binary used
//! (`conductor-daemon`'s `default_pid_path`); the signal-driven graceful
//! shutdown follows the same file's `tokio::select!` over Ctrl+C/SIGTERM.
//!
//! # Environment Variables
//!
//! - `VIBENOTE_CONFIG`: path to `daemon.toml` (default: XDG config dir)
//! - `VIBENOTE_QUEUE_CAPACITY`, `VIBENOTE_INFERENCE_HOST`,
//!   `VIBENOTE_INFERENCE_PORT`: individual overrides, see
//!   [`vibenote_core::VibenoteConfig::with_env_overrides`]
//! - `VIBENOTE_BIND_ADDR`: HTTP listen address (default `127.0.0.1:8745`)
//! - `RUST_LOG`: tracing filter
//!
//! # Exit codes
//!
//! 0 normal, 1 initialisation failure (config or GPU handle), 2 bind
//! failure.

mod http;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use vibenote_core::{
    bridge_gpu_guard_to_queue, run_dispatcher, GpuGuard, InferenceClient, NvidiaSmiSampler,
    TaskIdAllocator, TaskQueue, VibenoteConfig, VibenoteMetrics,
};

use crate::http::DaemonState;

#[derive(Parser, Debug)]
#[command(name = "vibenoted", about = "VibeNote scheduling daemon")]
struct Args {
    /// Path to daemon.toml. Defaults to the XDG config directory.
    #[arg(long, env = "VIBENOTE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address.
    #[arg(long, env = "VIBENOTE_BIND_ADDR", default_value = "127.0.0.1:8745")]
    bind_addr: String,

    /// GPU device index to sample with nvidia-smi.
    #[arg(long, env = "VIBENOTE_GPU_DEVICE", default_value_t = 0)]
    gpu_device: u32,

    /// Number of dispatcher workers to run. Defaults to the max class
    /// concurrency ceiling from config if unset.
    #[arg(long, env = "VIBENOTE_WORKERS")]
    workers: Option<usize>,
}

fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("vibenote").join("daemon.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/vibenote-{uid}/daemon.pid"))
    }
}

async fn write_pid_file(path: &PathBuf) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, format!("{}\n", std::process::id())).await?;
    info!(pid = std::process::id(), path = ?path, "PID file created");
    Ok(())
}

async fn remove_pid_file(path: &PathBuf) {
    if tokio::fs::remove_file(path).await.is_err() {
        warn!(path = ?path, "failed to remove PID file (may already be gone)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vibenote_daemon=info".parse()?)
                .add_directive("vibenote_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    info!(pid = std::process::id(), "starting vibenote daemon");

    let config_path = args.config.unwrap_or_else(VibenoteConfig::default_path);
    let config = match VibenoteConfig::load(&config_path).await {
        Ok(c) => c.with_env_overrides(),
        Err(e) => {
            error!(error = %e, path = ?config_path, "failed to load config");
            std::process::exit(1);
        }
    };
    if let Err(errors) = config.validate() {
        error!(?errors, "config failed validation");
        std::process::exit(1);
    }

    let pid_path = default_pid_path();
    if let Err(e) = write_pid_file(&pid_path).await {
        error!(error = %e, "failed to write PID file");
        std::process::exit(1);
    }

    let metrics = Arc::new(VibenoteMetrics::new());

    let sampler: Option<Arc<dyn vibenote_core::GpuSampler>> =
        Some(Arc::new(NvidiaSmiSampler::new(args.gpu_device)));
    let gpu_guard = GpuGuard::start(sampler, config.gpu.to_guard_config(), Some(Arc::clone(&metrics)));

    let queue = TaskQueue::new(config.queue.to_queue_config(), Some(Arc::clone(&metrics)));
    let inference = InferenceClient::new(config.inference.to_endpoint(), Some(Arc::clone(&metrics)));

    tokio::spawn(bridge_gpu_guard_to_queue(
        Arc::clone(&gpu_guard),
        Arc::clone(&queue),
    ));

    let worker_count = args.workers.unwrap_or_else(|| {
        [
            config.queue.watch_limit,
            config.queue.interactive_limit,
            config.queue.export_limit,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
        .max(1)
    });
    for worker_id in 0..worker_count {
        tokio::spawn(run_dispatcher(
            worker_id,
            Arc::clone(&queue),
            Arc::clone(&inference),
        ));
    }

    let state = Arc::new(DaemonState {
        queue,
        gpu_guard,
        inference,
        metrics,
        task_ids: TaskIdAllocator::new(),
        config: parking_lot::RwLock::new(config),
        watch_enabled: AtomicBool::new(false),
    });

    let app = http::router(Arc::clone(&state));

    let listener = match tokio::net::TcpListener::bind(&args.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %args.bind_addr, "failed to bind HTTP listener");
            remove_pid_file(&pid_path).await;
            std::process::exit(2);
        }
    };
    info!(addr = %args.bind_addr, "listening");

    let shutdown_signal = async {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        tokio::select! {
            () = ctrl_c => info!("received Ctrl+C, shutting down"),
            () = terminate => info!("received SIGTERM, shutting down"),
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    remove_pid_file(&pid_path).await;
    info!("vibenote daemon stopped cleanly");
    Ok(())
}
