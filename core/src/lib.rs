//! VibeNote Core - Work-Admission and Scheduling
//!
//! The scheduling core behind the VibeNote daemon: deciding whether the
//! local GPU can accept another inference job, admitting and ordering
//! work across watch/interactive/export classes, and holding a
//! reconnecting streaming connection to the locally-hosted completion
//! server. It has **no** dependency on the daemon's HTTP surface, screen
//! capture, or OCR pipeline — those are callers, not collaborators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         HTTP surface                          │
//! │               (axum routes, owned by the daemon)               │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ enqueue / cancel / config apply
//! ┌───────────────────────────┼─────────────────────────────────┐
//! │                    VIBENOTE CORE                              │
//! │  ┌──────────┐   throttle   ┌───────────┐   dequeue  ┌───────┐ │
//! │  │ GpuGuard │──watch ch.──▶│ TaskQueue │───────────▶│Worker │ │
//! │  └──────────┘              └───────────┘             └───┬───┘ │
//! │                                                          │     │
//! │                                               stream_completion │
//! │                                                          ▼     │
//! │                                              ┌─────────────────┐│
//! │                                              │ InferenceClient ││
//! │                                              └─────────────────┘│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`gpu_guard`]: GPU sampling, hysteresis, and offload-layer sizing
//! - [`task_queue`]: bounded multi-class priority/round-robin admission
//! - [`inference_client`]: reconnecting SSE client to the completion server
//! - [`task`]: shared value types (`Task`, `TaskId`, `TokenSink`, ...)
//! - [`config`]: validated config load/apply for every subsystem
//! - [`metrics`]: the daemon's Prometheus series
//! - [`error`]: the unified `CoreError` taxonomy

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gpu_guard;
pub mod inference_client;
pub mod metrics;
pub mod task;
pub mod task_queue;

pub use config::{ConfigLoadError, GpuSection, InferenceSection, QueueSection, VibenoteConfig};
pub use dispatch::{bridge_gpu_guard_to_queue, run_dispatcher};
pub use error::{AdmissionRejectedReason, CoreError, CoreResult};
pub use gpu_guard::{GpuGuard, GpuGuardConfig, GpuSample, GpuSampleError, GpuSampler, GpuStats, NvidiaSmiSampler};
pub use inference_client::{
    ConnectionState, InferenceClient, InferenceEndpoint, InferenceError, ModelStatus,
};
pub use metrics::{TaskOutcome, VibenoteMetrics};
pub use task::{
    BoxedTokenSink, CancelToken, Priority, Task, TaskClass, TaskId, TaskIdAllocator, TaskParams,
    Terminal, TokenSink,
};
pub use task_queue::{ClassLimits, QueueConfig, QueueStats, TaskQueue};
