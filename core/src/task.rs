//! Task Value Types
//!
//! A `Task` is the unit of admission into the scheduling core: identity,
//! class, priority, opaque prompt payload, optional per-task parameters,
//! a callback that receives streamed tokens, and a cancel token. The queue
//! owns a task from `enqueue` until `finish`; no consumer other than the
//! dispatching worker invokes its callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Coarse workload category. Each class has its own concurrency ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskClass {
    /// Background enrichment driven by watch-mode.
    Watch,
    /// User-initiated interactive query.
    Interactive,
    /// Bulk export job.
    Export,
}

impl TaskClass {
    /// All classes, in a stable order used for stats snapshots.
    pub const ALL: [TaskClass; 3] = [TaskClass::Watch, TaskClass::Interactive, TaskClass::Export];

    /// Short label used as a Prometheus label value.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Watch => "watch",
            Self::Interactive => "interactive",
            Self::Export => "export",
        }
    }
}

/// Priority lane, orthogonal to task class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// The three lanes in scan order for stats snapshots.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Index into a fixed-size `[T; 3]` lane array.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Monotonically assigned task identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues monotonically increasing `TaskId`s, shared by all producers.
#[derive(Debug, Default)]
pub struct TaskIdAllocator {
    next: AtomicU64,
}

impl TaskIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id. Never returns the same id twice.
    pub fn next(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-task generation parameters. `None` fields fall back to server/model
/// defaults negotiated by the `InferenceClient`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskParams {
    /// Sampling temperature override.
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Stop sequences that terminate generation early.
    pub stop: Vec<String>,
}

/// Terminal event a caller receives for a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminal {
    Finished,
    Cancelled,
    Timeout,
    Disconnected,
    Restarting,
}

/// A callback invoked by the owning worker as tokens arrive and once with a
/// terminal event. Implements the "capability set" design note from the
/// spec: `invoke` for streamed text, `invoke_terminal` for the final event.
pub trait TokenSink: Send + Sync {
    /// A token/content fragment arrived.
    fn invoke(&self, token: &str);
    /// The request reached a terminal state. Called at most once.
    fn invoke_terminal(&self, terminal: Terminal);
}

/// A boxed, shareable `TokenSink`.
pub type BoxedTokenSink = Arc<dyn TokenSink>;

/// A token cooperatively checked by the worker between tokens to honour
/// cancellation. Cloning shares the same underlying flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this token cancelled. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A unit of admitted work.
pub struct Task {
    pub id: TaskId,
    pub class: TaskClass,
    pub priority: Priority,
    pub prompt: String,
    pub params: TaskParams,
    pub on_token: BoxedTokenSink,
    pub cancel: CancelToken,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("priority", &self.priority)
            .field("prompt_len", &self.prompt.len())
            .finish_non_exhaustive()
    }
}

impl Task {
    #[must_use]
    pub fn new(
        id: TaskId,
        class: TaskClass,
        priority: Priority,
        prompt: impl Into<String>,
        on_token: BoxedTokenSink,
    ) -> Self {
        Self {
            id,
            class,
            priority,
            prompt: prompt.into(),
            params: TaskParams::default(),
            on_token,
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }
}
