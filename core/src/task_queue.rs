//! Task Queue
//!
//! A bounded, multi-class, priority-lane scheduler. Ported from the
//! original daemon's `std::mutex` + `std::condition_variable` queue
//! (`examples/original_source/daemon/src/queue.cpp`): three priority lanes
//! (`High`, `Normal`, `Low`), a weighted round-robin alternation between
//! `Normal` and `Low` so neither lane starves the other, strict preemption
//! by `High`, and a per-class concurrency ceiling checked before a task is
//! handed to a dispatcher. `std::condition_variable::wait_for` becomes
//! `tokio::sync::Notify` plus `tokio::time::timeout`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{AdmissionRejectedReason, CoreError, CoreResult};
use crate::metrics::{TaskOutcome, VibenoteMetrics};
use crate::task::{Priority, Task, TaskClass, TaskId};

/// Per-class concurrency ceilings. A limit of zero disables the class.
#[derive(Clone, Copy, Debug)]
pub struct ClassLimits {
    pub watch: usize,
    pub interactive: usize,
    pub export: usize,
}

impl Default for ClassLimits {
    fn default() -> Self {
        Self {
            watch: 1,
            interactive: 2,
            export: 1,
        }
    }
}

impl ClassLimits {
    fn limit_for(&self, class: TaskClass) -> usize {
        match class {
            TaskClass::Watch => self.watch,
            TaskClass::Interactive => self.interactive,
            TaskClass::Export => self.export,
        }
    }

    /// Validate each limit is within `[0, 16]`.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("watch", self.watch),
            ("interactive", self.interactive),
            ("export", self.export),
        ] {
            if value > 16 {
                errors.push(format!("class limit {name} must be <= 16"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Validated capacity/concurrency configuration for the queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub capacity: usize,
    pub class_limits: ClassLimits,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            class_limits: ClassLimits::default(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !(1..=10_000).contains(&self.capacity) {
            errors.push("capacity must be in [1, 10000]".to_string());
        }
        if let Err(mut class_errors) = self.class_limits.validate() {
            errors.append(&mut class_errors);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Point-in-time queue occupancy, used to render `/v1/status` and metrics.
#[derive(Clone, Debug, Default)]
pub struct QueueStats {
    pub total_queued: usize,
    pub queued_by_priority: [usize; 3],
    pub running_by_class: HashMap<TaskClass, usize>,
    pub paused: bool,
}

struct Lanes {
    // index by Priority::index()
    queues: [VecDeque<Task>; 3],
}

impl Lanes {
    fn new() -> Self {
        Self {
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

struct Inner {
    lanes: Lanes,
    running: HashMap<TaskClass, usize>,
    cancelled: std::collections::HashSet<TaskId>,
    inflight_cancel_tokens: HashMap<TaskId, crate::task::CancelToken>,
    rr_index: usize,
    paused: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            lanes: Lanes::new(),
            running: HashMap::new(),
            cancelled: std::collections::HashSet::new(),
            inflight_cancel_tokens: HashMap::new(),
            rr_index: 0,
            paused: false,
        }
    }

    fn running_count(&self, class: TaskClass) -> usize {
        *self.running.get(&class).unwrap_or(&0)
    }

    fn can_run(&self, class: TaskClass, limits: &ClassLimits) -> bool {
        !self.paused && self.running_count(class) < limits.limit_for(class)
    }

    /// Pop the next runnable task, honouring strict High preemption and
    /// Normal/Low round-robin alternation. Mirrors `findReadyTask` /
    /// `popNextTaskUnlocked` from the original queue.
    fn pop_next_ready(&mut self, limits: &ClassLimits) -> Option<Task> {
        if self.paused {
            return None;
        }

        // High lane is always scanned first, strictly preempting the
        // other two.
        if let Some(idx) = self.find_ready_index(Priority::High.index(), limits) {
            return self.lanes.queues[Priority::High.index()].remove(idx);
        }

        // Alternate the starting lane between Normal and Low so a lane
        // that's perpetually non-empty can't starve the other.
        let order = if self.rr_index % 2 == 0 {
            [Priority::Normal, Priority::Low]
        } else {
            [Priority::Low, Priority::Normal]
        };
        self.rr_index = self.rr_index.wrapping_add(1);

        for priority in order {
            if let Some(idx) = self.find_ready_index(priority.index(), limits) {
                return self.lanes.queues[priority.index()].remove(idx);
            }
        }
        None
    }

    /// First non-cancelled task in a lane whose class is under its ceiling.
    fn find_ready_index(&self, lane: usize, limits: &ClassLimits) -> Option<usize> {
        self.lanes.queues[lane]
            .iter()
            .position(|task| !self.cancelled.contains(&task.id) && self.can_run(task.class, limits))
    }
}

/// A bounded multi-class priority scheduler.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: parking_lot::RwLock<QueueConfig>,
    shutdown: AtomicBool,
    metrics: Option<Arc<VibenoteMetrics>>,
}

impl TaskQueue {
    #[must_use]
    pub fn new(config: QueueConfig, metrics: Option<Arc<VibenoteMetrics>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::new()),
            notify: Notify::new(),
            config: parking_lot::RwLock::new(config),
            shutdown: AtomicBool::new(false),
            metrics,
        })
    }

    /// Admit a task. Rejects synchronously (without queuing) if the queue
    /// is at capacity or the task's class has a zero concurrency ceiling.
    pub fn enqueue(&self, task: Task) -> CoreResult<TaskId> {
        let config = *self.config.read();
        let mut inner = self.inner.lock();

        if config.class_limits.limit_for(task.class) == 0 {
            return Err(CoreError::AdmissionRejected(
                AdmissionRejectedReason::ClassDisabled,
            ));
        }
        if inner.lanes.len() >= config.capacity {
            if let Some(metrics) = &self.metrics {
                metrics.record_task_outcome(task.class, TaskOutcome::Rejected);
            }
            return Err(CoreError::AdmissionRejected(
                AdmissionRejectedReason::QueueFull,
            ));
        }

        let id = task.id;
        let priority = task.priority;
        inner.lanes.queues[priority.index()].push_back(task);
        self.publish_stats_locked(&inner, &config);
        drop(inner);
        self.notify.notify_one();
        debug!(task_id = %id, ?priority, "task admitted");
        Ok(id)
    }

    /// Cancel a queued or in-flight task. Removes it immediately if still
    /// queued, invoking its terminal callback with `Cancelled`. If already
    /// dispatched, flips the shared `CancelToken` the worker holds so the
    /// in-flight generation stops delivering further tokens between
    /// chunks. A no-op on an unknown or already-terminal id.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock();
        let still_queued = inner
            .lanes
            .queues
            .iter()
            .any(|lane| lane.iter().any(|t| t.id == id));
        inner.cancelled.insert(id);
        if still_queued {
            for lane in &mut inner.lanes.queues {
                if let Some(pos) = lane.iter().position(|t| t.id == id) {
                    let task = lane.remove(pos).unwrap();
                    task.on_token
                        .invoke_terminal(crate::task::Terminal::Cancelled);
                    return true;
                }
            }
        }
        if let Some(token) = inner.inflight_cancel_tokens.get(&id) {
            token.cancel();
            return true;
        }
        false
    }

    /// Block (async) until a runnable task is available, or forever if the
    /// queue is paused/empty and no deadline is given.
    ///
    /// The `Notified` future is created and pinned *before* `try_pop` runs,
    /// per the documented `tokio::sync::Notify` pattern: it snapshots the
    /// notification state at creation time, so a `notify_waiters()` that
    /// lands in the gap between `try_pop` returning `None` and the `.await`
    /// below is still observed instead of being lost.
    pub async fn dequeue(&self) -> Task {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if let Some(task) = self.try_pop() {
                return task;
            }
            notified.await;
        }
    }

    /// Like `dequeue`, but bounded by `timeout`. Returns `Err(CoreError::Timeout)`
    /// if nothing became runnable in time.
    pub async fn dequeue_with_timeout(&self, timeout: Duration) -> CoreResult<Task> {
        tokio::time::timeout(timeout, self.dequeue())
            .await
            .map_err(|_| CoreError::Timeout)
    }

    fn try_pop(&self) -> Option<Task> {
        let config = *self.config.read();
        let mut inner = self.inner.lock();
        let task = inner.lanes.pop_next_ready(&config.class_limits)?;
        *inner.running.entry(task.class).or_insert(0) += 1;
        inner
            .inflight_cancel_tokens
            .insert(task.id, task.cancel.clone());
        self.publish_stats_locked(&inner, &config);
        Some(task)
    }

    /// Record that a dispatched task reached a terminal state, freeing its
    /// concurrency slot and waking any waiters blocked on `dequeue`.
    pub fn finish(&self, id: TaskId, class: TaskClass, outcome: TaskOutcome) {
        {
            let config = *self.config.read();
            let mut inner = self.inner.lock();
            inner.inflight_cancel_tokens.remove(&id);
            inner.cancelled.remove(&id);
            if let Some(count) = inner.running.get_mut(&class) {
                *count = count.saturating_sub(1);
            }
            self.publish_stats_locked(&inner, &config);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_task_outcome(class, outcome);
        }
        self.notify.notify_waiters();
    }

    /// Stop dispatching new tasks. Already-running tasks are unaffected;
    /// queued tasks remain queued.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        info!("task queue paused");
    }

    /// Resume dispatching and wake any blocked `dequeue` callers.
    pub fn resume(&self) {
        self.inner.lock().paused = false;
        info!("task queue resumed");
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Apply a validated config change. Shrinking capacity below the
    /// current queue depth does not evict anything already admitted; it
    /// only blocks further admission until depth falls back under the new
    /// ceiling.
    pub fn apply_config(&self, config: QueueConfig) {
        *self.config.write() = config;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut queued_by_priority = [0usize; 3];
        for priority in Priority::ALL {
            queued_by_priority[priority.index()] = inner.lanes.queues[priority.index()].len();
        }
        QueueStats {
            total_queued: inner.lanes.len(),
            queued_by_priority,
            running_by_class: inner.running.clone(),
            paused: inner.paused,
        }
    }

    fn publish_stats_locked(&self, inner: &Inner, _config: &QueueConfig) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.set_queue_depth(inner.lanes.len());
        for priority in Priority::ALL {
            metrics.set_queue_depth_by_priority(priority, inner.lanes.queues[priority.index()].len());
        }
        for class in TaskClass::ALL {
            metrics.set_running(class, inner.running_count(class));
        }
    }
}
