//! Dispatcher Wiring
//!
//! Glues the three scheduling components together the way the daemon's
//! main loop is described doing it: a GPU-throttle bridge that pauses and
//! resumes the queue as `GpuGuard` publishes edges, and a pool of
//! dispatcher workers that `dequeue` a task and drive it through
//! `InferenceClient::stream_completion`. Neither component is aware of the
//! other directly; this module is the only place that holds references to
//! both, mirroring the "no shared mutable state crosses component
//! boundaries except via the defined operations" rule.

use std::sync::Arc;

use tracing::{info, warn};

use crate::gpu_guard::GpuGuard;
use crate::inference_client::InferenceClient;
use crate::metrics::TaskOutcome;
use crate::task::Terminal;
use crate::task_queue::TaskQueue;

/// Bridge `GpuGuard` throttle edges onto `TaskQueue::pause`/`resume`. Runs
/// until the guard is dropped; intended to be spawned once per daemon.
pub async fn bridge_gpu_guard_to_queue(guard: Arc<GpuGuard>, queue: Arc<TaskQueue>) {
    if !guard.can_accept_work() {
        queue.pause();
    }
    let mut throttle_rx = guard.subscribe_throttle();
    loop {
        if throttle_rx.changed().await.is_err() {
            warn!("GPU guard throttle channel closed; queue keeps its last pause state");
            return;
        }
        if *throttle_rx.borrow() {
            queue.pause();
        } else {
            queue.resume();
        }
    }
}

/// Map the terminal an inference request actually reached to the outcome
/// recorded against `vibenote_tasks_total`. `Disconnected` and
/// `Restarting` both mean the request did not finish normally and no
/// retry budget remains from the dispatcher's point of view; they are
/// recorded as `Timeout`, the closest of the four required outcome labels.
fn terminal_to_outcome(terminal: Terminal) -> TaskOutcome {
    match terminal {
        Terminal::Finished => TaskOutcome::Finished,
        Terminal::Cancelled => TaskOutcome::Cancelled,
        Terminal::Timeout | Terminal::Disconnected | Terminal::Restarting => TaskOutcome::Timeout,
    }
}

/// Run one dispatcher worker forever: pop a task, stream it through the
/// inference client, record its outcome. The spec calls for `N` of these,
/// `N` being the max over class concurrency ceilings; callers spawn as
/// many as they like, all sharing the same queue and client.
pub async fn run_dispatcher(
    worker_id: usize,
    queue: Arc<TaskQueue>,
    inference: Arc<InferenceClient>,
) {
    info!(worker_id, "dispatcher worker started");
    loop {
        let task = queue.dequeue().await;

        if task.cancel.is_cancelled() {
            task.on_token.invoke_terminal(Terminal::Cancelled);
            queue.finish(task.id, task.class, TaskOutcome::Cancelled);
            continue;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let terminal = inference
            .stream_completion(
                request_id,
                &task.prompt,
                task.params.temperature,
                task.params.max_tokens,
                &task.params.stop,
                task.cancel.clone(),
                Arc::clone(&task.on_token),
            )
            .await;

        queue.finish(task.id, task.class, terminal_to_outcome(terminal));
    }
}
