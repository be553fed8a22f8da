//! In-process lane/priority task queue for AI service work
//!
//! Tasks are picked by lowest priority value, then submission order, skipping
//! lanes already at their concurrency limit. Scheduling is deferred to a
//! spawned step, so tasks enqueued together compete on priority before any
//! of them starts. A failing or panicking task never affects its siblings.
//!
//! Must be used from within a tokio runtime.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{oneshot, Notify};

pub const DEFAULT_LANE: &str = "default";
pub const DEFAULT_PRIORITY: i32 = 5;

/// Queue-wide limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Global cap on running tasks (minimum 1)
    pub max_concurrent: usize,
    /// Per-lane caps; `"default"` applies to lanes without their own entry
    pub lane_concurrency: HashMap<String, usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            lane_concurrency: HashMap::new(),
        }
    }
}

impl QueueOptions {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            ..Self::default()
        }
    }

    pub fn with_lane(mut self, lane: impl Into<String>, limit: usize) -> Self {
        self.lane_concurrency.insert(lane.into(), limit);
        self
    }

    /// Exact lane entry, then `default`, then the global cap. Zero counts as unset.
    fn lane_limit(&self, lane: &str) -> usize {
        let global = self.max_concurrent.max(1);
        self.lane_concurrency
            .get(lane)
            .filter(|limit| **limit > 0)
            .or_else(|| self.lane_concurrency.get(DEFAULT_LANE).filter(|limit| **limit > 0))
            .copied()
            .unwrap_or(global)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Lower runs first
    pub priority: i32,
    pub lane: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            lane: DEFAULT_LANE.to_string(),
        }
    }
}

impl TaskOptions {
    pub fn lane(lane: impl Into<String>) -> Self {
        Self {
            lane: lane.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The queue was dropped before the task reported back
    #[error("Task dropped before completion")]
    Dropped,
}

/// Completion handle for one enqueued task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub async fn join(self) -> Result<T, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Dropped))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    /// Running tasks per lane
    pub lanes: HashMap<String, usize>,
}

struct QueuedTask {
    job: BoxFuture<'static, ()>,
    priority: i32,
    lane: String,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<QueuedTask>,
    lane_running: HashMap<String, usize>,
    running: usize,
    next_seq: u64,
    scheduled: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running == 0 && !self.scheduled
    }
}

struct Inner {
    options: QueueOptions,
    state: Mutex<QueueState>,
    idle: Notify,
}

/// Cloneable handle to a shared queue
#[derive(Clone)]
pub struct LaneQueue {
    inner: Arc<Inner>,
}

impl LaneQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit a task; its result arrives through the returned handle.
    pub fn enqueue<T, F, Fut>(&self, task: F, options: TaskOptions) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let lane = match options.lane.trim() {
            "" => DEFAULT_LANE.to_string(),
            lane => lane.to_string(),
        };
        let job_lane = lane.clone();
        let job = async move {
            let outcome = match AssertUnwindSafe(async move { task().await }).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    tracing::error!(lane = %job_lane, error = %e, "Queued task failed");
                    Err(TaskError::Failed(e.to_string()))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(lane = %job_lane, panic = %message, "Queued task panicked");
                    Err(TaskError::Panicked(message))
                }
            };
            // The caller may have dropped the handle
            let _ = tx.send(outcome);
        }
        .boxed();

        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            tracing::debug!(lane = %lane, priority = options.priority, seq, "Task enqueued");
            state.pending.push(QueuedTask {
                job,
                priority: options.priority,
                lane,
                seq,
            });
        }
        self.schedule();

        TaskHandle { rx }
    }

    /// Resolves once nothing is pending or running, including tasks enqueued meanwhile.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.pending.len(),
            running: state.running,
            lanes: state.lane_running.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Jobs run outside the lock, so a poisoned guard still holds consistent state
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule(&self) {
        {
            let mut state = self.lock();
            if state.scheduled {
                return;
            }
            state.scheduled = true;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            queue.lock().scheduled = false;
            queue.run_available();
        });
    }

    fn run_available(&self) {
        let mut state = self.lock();
        while state.running < self.inner.options.max_concurrent.max(1) {
            let Some(index) = self.pick_next(&state) else {
                break;
            };
            let task = state.pending.remove(index);
            state.running += 1;
            *state.lane_running.entry(task.lane.clone()).or_insert(0) += 1;
            tracing::debug!(lane = %task.lane, priority = task.priority, seq = task.seq, "Task started");

            let queue = self.clone();
            let lane = task.lane;
            let job = task.job;
            tokio::spawn(async move {
                job.await;
                queue.finish(&lane);
            });
        }
        if state.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    fn pick_next(&self, state: &QueueState) -> Option<usize> {
        state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, task)| {
                let active = state.lane_running.get(&task.lane).copied().unwrap_or(0);
                active < self.inner.options.lane_limit(&task.lane)
            })
            .min_by_key(|(_, task)| (task.priority, task.seq))
            .map(|(index, _)| index)
    }

    fn finish(&self, lane: &str) {
        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            match state.lane_running.get_mut(lane) {
                Some(active) if *active > 1 => *active -= 1,
                _ => {
                    state.lane_running.remove(lane);
                }
            }
            if state.is_idle() {
                self.inner.idle.notify_waiters();
                return;
            }
        }
        self.schedule();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().expect("events lock").push(event.into());
    }

    fn snapshot(events: &Events) -> Vec<String> {
        events.lock().expect("events lock").clone()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_same_lane_waits_for_blocked_task() {
        let queue = LaneQueue::new(QueueOptions::new(2).with_lane("default", 1).with_lane("memory", 1));
        let events: Events = Arc::default();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let first = events.clone();
        queue.enqueue(
            move || async move {
                record(&first, "task1:start");
                gate_rx.await.ok();
                record(&first, "task1:end");
                Ok(())
            },
            TaskOptions::lane("memory"),
        );
        let second = events.clone();
        queue.enqueue(
            move || async move {
                record(&second, "task2:start");
                Ok(())
            },
            TaskOptions::lane("memory"),
        );

        settle().await;
        assert_eq!(snapshot(&events), vec!["task1:start"]);
        assert_eq!(queue.stats().pending, 1);

        gate_tx.send(()).expect("gate open");
        queue.drain().await;
        assert_eq!(snapshot(&events), vec!["task1:start", "task1:end", "task2:start"]);
    }

    #[tokio::test]
    async fn test_priority_then_submission_order() {
        let queue = LaneQueue::new(QueueOptions::default());
        let events: Events = Arc::default();
        for (name, priority) in [("a", 5), ("b", 1), ("c", 1), ("d", 3)] {
            let events = events.clone();
            queue.enqueue(
                move || async move {
                    record(&events, name);
                    Ok(())
                },
                TaskOptions::default().with_priority(priority),
            );
        }
        queue.drain().await;
        assert_eq!(snapshot(&events), vec!["b", "c", "d", "a"]);
    }

    #[tokio::test]
    async fn test_different_lanes_run_concurrently() {
        let queue = LaneQueue::new(QueueOptions::new(2).with_lane("default", 1));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let mut handles = Vec::new();
        for lane in ["memory", "state"] {
            let barrier = barrier.clone();
            handles.push(queue.enqueue(
                move || async move {
                    barrier.wait().await;
                    Ok(lane)
                },
                TaskOptions::lane(lane),
            ));
        }
        tokio::time::timeout(Duration::from_secs(5), queue.drain())
            .await
            .expect("both lanes ran at once");
        for handle in handles {
            assert!(handle.join().await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let queue = LaneQueue::new(QueueOptions::default());
        let failed = queue.enqueue(|| async { Err::<(), _>(anyhow::anyhow!("upstream 503")) }, TaskOptions::default());
        let panicked = queue.enqueue(
            || async {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            },
            TaskOptions::default(),
        );
        let ok = queue.enqueue(|| async { Ok(7) }, TaskOptions::default());

        assert_eq!(failed.join().await, Err(TaskError::Failed("upstream 503".into())));
        assert_eq!(panicked.join().await, Err(TaskError::Panicked("handler bug".into())));
        assert_eq!(ok.join().await, Ok(7));
        queue.drain().await;
        assert_eq!(queue.stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_drain_includes_tasks_enqueued_while_draining() {
        let queue = LaneQueue::new(QueueOptions::default());
        let events: Events = Arc::default();
        let inner_queue = queue.clone();
        let outer = events.clone();
        queue.enqueue(
            move || async move {
                record(&outer, "outer");
                let inner = outer.clone();
                inner_queue.enqueue(
                    move || async move {
                        record(&inner, "inner");
                        Ok(())
                    },
                    TaskOptions::default(),
                );
                Ok(())
            },
            TaskOptions::default(),
        );
        queue.drain().await;
        assert_eq!(snapshot(&events), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn test_drain_on_empty_queue_returns() {
        let queue = LaneQueue::new(QueueOptions::default());
        tokio::time::timeout(Duration::from_millis(100), queue.drain())
            .await
            .expect("idle queue drains immediately");
    }

    #[test]
    fn test_lane_limit_fallbacks() {
        let options = QueueOptions::new(4).with_lane("default", 2).with_lane("map", 3).with_lane("zero", 0);
        assert_eq!(options.lane_limit("map"), 3);
        assert_eq!(options.lane_limit("memory"), 2);
        assert_eq!(options.lane_limit("zero"), 2);
        assert_eq!(QueueOptions::new(4).lane_limit("memory"), 4);
    }
}
