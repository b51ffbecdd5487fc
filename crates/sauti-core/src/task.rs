//! Bounded worker fleet for out-of-band work.
//!
//! Sessions hand detached work (tool calls, image description, long TTS
//! batches) to a process-global manager. Admission is bounded by a
//! per-client quota; execution observes the owning session's cancellation
//! scope; completion callbacks run on their own task so they can never
//! deadlock the worker that produced the result.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::TaskManagerConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    ToolCall,
    ImageDescription,
    TtsBatch,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ToolCall => "tool_call",
            TaskKind::ImageDescription => "image_description",
            TaskKind::TtsBatch => "tts_batch",
        }
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;

/// Invoked with the task result on its own task. Not called for cancelled
/// tasks: the owning session is gone or no longer wants the result.
pub type TaskCallback = Box<dyn FnOnce(TaskOutcome) + Send>;

pub struct TaskOutcome {
    pub client_id: String,
    pub kind: TaskKind,
    pub result: Result<serde_json::Value>,
}

/// Owned by the task manager while queued or running; the result transfers
/// to the callback on completion.
pub struct TaskDescriptor {
    pub client_id: String,
    pub kind: TaskKind,
    pub work: TaskFuture,
    pub callback: TaskCallback,
    /// Fired by the owning session's scope; the worker observes it at the
    /// next suspension point.
    pub cancel: CancellationToken,
}

pub struct TaskManager {
    config: TaskManagerConfig,
    queue_tx: mpsc::UnboundedSender<TaskDescriptor>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<TaskDescriptor>>>,
    quotas: Arc<std::sync::Mutex<HashMap<String, usize>>>,
    stop: CancellationToken,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            quotas: Arc::new(std::sync::Mutex::new(HashMap::new())),
            stop: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().expect("worker list lock");
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.config.max_workers.max(1) {
            let manager = Arc::clone(self);
            workers.push(tokio::spawn(async move { manager.run_worker(worker_id).await }));
        }
    }

    /// Non-blocking submission. Fails fast with
    /// [`Error::QuotaExceeded`] beyond the per-client quota.
    pub fn submit(&self, descriptor: TaskDescriptor) -> Result<()> {
        {
            let mut quotas = self.quotas.lock().expect("quota lock");
            let count = quotas.entry(descriptor.client_id.clone()).or_insert(0);
            if *count >= self.config.max_tasks_per_client {
                return Err(Error::QuotaExceeded {
                    client_id: descriptor.client_id.clone(),
                    limit: self.config.max_tasks_per_client,
                });
            }
            *count += 1;
        }

        let client_id = descriptor.client_id.clone();
        if self.queue_tx.send(descriptor).is_err() {
            self.release_quota(&client_id);
            return Err(Error::Internal("task manager stopped".to_string()));
        }
        Ok(())
    }

    pub fn active_tasks(&self, client_id: &str) -> usize {
        self.quotas
            .lock()
            .expect("quota lock")
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let workers: Vec<_> = {
            let mut guard = self.workers.lock().expect("worker list lock");
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(err) = worker.await {
                if err.is_panic() {
                    error!("task worker panicked during shutdown: {err}");
                }
            }
        }
    }

    fn release_quota(&self, client_id: &str) {
        let mut quotas = self.quotas.lock().expect("quota lock");
        if let Some(count) = quotas.get_mut(client_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                quotas.remove(client_id);
            }
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        loop {
            let descriptor = {
                let mut queue = tokio::select! {
                    _ = self.stop.cancelled() => return,
                    queue = self.queue_rx.lock() => queue,
                };
                tokio::select! {
                    _ = self.stop.cancelled() => return,
                    descriptor = queue.recv() => match descriptor {
                        Some(descriptor) => descriptor,
                        None => return,
                    },
                }
            };

            let TaskDescriptor {
                client_id,
                kind,
                work,
                callback,
                cancel,
            } = descriptor;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker_id, client = %client_id, kind = kind.as_str(), "task cancelled");
                    None
                }
                _ = self.stop.cancelled() => None,
                result = work => Some(result),
            };
            self.release_quota(&client_id);

            let Some(result) = outcome else {
                continue;
            };

            // Dedicated task per callback; a panic there is observed via the
            // join handle and never reaches the worker.
            let outcome = TaskOutcome {
                client_id: client_id.clone(),
                kind,
                result,
            };
            let callback_handle = tokio::spawn(async move { callback(outcome) });
            tokio::spawn(async move {
                if let Err(err) = callback_handle.await {
                    if err.is_panic() {
                        warn!(client = %client_id, kind = kind.as_str(), "task callback panicked");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager(max_workers: usize, max_tasks_per_client: usize) -> Arc<TaskManager> {
        let manager = TaskManager::new(TaskManagerConfig {
            max_workers,
            max_tasks_per_client,
        });
        manager.start();
        manager
    }

    fn descriptor(
        client_id: &str,
        cancel: CancellationToken,
        work: TaskFuture,
        callback: TaskCallback,
    ) -> TaskDescriptor {
        TaskDescriptor {
            client_id: client_id.to_string(),
            kind: TaskKind::ToolCall,
            work,
            callback,
            cancel,
        }
    }

    #[tokio::test]
    async fn completed_task_reaches_callback() {
        let manager = manager(2, 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .submit(descriptor(
                "c1",
                CancellationToken::new(),
                Box::pin(async { Ok(serde_json::json!({"temp": "22℃"})) }),
                Box::new(move |outcome| {
                    let _ = tx.send(outcome.result.expect("task result"));
                }),
            ))
            .expect("submission within quota");

        let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("callback should fire")
            .expect("channel open");
        assert_eq!(value["temp"], "22℃");
        assert_eq!(manager.active_tasks("c1"), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn quota_rejects_excess_submissions_without_blocking() {
        let manager = manager(1, 2);
        let gate = CancellationToken::new();

        for _ in 0..2 {
            let gate = gate.clone();
            manager
                .submit(descriptor(
                    "greedy",
                    CancellationToken::new(),
                    Box::pin(async move {
                        gate.cancelled().await;
                        Ok(serde_json::Value::Null)
                    }),
                    Box::new(|_| {}),
                ))
                .expect("within quota");
        }

        let err = manager
            .submit(descriptor(
                "greedy",
                CancellationToken::new(),
                Box::pin(async { Ok(serde_json::Value::Null) }),
                Box::new(|_| {}),
            ))
            .expect_err("third submission exceeds quota");
        assert_eq!(err.kind(), "quota_exceeded");

        // Other clients are unaffected by the greedy one.
        manager
            .submit(descriptor(
                "polite",
                CancellationToken::new(),
                Box::pin(async { Ok(serde_json::Value::Null) }),
                Box::new(|_| {}),
            ))
            .expect("other client within quota");

        gate.cancel();
        manager.stop().await;
    }

    #[tokio::test]
    async fn cancelled_task_skips_callback_and_frees_quota() {
        let manager = manager(1, 1);
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);

        manager
            .submit(descriptor(
                "c1",
                cancel.clone(),
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(serde_json::Value::Null)
                }),
                Box::new(move |_| {
                    fired_in_cb.fetch_add(1, Ordering::SeqCst);
                }),
            ))
            .expect("submission");

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(manager.active_tasks("c1"), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn panicking_callback_does_not_corrupt_the_worker() {
        let manager = manager(1, 4);
        manager
            .submit(descriptor(
                "c1",
                CancellationToken::new(),
                Box::pin(async { Ok(serde_json::Value::Null) }),
                Box::new(|_| panic!("callback bug")),
            ))
            .expect("submission");

        // The same single worker must still process a follow-up task.
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager
            .submit(descriptor(
                "c1",
                CancellationToken::new(),
                Box::pin(async { Ok(serde_json::json!("ok")) }),
                Box::new(move |outcome| {
                    let _ = tx.send(outcome.result.expect("task result"));
                }),
            ))
            .expect("submission");

        let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("worker survived the panicking callback")
            .expect("channel open");
        assert_eq!(value, "ok");
        manager.stop().await;
    }
}
