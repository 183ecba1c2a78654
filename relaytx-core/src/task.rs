//! Background-work pool used to offload hashing and spool I/O onto
//! worker threads without blocking a transfer's own domain (§5).
//!
//! Every spawned unit of work gets a [`CancellationToken`] and races
//! against it in a `tokio::select!`, reporting completion or failure
//! through a shared event channel. Generic over a result type `T`, since
//! the transfer domain offloads typed work (a hash, a spool write) rather
//! than dispatching arbitrary remote commands.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Events emitted by background tasks to signal completion or failure.
#[derive(Debug)]
pub enum TaskEvent {
    Finished(u64),
    Error(u64, TaskError),
}

/// Configuration for a spawned task.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub name: Option<String>,
    pub timeout: Option<Duration>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A handle to one spawned background task.
pub struct Task {
    handle: tokio::task::JoinHandle<()>,
    token: CancellationToken,
    spawned_at: Instant,
    name: Option<String>,
}

impl Task {
    /// Spawn `work`, racing it against cancellation and an optional
    /// timeout, reporting the outcome on `event_tx` tagged with `id`.
    pub fn spawn<Fut>(id: u64, work: Fut, event_tx: mpsc::Sender<TaskEvent>, options: TaskOptions) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child_token = token.child_token();
        let timeout = options.timeout;

        let handle = tokio::spawn(async move {
            match timeout {
                Some(dur) => {
                    tokio::select! {
                        biased;
                        _ = child_token.cancelled() => {
                            let _ = event_tx.send(TaskEvent::Error(id, TaskError::Cancelled)).await;
                            return;
                        }
                        _ = tokio::time::sleep(dur) => {
                            let _ = event_tx.send(TaskEvent::Error(id, TaskError::Timeout(dur))).await;
                            return;
                        }
                        () = work => {}
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = child_token.cancelled() => {
                            let _ = event_tx.send(TaskEvent::Error(id, TaskError::Cancelled)).await;
                            return;
                        }
                        () = work => {}
                    }
                }
            }
            let _ = event_tx.send(TaskEvent::Finished(id)).await;
        });

        Self {
            handle,
            token,
            spawned_at: Instant::now(),
            name: options.name,
        }
    }

    /// Signal cooperative cancellation of this task.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// A child token downstream work can poll for cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// True once the task's future has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Pool tracking in-flight background tasks by an opaque `u64` id
/// (e.g. a chunk sequence, for a spooled write or a verify-hash job).
pub struct TaskPool {
    tasks: HashMap<u64, Task>,
    pool_rx: mpsc::Receiver<TaskEvent>,
    pool_tx: mpsc::Sender<TaskEvent>,
}

impl TaskPool {
    pub fn new() -> Self {
        let (pool_tx, pool_rx) = mpsc::channel(1024);
        Self {
            tasks: HashMap::new(),
            pool_rx,
            pool_tx,
        }
    }

    /// Spawn a task with default options (no timeout, no name).
    pub fn spawn<Fut>(&mut self, id: u64, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_with_options(id, work, TaskOptions::default());
    }

    pub fn spawn_with_options<Fut>(&mut self, id: u64, work: Fut, options: TaskOptions)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Task::spawn(id, work, self.pool_tx.clone(), options);
        self.tasks.insert(id, task);
    }

    pub fn cancel_task(&self, id: u64) -> bool {
        if let Some(task) = self.tasks.get(&id) {
            task.cancel();
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) {
        for task in self.tasks.values() {
            task.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn get_task(&self, id: u64) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Receive the next event, or `None` if all senders dropped.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.pool_rx.recv().await
    }

    /// Process a single task event, removing the task it concerns.
    pub async fn process_event(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Finished(id) => {
                self.tasks.remove(id);
            }
            TaskEvent::Error(id, err) => {
                self.tasks.remove(id);
                tracing::warn!(task_id = id, error = %err, "background task failed");
            }
        }
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_finish() {
        let mut pool = TaskPool::new();
        pool.spawn(1, async {});

        assert_eq!(pool.active_count(), 1);
        assert!(pool.is_active(1));

        let event = pool.recv().await.unwrap();
        assert!(matches!(event, TaskEvent::Finished(1)));
        pool.process_event(&event).await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_task_signals_cancelled() {
        let mut pool = TaskPool::new();
        pool.spawn(42, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        assert!(pool.cancel_task(42));

        let event = pool.recv().await.unwrap();
        match event {
            TaskEvent::Error(id, ref err) => {
                assert_eq!(id, 42);
                assert!(matches!(err, TaskError::Cancelled));
            }
            _ => panic!("expected Error(Cancelled)"),
        }
    }

    #[tokio::test]
    async fn timeout_auto_cancels() {
        let mut pool = TaskPool::new();
        let opts = TaskOptions::new().with_timeout(Duration::from_millis(10));

        pool.spawn_with_options(
            99,
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            },
            opts,
        );

        let event = pool.recv().await.unwrap();
        match event {
            TaskEvent::Error(id, ref err) => {
                assert_eq!(id, 99);
                assert!(matches!(err, TaskError::Timeout(_)));
            }
            _ => panic!("expected Error(Timeout)"),
        }
    }

    #[test]
    fn cancel_unknown_returns_false() {
        let pool = TaskPool::new();
        assert!(!pool.cancel_task(999));
    }
}
