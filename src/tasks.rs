//! Named background task management.
//!
//! Producers, consumers and connections each own a [`BackgroundTaskRegistry`]
//! holding their periodic loops (flush, report polling, record polling, group
//! and connection heartbeats). Shutdown is signalled to every task through a
//! broadcast channel; dropping the registry aborts whatever is still running,
//! so dropping a component without closing it stops its work immediately.
//!
//! ```rust,no_run
//! use logbridge::tasks::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! # async fn run() {
//! let mut registry = BackgroundTaskRegistry::new();
//! registry.spawn_periodic("flush", Duration::from_millis(100), |_tick| async {
//!     // drain buffers
//! });
//! registry.shutdown_all().await;
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::constants::SHUTDOWN_TIMEOUT;

struct TaskInfo {
    handle: JoinHandle<()>,
    spawned_at: Instant,
}

/// Registry of named background tasks with a shared shutdown signal.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<&'static str, TaskInfo>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named task.
    ///
    /// A task already registered under `name` is aborted and replaced.
    /// The task is cancelled at its next await point once shutdown begins.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            tracing::warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(old) = self.tasks.remove(name) {
            old.handle.abort();
            tracing::debug!(task = name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = name, "Task received shutdown signal");
                }
            }
        });

        tracing::debug!(task = name, "Spawned background task");

        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                spawned_at: Instant::now(),
            },
        );
    }

    /// Spawn a task that runs `task` every `interval`.
    ///
    /// The first tick fires immediately. A tick that overruns the interval
    /// delays the next one rather than bursting to catch up.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, interval: Duration, mut task: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut tick = 0u64;
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                task(tick).await;
                tick = tick.wrapping_add(1);
            }
        });
    }

    /// Abort the task registered under `name`, if any.
    pub fn abort(&mut self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some(info) => {
                info.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a task named `name` is registered and still running.
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|info| !info.handle.is_finished())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    pub fn task_uptime(&self, name: &str) -> Option<Duration> {
        self.tasks.get(name).map(|info| info.spawned_at.elapsed())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Signal shutdown and wait for tasks with the default grace period.
    pub async fn shutdown_all(&mut self) {
        self.shutdown_all_with_timeout(SHUTDOWN_TIMEOUT).await;
    }

    /// Signal shutdown and wait up to `timeout` for tasks to finish.
    /// Tasks still running at the deadline are aborted.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + timeout;

        for (name, info) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(task = name, "Aborting task (timeout exceeded)");
                info.handle.abort();
                continue;
            }

            let abort = info.handle.abort_handle();
            match tokio::time::timeout(remaining, info.handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Task shutdown complete"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    tracing::warn!(task = name, "Task did not respond to shutdown, aborting");
                    abort.abort();
                }
            }
        }
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (name, info) in self.tasks.drain() {
                tracing::trace!(task = name, "Aborting task on registry drop");
                info.handle.abort();
            }
        }
    }
}
