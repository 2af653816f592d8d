//! Scheduled background tasks with explicit cancellation handles.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, MissedTickBehavior};

use crate::lifecycle::Shutdown;

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: &'static str,
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the task. Idempotent.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Owner of every periodic job in the subsystem.
pub struct Scheduler {
    shutdown: Shutdown,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `job` every `period`, first run one period from now.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, job: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => job().await,
                    _ = shutdown.recv() => {
                        tracing::debug!(task = name, "scheduled task stopping");
                        break;
                    }
                }
            }
        });
        self.register(name, handle)
    }

    /// Run `fut` once after `delay`.
    pub fn after<Fut>(&self, name: &'static str, delay: Duration, fut: Fut) -> TaskHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => fut.await,
                _ = shutdown.recv() => {}
            }
        });
        self.register(name, handle)
    }

    /// Run `fut` until it completes or shutdown is signalled.
    pub fn spawn<Fut>(&self, name: &'static str, fut: Fut) -> TaskHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = shutdown.recv() => {}
            }
        });
        self.register(name, handle)
    }

    fn register(&self, name: &'static str, handle: JoinHandle<()>) -> TaskHandle {
        let task = TaskHandle {
            name,
            abort: handle.abort_handle(),
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name, handle));
        task
    }

    /// Number of tasks not yet finished.
    pub fn active_tasks(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Signal every task and abort whatever is still running.
    ///
    /// The scheduler is reusable afterwards; jobs spawned later run normally.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for (name, handle) in handles {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(task = name, error = %e, "scheduled task panicked");
                }
            }
        }
        self.shutdown.reset();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_every_runs_periodically() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        scheduler.every("tick", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_handle_stops_task() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = scheduler.every("tick", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_millis(1500)).await;
        handle.cancel();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_one_shot() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        scheduler.after("later", Duration::from_secs(10), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.active_tasks(), 1);

        scheduler.shutdown().await;
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.active_tasks(), 0);
    }
}
