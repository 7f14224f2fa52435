//! Periodic, non-reentrant background task

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::util::lock;

/// Unit of work run by a [`SyncTask`]
#[async_trait]
pub trait TaskJob: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

struct TaskInner {
    job: Arc<dyn TaskJob>,
    period: Duration,
    trigger: Option<Arc<Notify>>,
    running: AtomicBool,
    executing: AtomicBool,
    generation: AtomicU64,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

/// Clears the executing flag when a run ends, panics included
struct ExecutingGuard(Arc<TaskInner>);

impl Drop for ExecutingGuard {
    fn drop(&mut self) {
        self.0.executing.store(false, Ordering::SeqCst);
    }
}

/// Runs a job every `period`, optionally also when `trigger` is notified.
///
/// At most one run is in flight: [`SyncTask::execute`] while executing is a
/// no-op. [`SyncTask::stop`] cancels the schedule but lets an in-flight run
/// complete.
#[derive(Clone)]
pub struct SyncTask {
    inner: Arc<TaskInner>,
}

impl SyncTask {
    /// A zero `period` runs only on start and on triggers
    pub fn new(job: Arc<dyn TaskJob>, period: Duration) -> Self {
        Self::with_trigger(job, period, None)
    }

    pub fn with_trigger(job: Arc<dyn TaskJob>, period: Duration, trigger: Option<Arc<Notify>>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                job,
                period,
                trigger,
                running: AtomicBool::new(false),
                executing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.job.name()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::SeqCst)
    }

    /// Starts the schedule; a no-op while running.
    ///
    /// Without `first_delay` the job runs right away, otherwise the first run
    /// happens once the delay elapses (or earlier, on trigger).
    pub fn start(&self, first_delay: Option<Duration>) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        *lock(&self.inner.shutdown) = Some(shutdown_tx);

        debug!(task = %self.name(), ?first_delay, "Starting task");
        if first_delay.is_none() {
            self.execute();
        }

        let wait = first_delay.unwrap_or(self.inner.period);
        let task = self.clone();
        tokio::spawn(task.run(generation, wait, shutdown_rx));
    }

    async fn run(self, generation: u64, mut wait: Duration, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let timer = async {
                if wait.is_zero() {
                    std::future::pending::<()>().await
                } else {
                    tokio::time::sleep(wait).await
                }
            };
            let triggered = async {
                match &self.inner.trigger {
                    Some(trigger) => trigger.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = timer => {}
                _ = triggered => {
                    debug!(task = %self.name(), "Task triggered");
                }
                _ = shutdown.recv() => break,
            }

            if !self.is_live(generation) {
                break;
            }
            if let Some(handle) = self.execute() {
                let _ = handle.await;
            }
            wait = self.inner.period;
        }
        debug!(task = %self.name(), "Task loop finished");
    }

    fn is_live(&self, generation: u64) -> bool {
        self.is_running() && self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Stops the schedule
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(shutdown) = lock(&self.inner.shutdown).take() {
            let _ = shutdown.send(());
        }
        debug!(task = %self.name(), "Task stopped");
    }

    /// Runs the job once in the background, unless a run is in flight
    pub fn execute(&self) -> Option<JoinHandle<()>> {
        if self.inner.executing.swap(true, Ordering::SeqCst) {
            debug!(task = %self.name(), "Task already executing");
            return None;
        }
        let inner = self.inner.clone();
        Some(tokio::spawn(async move {
            let _executing = ExecutingGuard(inner.clone());
            if let Err(e) = inner.job.run().await {
                warn!(task = %inner.job.name(), error = %e, "Task run failed");
            }
        }))
    }

    /// Runs the job and waits for it; returns whether it actually ran
    pub async fn execute_now(&self) -> bool {
        match self.execute() {
            Some(handle) => handle.await.is_ok(),
            None => false,
        }
    }
}
