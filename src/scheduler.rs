use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

type Executor = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct PeriodicJob {
    pub name: String,
    pub interval: Duration,
    pub run_on_start: bool,
    executor: Executor,
}

impl PeriodicJob {
    pub fn new<F>(name: impl Into<String>, interval: Duration, executor: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            interval,
            run_on_start: false,
            executor: Arc::new(executor),
        }
    }

    pub fn run_on_start(mut self) -> Self {
        self.run_on_start = true;
        self
    }
}

#[derive(Debug, Default)]
struct JobState {
    in_progress: AtomicBool,
    completed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCounters {
    pub completed: u64,
    pub skipped: u64,
}

// A tick that lands while the same job is still running is skipped.
#[derive(Clone, Default)]
pub struct JobScheduler {
    handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
    states: Arc<Mutex<Vec<(String, Arc<JobState>)>>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, job: PeriodicJob) {
        let state = Arc::new(JobState::default());
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job.name.clone(), state.clone()));

        let name = job.name.clone();
        let handle = tokio::spawn(run_loop(job, state));
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, handle));
    }

    pub fn counters(&self, name: &str) -> Option<JobCounters> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.iter().find(|(job, _)| job == name).map(|(_, state)| JobCounters {
            completed: state.completed.load(Ordering::SeqCst),
            skipped: state.skipped.load(Ordering::SeqCst),
        })
    }

    pub fn job_names(&self) -> Vec<String> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn shutdown(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, handle) in handles.drain(..) {
            handle.abort();
            tracing::info!(job = %name, "scheduled job stopped");
        }
    }
}

async fn run_loop(job: PeriodicJob, state: Arc<JobState>) {
    let mut interval = tokio::time::interval(job.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !job.run_on_start {
        interval.tick().await;
    }
    loop {
        interval.tick().await;
        if state.in_progress.swap(true, Ordering::SeqCst) {
            state.skipped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(job = %job.name, "previous run still in progress; skipping tick");
            continue;
        }

        let executor = job.executor.clone();
        let name = job.name.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            match tokio::task::spawn_blocking(move || executor()).await {
                Ok(Ok(())) => {
                    tracing::info!(job = %name, elapsed_ms = started.elapsed().as_millis() as u64, "scheduled job finished");
                }
                Ok(Err(error)) => {
                    tracing::warn!(job = %name, error = %error, "scheduled job failed");
                }
                Err(error) => {
                    tracing::warn!(job = %name, error = %error, "scheduled job panicked");
                }
            }
            state.completed.fetch_add(1, Ordering::SeqCst);
            state.in_progress.store(false, Ordering::SeqCst);
        });
    }
}
