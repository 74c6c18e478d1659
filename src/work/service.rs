use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::queue::UniquePriorityQueue;
use super::throttle::{throttle_delay, CpuLevelSettings};
use super::{Job, JobSignal, JobSource, JobStatus, ServiceStatus};
use crate::config::WorkConfig;
use crate::events::{Notification, Notifier};

/// What a single scheduler iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    Paused,
    /// The effective CPU level is zero.
    Disabled,
    /// A job was taken from the queue (it may have been discarded or failed).
    Processed,
    /// The queue was empty and population found more work.
    Populated,
    /// Nothing to do.
    Idle,
}

/// Single-consumer job scheduler.
///
/// Jobs execute strictly one at a time. Producers never enqueue directly:
/// they persist their pending work and raise the [`JobSignal`], and the
/// scheduler asks every [`JobSource`] for jobs on its next iteration.
pub struct WorkService {
    queue: UniquePriorityQueue<Box<dyn Job>>,
    sources: RwLock<Vec<Arc<dyn JobSource>>>,
    signal: JobSignal,
    paused: AtomicBool,
    cpu_settings: RwLock<CpuLevelSettings>,
    status: Mutex<ServiceStatus>,
    notifier: Arc<dyn Notifier>,
    max_queue_size: usize,
    poll_interval: Duration,
}

impl WorkService {
    pub fn new(config: &WorkConfig, signal: JobSignal, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            queue: UniquePriorityQueue::new(|job: &Box<dyn Job>| job.description()),
            sources: RwLock::new(Vec::new()),
            signal,
            paused: AtomicBool::new(false),
            cpu_settings: RwLock::new(CpuLevelSettings::from_config(config)),
            status: Mutex::new(ServiceStatus::default()),
            notifier,
            max_queue_size: config.max_queue_size.max(1),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    pub fn add_job_source(&self, source: Arc<dyn JobSource>) {
        info!(
            source = source.name(),
            priority = source.priority().display_name(),
            "Registered job source"
        );
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        sources.push(source);
        sources.sort_by_key(|s| s.priority());
    }

    /// Handle producers use to announce new work.
    pub fn signal(&self) -> JobSignal {
        self.signal.clone()
    }

    pub fn flag_new_jobs(&self, source: &str) {
        self.signal.flag(source);
    }

    pub fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        info!(paused, "Background work pause toggled");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cpu_settings(&self) -> CpuLevelSettings {
        self.cpu_settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_cpu_settings(&self, settings: CpuLevelSettings) {
        info!(cpu = settings.cpu_level, alt = ?settings.alt_cpu_level, "CPU settings updated");
        *self.cpu_settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn set_status(&self, status: JobStatus, text: &str, cpu_level: u8) {
        let changed = {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if current.status == status
                && current.status_text == text
                && current.cpu_level == cpu_level
            {
                None
            } else {
                current.status = status;
                current.status_text = text.to_string();
                current.cpu_level = cpu_level;
                Some(current.clone())
            }
        };

        if let Some(snapshot) = changed {
            self.notifier.notify(Notification::WorkStatus(snapshot));
        }
    }

    /// Run forever, sleeping for the poll interval whenever there is nothing to do.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            max_queue = self.max_queue_size,
            "Work service started"
        );
        loop {
            match self.iterate().await {
                Iteration::Processed | Iteration::Populated => {}
                Iteration::Paused | Iteration::Disabled | Iteration::Idle => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Process work until an iteration finds nothing to do, then return that iteration.
    pub async fn run_until_idle(&self) -> Iteration {
        loop {
            match self.iterate().await {
                Iteration::Processed | Iteration::Populated => continue,
                other => return other,
            }
        }
    }

    /// One pass of the scheduler loop.
    pub async fn iterate(&self) -> Iteration {
        let cpu_level = self.cpu_settings().current_cpu_limit(Local::now().time());

        if self.is_paused() {
            self.set_status(JobStatus::Paused, "Paused", cpu_level);
            return Iteration::Paused;
        }

        if cpu_level == 0 {
            self.set_status(JobStatus::Disabled, "Disabled", cpu_level);
            return Iteration::Disabled;
        }

        if self.signal.take() {
            self.populate_job_queue().await;
        }

        if let Some(job) = self.queue.try_dequeue() {
            self.process_job(job, cpu_level).await;
            return Iteration::Processed;
        }

        if self.populate_job_queue().await > 0 {
            return Iteration::Populated;
        }

        self.set_status(JobStatus::Idle, "", cpu_level);
        Iteration::Idle
    }

    async fn process_job(&self, job: Box<dyn Job>, cpu_level: u8) {
        if !job.can_process() {
            debug!(job = job.name(), description = %job.description(), "Job discarded");
            return;
        }

        let job: Arc<dyn Job> = Arc::from(job);
        self.set_status(JobStatus::Running, job.name(), cpu_level);

        let started = Instant::now();
        let runner = Arc::clone(&job);
        // Awaited immediately, so jobs still run one at a time; the task boundary catches panics
        let outcome = tokio::spawn(async move { runner.process().await }).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(())) => debug!(
                job = job.name(),
                description = %job.description(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Job complete"
            ),
            Ok(Err(e)) => error!(
                job = job.name(),
                description = %job.description(),
                error = %e,
                "Job failed"
            ),
            Err(e) => error!(
                job = job.name(),
                description = %job.description(),
                error = %e,
                "Job aborted"
            ),
        }

        let delay = throttle_delay(cpu_level, elapsed);
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Throttling");
            tokio::time::sleep(delay).await;
        }
    }

    /// Ask each source, most urgent first, for as many jobs as the queue has room for.
    /// Returns the number of jobs added.
    async fn populate_job_queue(&self) -> usize {
        let sources: Vec<Arc<dyn JobSource>> = self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut added = 0;
        for source in sources {
            let capacity = self.max_queue_size.saturating_sub(self.queue.len());
            if capacity == 0 {
                break;
            }

            match source.pending_jobs(capacity).await {
                Ok(jobs) => {
                    for job in jobs {
                        let priority = job.priority().value();
                        if self.queue.try_add(job, priority) {
                            added += 1;
                        }
                    }
                }
                Err(e) => warn!(source = source.name(), error = %e, "Failed to fetch pending jobs"),
            }
        }

        if added > 0 {
            debug!(added, queued = self.queue.len(), "Job queue populated");
        }
        added
    }
}
