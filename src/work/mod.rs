//! Background work scheduling.
//!
//! Job sources turn persistent "needs work" state into [`Job`]s. The
//! [`WorkService`] polls the sources in priority order, keeps the jobs in a
//! deduplicating priority queue and runs them one at a time under a CPU
//! throttle.

pub mod queue;
pub mod service;
pub mod throttle;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use queue::UniquePriorityQueue;
pub use service::{Iteration, WorkService};
pub use throttle::{throttle_delay, CpuLevelSettings};

/// Scheduling priority. Lower values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    FullIndexing = 0,
    ExifService = 1,
    Indexing = 2,
    Metadata = 3,
    Thumbnails = 4,
    Cleanup = 5,
}

impl JobPriority {
    pub fn value(&self) -> u32 {
        *self as u32
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            JobPriority::FullIndexing => "Full Indexing",
            JobPriority::ExifService => "Metadata Writing",
            JobPriority::Indexing => "Indexing",
            JobPriority::Metadata => "Metadata Scan",
            JobPriority::Thumbnails => "Thumbnails",
            JobPriority::Cleanup => "Cleanup",
        }
    }
}

/// A unit of background work.
///
/// The description identifies the work: two jobs with equal descriptions
/// are the same job and only one of them is ever queued.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String;

    fn priority(&self) -> JobPriority;

    /// Checked just before execution; a job that returns false is dropped.
    fn can_process(&self) -> bool {
        true
    }

    async fn process(&self) -> Result<()>;
}

/// A producer of jobs.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> JobPriority;

    /// Up to `max_count` jobs currently pending. Called by the scheduler only.
    async fn pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>>;
}

/// Sticky "new work is available" flag shared between producers and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct JobSignal(Arc<AtomicBool>);

impl JobSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks and never enqueues anything itself.
    pub fn flag(&self, source: &str) {
        tracing::debug!(source, "New jobs flagged");
        self.0.store(true, Ordering::SeqCst);
    }

    /// Read and clear the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Idle,
    Running,
    Paused,
    Disabled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Disabled => "disabled",
        }
    }
}

/// Snapshot of what the scheduler is doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: JobStatus,
    pub status_text: String,
    pub cpu_level: u8,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            status: JobStatus::Idle,
            status_text: String::new(),
            cpu_level: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_is_sticky_until_taken() {
        let signal = JobSignal::new();
        let producer = signal.clone();
        assert!(!signal.take());

        producer.flag("test");
        producer.flag("test");
        assert!(signal.is_set());
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn test_priority_order() {
        let mut priorities = vec![
            JobPriority::Cleanup,
            JobPriority::Indexing,
            JobPriority::FullIndexing,
            JobPriority::ExifService,
        ];
        priorities.sort();
        assert_eq!(priorities[0], JobPriority::FullIndexing);
        assert_eq!(priorities[1], JobPriority::ExifService);
        assert_eq!(JobPriority::Cleanup.value(), 5);
    }
}
