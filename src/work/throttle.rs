use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::WorkConfig;

/// Shortest job time used when computing the pause after a job.
const MIN_JOB_TIME: Duration = Duration::from_millis(100);

/// Longest pause after a single job.
const MAX_WAIT: Duration = Duration::from_secs(10);

/// CPU budget for background work, with an optional alternate level for part of the day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuLevelSettings {
    pub cpu_level: u8,
    pub alt_cpu_level: Option<u8>,
    pub alt_hours_start: Option<u8>,
    pub alt_hours_end: Option<u8>,
}

impl CpuLevelSettings {
    pub fn fixed(cpu_level: u8) -> Self {
        Self {
            cpu_level,
            alt_cpu_level: None,
            alt_hours_start: None,
            alt_hours_end: None,
        }
    }

    pub fn from_config(config: &WorkConfig) -> Self {
        Self {
            cpu_level: config.cpu_level,
            alt_cpu_level: config.alt_cpu_level,
            alt_hours_start: config.alt_hours_start,
            alt_hours_end: config.alt_hours_end,
        }
    }

    /// The percentage in force at local time `now`, clamped to 0-100.
    pub fn current_cpu_limit(&self, now: NaiveTime) -> u8 {
        let level = match (self.alt_cpu_level, self.alt_hours_start, self.alt_hours_end) {
            (Some(alt), Some(start), Some(end)) if in_window(now, start, end) => alt,
            _ => self.cpu_level,
        };
        level.min(100)
    }
}

fn in_window(now: NaiveTime, start: u8, end: u8) -> bool {
    let hour = now.hour();
    let (start, end) = (u32::from(start), u32::from(end));
    if start <= end {
        // Normal range: 9 - 17
        hour >= start && hour < end
    } else {
        // Overnight range: 22 - 6
        hour >= start || hour < end
    }
}

/// Pause after a job so that background work uses roughly `cpu_percent` of wall time.
///
/// Returns zero at 100% (or above), and for 0% which means processing is disabled
/// and never reaches this point.
pub fn throttle_delay(cpu_percent: u8, elapsed: Duration) -> Duration {
    if cpu_percent == 0 || cpu_percent >= 100 {
        return Duration::ZERO;
    }

    // elapsed * (100 / cpu - 1), kept in integer nanoseconds
    let job_time = elapsed.max(MIN_JOB_TIME).as_nanos();
    let percent = u128::from(cpu_percent);
    let wait = job_time * (100 - percent) / percent;

    Duration::from_nanos(wait.min(MAX_WAIT.as_nanos()) as u64)
}
