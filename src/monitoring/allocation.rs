//! Allocation Keep-Alive Monitor
//!
//! Polls a task server to decide whether a compute allocation still has
//! outstanding work.
//!
//! A non-empty queue with no consumers is only treated as work if one of the
//! expected workers shows up within a bounded number of polls. Otherwise the
//! monitor logs the anomaly and reports nothing outstanding, so a stuck queue
//! with no worker does not hold the allocation forever.

use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default pause between polls, in seconds.
pub const DEFAULT_SLEEP_SECS: u64 = 60;

/// Default number of worker polls before giving up on an idle queue.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("task server unreachable: {0}")]
    Unreachable(String),

    #[error("query for queue '{queue}' failed: {reason}")]
    Query { queue: String, reason: String },
}

/// Depth and consumer count of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub pending: u64,
    pub consumers: u64,
}

impl QueueStats {
    pub fn new(name: impl Into<String>, pending: u64, consumers: u64) -> Self {
        Self {
            name: name.into(),
            pending,
            consumers,
        }
    }
}

/// Read-only queries against the external task server.
pub trait TaskServer {
    /// Pending task and consumer counts for each of `queues`.
    fn queue_stats(&self, queues: &[String]) -> Result<Vec<QueueStats>, MonitorError>;

    /// Identities of the live workers, usually `name@host`.
    fn active_workers(&self) -> Result<Vec<String>, MonitorError>;
}

/// Monitor settings from the study file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Expected worker names, matched as substrings of live identities.
    ///
    /// Left empty, no worker ever matches: a non-empty queue without
    /// consumers always spends the attempt budget and then counts as idle.
    #[serde(default)]
    pub workers: Vec<String>,
}

fn default_sleep_secs() -> u64 {
    DEFAULT_SLEEP_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sleep_secs: DEFAULT_SLEEP_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            workers: Vec::new(),
        }
    }
}

/// Keeps an allocation alive while its queues have work.
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
/// use steprunner::monitoring::AllocationMonitor;
///
/// let monitor = AllocationMonitor::new(server, queues, workers, Duration::from_secs(60));
/// monitor.run()?; // returns once nothing is left to wait for
/// ```
pub struct AllocationMonitor<S> {
    server: S,
    queues: Vec<String>,
    worker_names: Vec<String>,
    interval: Duration,
    max_attempts: u32,
}

impl<S: TaskServer> AllocationMonitor<S> {
    pub fn new(
        server: S,
        queues: impl IntoIterator<Item = String>,
        worker_names: impl IntoIterator<Item = String>,
        interval: Duration,
    ) -> Self {
        Self {
            server,
            queues: queues.into_iter().collect(),
            worker_names: worker_names.into_iter().collect(),
            interval,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Builds a monitor from study settings.
    pub fn from_config(
        server: S,
        queues: impl IntoIterator<Item = String>,
        config: &MonitorConfig,
    ) -> Self {
        if config.workers.is_empty() {
            warn!(
                "Monitor: no expected workers configured; queues without consumers will be treated as idle"
            );
        }
        Self::new(
            server,
            queues,
            config.workers.iter().cloned(),
            Duration::from_secs(config.sleep_secs),
        )
        .with_max_attempts(config.max_attempts)
    }

    /// Sets how many worker polls an idle queue gets.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Takes one sample and returns the number of tasks worth waiting for.
    ///
    /// Zero means the allocation can be released.
    pub fn check_status(&self) -> Result<u64, MonitorError> {
        let stats = self.server.queue_stats(&self.queues)?;
        let pending: u64 = stats.iter().map(|s| s.pending).sum();
        let consumers: u64 = stats.iter().map(|s| s.consumers).sum();
        debug!(
            "Monitor: {} pending task(s), {} consumer(s) on {} queue(s)",
            pending,
            consumers,
            stats.len()
        );

        if pending == 0 || consumers > 0 {
            return Ok(pending);
        }

        for attempt in 1..=self.max_attempts {
            let live = self.server.active_workers()?;
            info!(
                "Monitor: checking for workers ({}/{}), running workers = {:?}",
                attempt, self.max_attempts, live
            );

            if self.expected_worker_present(&live) {
                return Ok(pending);
            }
            thread::sleep(self.interval);
        }

        error!(
            "Monitor: no workers available to process {} queued task(s)",
            pending
        );
        Ok(0)
    }

    /// Blocks while the queues have work.
    ///
    /// Sleeps once before the first sample so freshly submitted tasks have
    /// time to reach the queues.
    pub fn run(&self) -> Result<(), MonitorError> {
        info!(
            "Monitor: watching {} queue(s) every {}s",
            self.queues.len(),
            self.interval.as_secs()
        );
        thread::sleep(self.interval);

        loop {
            let pending = self.check_status()?;
            if pending == 0 {
                info!("Monitor: no outstanding work, releasing allocation");
                return Ok(());
            }
            info!("Monitor: {} task(s) outstanding", pending);
            thread::sleep(self.interval);
        }
    }

    fn expected_worker_present(&self, live: &[String]) -> bool {
        self.worker_names
            .iter()
            .any(|expected| live.iter().any(|identity| identity.contains(expected.as_str())))
    }
}
