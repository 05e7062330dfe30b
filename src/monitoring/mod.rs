//! Allocation Monitoring Module
//!
//! Watches task-server queues to decide whether a compute allocation is
//! still needed.
//!
//! # Components
//!
//! - [`AllocationMonitor`]: queue depth and worker presence polling
//! - [`TaskServer`]: the queries the monitor depends on

pub mod allocation;

pub use allocation::{AllocationMonitor, MonitorConfig, MonitorError, QueueStats, TaskServer};
