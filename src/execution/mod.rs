//! Step Execution Module
//!
//! Tracks concrete step instances and hands them to an execution runtime.
//!
//! # Architecture
//!
//! - [`instance`]: Step instance state machine and status persistence
//! - [`adapter`]: Bridge between instances and an execution adapter
//! - [`runner`]: Retry/restart driver and parallel scheduling

pub mod adapter;
pub mod instance;
pub mod runner;

pub use adapter::{
    AdapterConfig, AdapterError, ExecutionBridge, ExecutionError, LocalAdapter, ScriptAdapter,
    Submission,
};
pub use instance::StepInstance;
pub use runner::{RunSummary, StepRunner};
