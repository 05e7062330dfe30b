//! StepRunner - Workflow Step Lifecycle Manager
//!
//! Turns step templates into concrete, trackable step instances and drives
//! each one through submission, retry/restart and termination, recording its
//! state in a status file inside its workspace.
//!
//! # Architecture
//!
//! The library is organized into three main modules:
//!
//! - [`workflow`]: Step templates, parameter expansion, queue naming, status files
//! - [`execution`]: Step instances, the adapter bridge and the step runner
//! - [`monitoring`]: Allocation keep-alive monitor
//!
//! # Example
//!
//! ```rust,no_run
//! use steprunner::execution::{ExecutionBridge, LocalAdapter, StepRunner};
//! use steprunner::load_study;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a study from YAML
//!     let study = load_study("study.yaml")?;
//!
//!     // Build a runner on the local adapter
//!     let bridge = ExecutionBridge::new(study.adapter.clone(), LocalAdapter::new());
//!     let mut runner = StepRunner::new(bridge, study.queue_resolver(), study.workspace_root());
//!     runner.set_max_parallel(4);
//!
//!     // Run every step
//!     let summary = runner.run_all(&study.steps, &study.parameters)?;
//!     println!("{} instances", summary.len());
//!     Ok(())
//! }
//! ```

pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use execution::instance::StepInstance;
pub use execution::runner::StepRunner;
pub use workflow::model::{ParameterSet, StepTemplate};
pub use workflow::parser::{load_study, Study};
pub use workflow::status::{ReturnCode, StepState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "StepRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "StepRunner");
    }

    #[test]
    fn test_module_exports_template() {
        let step = StepTemplate::new("sim", "echo test");
        assert_eq!(step.name, "sim");
        assert_eq!(step.cmd(), "echo test");
    }

    #[test]
    fn test_module_exports_instance() {
        let step = StepTemplate::new("sim", "echo test");
        let inst = StepInstance::from_template(&step, "sim");
        assert_eq!(inst.state(), StepState::Initialized);
        assert_eq!(ReturnCode::Ok.code(), 0);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
