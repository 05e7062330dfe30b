//! Step Definition Module
//!
//! Data structures and policies that apply to steps before they run.
//!
//! # Structure
//!
//! - [`model`]: Step templates and parameter sets
//! - [`parameters`]: Expansion of a template into concrete instances
//! - [`queue`]: Queue name resolution
//! - [`status`]: Return codes, lifecycle states and status files
//! - [`parser`]: Study loading from YAML

pub mod model;
pub mod parameters;
pub mod parser;
pub mod queue;
pub mod status;

pub use model::{Parameter, ParameterSet, RunConfig, StepTemplate};
pub use parameters::{expand_parameters, Expansion, ExpansionError};
pub use parser::{load_study, LoadError, Study};
pub use queue::{QueueConfig, QueueResolver};
pub use status::{ReturnCode, StatusRecord, StepState};
