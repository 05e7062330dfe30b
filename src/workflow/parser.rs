//! Study Loader
//!
//! Loads a study definition from YAML and checks it before anything runs.
//! A study that fails to load leaves no workspace behind.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use super::model::{ParameterSet, StepTemplate};
use super::parameters::{instances_for, validate_parameters, ExpansionError};
use super::queue::{QueueConfig, QueueError, QueueResolver};
use crate::execution::adapter::AdapterConfig;
use crate::monitoring::allocation::MonitorConfig;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read study file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse study YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("study '{0}' defines no steps")]
    NoSteps(String),

    #[error("step #{0} has an empty name")]
    EmptyStepName(usize),

    #[error("step name '{0}' must not contain whitespace")]
    WhitespaceInStepName(String),

    #[error("step '{0}' is defined more than once")]
    DuplicateStep(String),

    #[error("step '{0}' has an empty command")]
    EmptyCommand(String),

    #[error(transparent)]
    Parameters(#[from] ExpansionError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// A loaded study: settings plus the step templates to run.
#[derive(Deserialize, Debug, Clone)]
pub struct Study {
    pub name: String,

    /// Root of all instance workspaces; defaults to the study name
    #[serde(default)]
    pub workspace: Option<PathBuf>,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub adapter: AdapterConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub parameters: ParameterSet,

    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

impl Study {
    /// Workspace root, as configured or named after the study.
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.name))
    }

    /// Resolver for this study's queue settings.
    pub fn queue_resolver(&self) -> QueueResolver {
        QueueResolver::new(self.queues.clone())
    }

    /// Sorted queue names the steps are routed to.
    pub fn queue_names(&self) -> Result<Vec<String>, QueueError> {
        Ok(self
            .queue_resolver()
            .queues_for(&self.steps)?
            .into_iter()
            .collect())
    }

    pub fn step(&self, name: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Checks the study for configuration errors.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.steps.is_empty() {
            return Err(LoadError::NoSteps(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            let name = step.name.trim();
            if name.is_empty() {
                return Err(LoadError::EmptyStepName(i + 1));
            }
            if name.chars().any(char::is_whitespace) {
                return Err(LoadError::WhitespaceInStepName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(LoadError::DuplicateStep(name.to_string()));
            }
            if step.cmd().trim().is_empty() {
                return Err(LoadError::EmptyCommand(name.to_string()));
            }
        }

        if !self.parameters.is_empty() {
            let count = validate_parameters(&self.parameters)?;
            debug!(
                "{} parameter(s) with {} value(s) each",
                self.parameters.len(),
                count
            );

            // Expanding touches no files; it surfaces bad instance names here.
            let root = self.workspace_root();
            for step in &self.steps {
                instances_for(step, &self.parameters, &root)?;
            }
        }

        self.queue_names()?;
        Ok(())
    }
}

/// Parses and validates a study from YAML text.
pub fn parse_study(yaml: &str) -> Result<Study, LoadError> {
    let study: Study = serde_yaml::from_str(yaml)?;
    study.validate()?;
    Ok(study)
}

/// Loads a study file.
///
/// A relative workspace is resolved against the directory holding the file.
///
/// # Example
///
/// ```rust,no_run
/// use steprunner::workflow::load_study;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let study = load_study("study.yaml")?;
///     println!("Loaded {} steps", study.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_study(path: impl AsRef<Path>) -> Result<Study, LoadError> {
    let path = path.as_ref();
    info!("Loading study from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml.len());

    let mut study = parse_study(&yaml)?;

    let root = study.workspace_root();
    if root.is_relative() {
        if let Some(dir) = path.parent() {
            study.workspace = Some(dir.join(root));
        }
    }

    info!(
        "Parsed study '{}': {} step(s), {} parameter(s)",
        study.name,
        study.steps.len(),
        study.parameters.len()
    );
    Ok(study)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STUDY: &str = r#"
name: demo
workspace: out
queues: { queue_tag: "q_", omit_queue_tag: false }
adapter: { type: local, shell: /bin/sh, dry_run: true }
monitor: { sleep_secs: 5, workers: [sim_worker] }
parameters:
  X: { label: "X.%%", values: [1, 2] }
steps:
  - name: sim
    run:
      cmd: "echo $(X)"
      task_queue: sim
      max_retries: 3
  - name: post
    run:
      cmd: "echo done"
"#;

    #[test]
    fn test_parse_full_study() {
        let study = parse_study(STUDY).unwrap();
        assert_eq!(study.name, "demo");
        assert_eq!(study.steps.len(), 2);
        assert_eq!(study.parameters.len(), 1);
        assert!(study.adapter.dry_run);
        assert_eq!(study.monitor.sleep_secs, 5);
        assert_eq!(study.monitor.max_attempts, 10);
        assert_eq!(study.step("sim").unwrap().run.max_retries, 3);
        assert_eq!(study.queue_names().unwrap(), vec!["q_", "q_sim"]);
    }

    #[test]
    fn test_minimal_study_defaults() {
        let study = parse_study("name: tiny\nsteps:\n  - name: a\n    run: { cmd: echo }\n").unwrap();
        assert_eq!(study.workspace_root(), PathBuf::from("tiny"));
        assert_eq!(study.queues, QueueConfig::default());
        assert!(study.parameters.is_empty());
        assert!(!study.adapter.dry_run);
    }

    #[test]
    fn test_rejects_no_steps() {
        let err = parse_study("name: empty\n").unwrap_err();
        assert!(matches!(err, LoadError::NoSteps(_)));
    }

    #[test]
    fn test_rejects_duplicate_steps() {
        let yaml = "name: d\nsteps:\n  - { name: a, run: { cmd: x } }\n  - { name: a, run: { cmd: y } }\n";
        assert!(matches!(parse_study(yaml), Err(LoadError::DuplicateStep(n)) if n == "a"));
    }

    #[test]
    fn test_rejects_empty_command() {
        let yaml = "name: d\nsteps:\n  - { name: a, run: { cmd: \"  \" } }\n";
        assert!(matches!(parse_study(yaml), Err(LoadError::EmptyCommand(_))));
    }

    #[test]
    fn test_rejects_unequal_parameters() {
        let yaml = r#"
name: d
parameters:
  X: { values: [1, 2] }
  Y: { values: [1] }
steps:
  - { name: a, run: { cmd: "echo $(X) $(Y)" } }
"#;
        assert!(matches!(parse_study(yaml), Err(LoadError::Parameters(_))));
    }

    #[test]
    fn test_rejects_whitespace_step_name() {
        let yaml = "name: d\nsteps:\n  - { name: \"my step\", run: { cmd: x } }\n";
        assert!(matches!(
            parse_study(yaml),
            Err(LoadError::WhitespaceInStepName(n)) if n == "my step"
        ));
    }

    #[test]
    fn test_rejects_whitespace_in_expanded_name() {
        let yaml = r#"
name: d
parameters:
  X: { values: ["a b", "c"] }
steps:
  - { name: sim, run: { cmd: "echo $(X)" } }
"#;
        assert!(matches!(
            parse_study(yaml),
            Err(LoadError::Parameters(ExpansionError::WhitespaceInName { .. }))
        ));
    }

    #[test]
    fn test_whitespace_value_unused_in_names_is_accepted() {
        let yaml = r#"
name: d
parameters:
  X: { label: "", values: ["a b"] }
steps:
  - { name: sim, run: { cmd: "echo $(X)" } }
"#;
        assert_eq!(parse_study(yaml).unwrap().steps.len(), 1);
    }

    #[test]
    fn test_rejects_bad_queue_override() {
        let yaml = "name: d\nsteps:\n  - { name: a, run: { cmd: x, task_queue: \"a b\" } }\n";
        assert!(matches!(parse_study(yaml), Err(LoadError::Queue(_))));
    }

    #[test]
    fn test_load_resolves_workspace_next_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("study.yaml");
        fs::write(&path, STUDY).unwrap();

        let study = load_study(&path).unwrap();
        assert_eq!(study.workspace_root(), dir.path().join("out"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_study(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }
}
