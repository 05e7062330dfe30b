//! Execution Adapter Bridge
//!
//! Turns a step instance into a submission:
//! - Effective run configuration (shell, batch type) per instance
//! - Script generation in the instance workspace
//! - Dry-run short circuit
//! - Hand-off to a [`ScriptAdapter`]

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, error, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::execution::instance::StepInstance;
use crate::workflow::model::RunConfig;
use crate::workflow::parameters::ExpansionError;
use crate::workflow::queue::QueueError;
use crate::workflow::status::{ReturnCode, StatusError};

/// Marker written by [`LocalAdapter`] when a script exits cleanly.
pub const FINISHED_MARKER: &str = "FINISHED";

/// Adapter type used when the configuration names none.
pub const DEFAULT_ADAPTER_TYPE: &str = "local";

/// Shell used when neither the study nor the step sets one.
///
/// Taken from `$SHELL` when it is an absolute path, else `/bin/bash`.
pub static DEFAULT_SHELL: Lazy<String> = Lazy::new(|| {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| Path::new(shell).is_absolute())
        .unwrap_or_else(|| "/bin/bash".to_string())
});

/// Errors raised by an adapter while submitting work.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to launch '{shell}': {source}")]
    Spawn { shell: String, source: io::Error },

    #[error("failed to capture output of '{step}': {source}")]
    Capture { step: String, source: io::Error },

    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// Errors raised while preparing or running a step instance.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    #[error("failed to write script {path}: {source}")]
    Script { path: PathBuf, source: io::Error },

    #[error("worker for step '{0}' stopped before reporting a result")]
    WorkerLost(String),
}

/// Study-wide adapter settings. Never modified once loaded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    /// Adapter/backend kind (e.g. `local`, `slurm`)
    #[serde(rename = "type", default = "default_adapter_type")]
    pub adapter_type: String,

    /// Shell used to run step scripts
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Batch type; defaults to the adapter type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_type: Option<String>,

    /// Create workspaces and scripts without running anything
    #[serde(default)]
    pub dry_run: bool,

    /// Backend-specific settings passed through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_adapter_type() -> String {
    DEFAULT_ADAPTER_TYPE.to_string()
}

fn default_shell() -> String {
    DEFAULT_SHELL.clone()
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            adapter_type: default_adapter_type(),
            shell: default_shell(),
            batch_type: None,
            dry_run: false,
            extra: BTreeMap::new(),
        }
    }
}

/// Configuration for exactly one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub adapter_type: String,
    pub shell: String,
    pub batch_type: String,
    pub dry_run: bool,
    pub extra: BTreeMap<String, Value>,
}

impl AdapterConfig {
    /// Merges step-level overrides over these defaults.
    ///
    /// Returns a fresh value; `self` is left as it was, so overrides from one
    /// instance never reach the next.
    pub fn effective_for(&self, run: &RunConfig) -> EffectiveConfig {
        let default_batch = self
            .batch_type
            .clone()
            .unwrap_or_else(|| self.adapter_type.clone());

        EffectiveConfig {
            adapter_type: self.adapter_type.clone(),
            shell: run.shell.clone().unwrap_or_else(|| self.shell.clone()),
            batch_type: run
                .batch_type()
                .map(str::to_string)
                .unwrap_or(default_batch),
            dry_run: self.dry_run || run.dry_run,
            extra: self.extra.clone(),
        }
    }
}

/// A script written to an instance workspace, ready to submit.
#[derive(Debug, Clone)]
pub struct StepScript {
    pub step_name: String,
    pub command: String,
    pub workspace: PathBuf,
    pub path: PathBuf,
}

/// What an adapter reports back for one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub return_code: ReturnCode,
    pub job_id: String,
}

/// Boundary to whatever actually runs step scripts.
pub trait ScriptAdapter: Send + Sync {
    fn submit(&self, script: &StepScript, config: &EffectiveConfig)
        -> Result<Submission, AdapterError>;
}

/// Prepares instances and submits them through an adapter.
pub struct ExecutionBridge<A> {
    base: AdapterConfig,
    adapter: A,
}

impl<A: ScriptAdapter> ExecutionBridge<A> {
    pub fn new(base: AdapterConfig, adapter: A) -> Self {
        Self { base, adapter }
    }

    pub fn base_config(&self) -> &AdapterConfig {
        &self.base
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Submits an instance.
    ///
    /// The workspace and script are always created. In dry-run mode the
    /// adapter is never called and `DRY_OK` comes back.
    pub fn submit(&self, instance: &StepInstance) -> Result<Submission, ExecutionError> {
        let config = self.base.effective_for(instance.run_config());
        debug!("Effective config for '{}': {:?}", instance.name(), config);

        instance.setup_workspace()?;
        let script = write_script(instance, &config)?;

        if config.dry_run {
            info!(
                "Dry run: prepared '{}' in '{}'",
                instance.name(),
                instance.workspace().display()
            );
            return Ok(Submission {
                return_code: ReturnCode::DryOk,
                job_id: "dry-run".to_string(),
            });
        }

        info!(
            "Executing step '{}' in '{}'...",
            instance.name(),
            instance.workspace().display()
        );
        Ok(self.adapter.submit(&script, &config)?)
    }
}

/// Writes `<workspace>/<step>.sh` for the instance's active command.
fn write_script(
    instance: &StepInstance,
    config: &EffectiveConfig,
) -> Result<StepScript, ExecutionError> {
    let path = instance
        .workspace()
        .join(format!("{}.sh", instance.template_name()));
    let command = instance.active_command().to_string();

    let write = || -> io::Result<()> {
        let mut file = File::create(&path)?;
        writeln!(file, "#!{}", config.shell)?;
        writeln!(file, "{}", command)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    };

    write().map_err(|source| ExecutionError::Script {
        path: path.clone(),
        source,
    })?;

    Ok(StepScript {
        step_name: instance.name().to_string(),
        command,
        workspace: instance.workspace().to_path_buf(),
        path,
    })
}

/// Runs scripts on this machine with the effective shell.
///
/// Output lands in `<step>.out` / `<step>.err` next to the script, and a
/// `FINISHED` marker is written on a clean exit.
#[derive(Debug, Clone, Default)]
pub struct LocalAdapter;

impl LocalAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Maps a process exit status to a return code.
    ///
    /// Codes from the return-code vocabulary pass through; any other failure
    /// (including death by signal) is a soft failure.
    pub fn classify_exit(code: Option<i32>) -> ReturnCode {
        match code {
            Some(code) => ReturnCode::from_code(code).unwrap_or(ReturnCode::SoftFail),
            None => ReturnCode::SoftFail,
        }
    }
}

impl ScriptAdapter for LocalAdapter {
    fn submit(
        &self,
        script: &StepScript,
        config: &EffectiveConfig,
    ) -> Result<Submission, AdapterError> {
        // Runs inside the workspace, so the script is addressed by file name.
        let script_arg = script
            .path
            .file_name()
            .unwrap_or_else(|| script.path.as_os_str());
        let child = Command::new(&config.shell)
            .arg(script_arg)
            .current_dir(&script.workspace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|source| AdapterError::Spawn {
                shell: config.shell.clone(),
                source,
            })?;

        let job_id = format!("local-{}", child.id());
        let output = child
            .wait_with_output()
            .map_err(|source| AdapterError::Capture {
                step: script.step_name.clone(),
                source,
            })?;

        let stem = script
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("step");
        let capture = |ext: &str, bytes: &[u8]| {
            fs::write(script.workspace.join(format!("{}.{}", stem, ext)), bytes).map_err(
                |source| AdapterError::Capture {
                    step: script.step_name.clone(),
                    source,
                },
            )
        };
        capture("out", &output.stdout)?;
        capture("err", &output.stderr)?;

        let return_code = Self::classify_exit(output.status.code());
        if output.status.success() {
            capture_marker(&script.workspace).map_err(|source| AdapterError::Capture {
                step: script.step_name.clone(),
                source,
            })?;
            debug!("Step '{}' completed successfully", script.step_name);
        } else {
            error!(
                "Step '{}' exited with {:?} ({})",
                script.step_name,
                output.status.code(),
                return_code
            );
        }

        Ok(Submission {
            return_code,
            job_id,
        })
    }
}

fn capture_marker(workspace: &Path) -> io::Result<()> {
    fs::write(workspace.join(FINISHED_MARKER), "")
}
