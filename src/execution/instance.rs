//! Step Instance Lifecycle
//!
//! A [`StepInstance`] is one concrete, trackable execution of a step
//! template. It owns its workspace and drives the lifecycle
//! `INITIALIZED -> RUNNING -> terminal`, rewriting the workspace status file
//! after every transition.
//!
//! Instances are single-owner: every transition takes `&mut self`, so the
//! restart counter cannot be bumped from two places at once.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::workflow::model::{RunConfig, StepTemplate};
use crate::workflow::parameters::{references_any, SAMPLE_KEYWORDS};
use crate::workflow::status::{
    format_duration, outcome, ReturnCode, RuntimeContext, StatusError, StatusRecord, StepState,
    RESULT_PLACEHOLDER, RUN_TIME_PLACEHOLDER,
};

/// One concrete execution of a (possibly parameterized) step.
#[derive(Debug, Clone)]
pub struct StepInstance {
    name: String,
    template_name: String,
    cmd: String,
    restart_cmd: Option<String>,
    run: RunConfig,
    workspace: PathBuf,
    study_root: Option<PathBuf>,
    parameter_index: Option<usize>,
    restart: bool,
    restarts: u32,
    restart_limit: u32,
    state: StepState,
    result: Option<String>,
    created_at: DateTime<Local>,
    started_at: Option<DateTime<Local>>,
    ended_at: Option<DateTime<Local>>,
    runtime: Option<RuntimeContext>,
}

impl StepInstance {
    /// Creates the single instance of an unparameterized template.
    pub fn from_template(template: &StepTemplate, workspace: impl Into<PathBuf>) -> Self {
        Self::build(
            template,
            template.name.clone(),
            template.run.cmd.clone(),
            template.run.restart.clone(),
            None,
            workspace.into(),
        )
    }

    /// Creates one instance of a parameterized template.
    pub(crate) fn expanded(
        template: &StepTemplate,
        name: String,
        cmd: String,
        restart_cmd: Option<String>,
        parameter_index: usize,
        workspace: PathBuf,
    ) -> Self {
        Self::build(
            template,
            name,
            cmd,
            restart_cmd,
            Some(parameter_index),
            workspace,
        )
    }

    fn build(
        template: &StepTemplate,
        name: String,
        cmd: String,
        restart_cmd: Option<String>,
        parameter_index: Option<usize>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            name,
            template_name: template.name.clone(),
            cmd,
            restart_cmd,
            run: template.run.clone(),
            workspace,
            study_root: None,
            parameter_index,
            restart: false,
            restarts: 0,
            restart_limit: template.run.max_retries,
            state: StepState::Initialized,
            result: None,
            created_at: Local::now(),
            started_at: None,
            ended_at: None,
            runtime: None,
        }
    }

    /// Sets the study directory used to shorten the workspace in status lines.
    pub fn with_study_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.study_root = Some(root.into());
        self
    }

    /// Records which queue and worker handle this instance.
    pub fn set_runtime_context(&mut self, queue: impl Into<String>, worker: impl Into<String>) {
        self.runtime = Some(RuntimeContext {
            queue: queue.into(),
            worker: worker.into(),
        });
    }

    /// Display name (the template name plus parameter labels, if expanded).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the template this instance came from.
    pub fn template_name(&self) -> &str {
        &self.template_name
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn restart_cmd(&self) -> Option<&str> {
        self.restart_cmd.as_deref()
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn parameter_index(&self) -> Option<usize> {
        self.parameter_index
    }

    pub fn is_parameterized(&self) -> bool {
        self.parameter_index.is_some()
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Result label, once a terminal transition has set one.
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn restart_limit(&self) -> u32 {
        self.restart_limit
    }

    /// Whether the next submission should use the restart command.
    pub fn restart(&self) -> bool {
        self.restart
    }

    pub fn set_restart(&mut self, restart: bool) {
        self.restart = restart;
    }

    /// Command for the next submission.
    pub fn active_command(&self) -> &str {
        match (&self.restart_cmd, self.restart) {
            (Some(restart_cmd), true) => restart_cmd,
            _ => &self.cmd,
        }
    }

    /// True while another restart fits within the restart limit.
    pub fn can_restart(&self) -> bool {
        self.restart_limit == 0 || self.restarts < self.restart_limit
    }

    /// True if the command (or, independently, the restart command)
    /// references a sample column label or a reserved sample token.
    pub fn needs_sample_expansion(&self, labels: &[String]) -> bool {
        let tokens: Vec<&str> = labels
            .iter()
            .map(String::as_str)
            .chain(SAMPLE_KEYWORDS.iter().copied())
            .collect();

        references_any(&self.cmd, &tokens)
            || self
                .restart_cmd
                .as_deref()
                .is_some_and(|restart| references_any(restart, &tokens))
    }

    /// Copies this instance into a new workspace, replacing each `(from, to)`
    /// pair (ASCII case-insensitively) in both command and restart command.
    ///
    /// The copy starts over in `INITIALIZED` with no restarts.
    pub fn clone_with_replacements(
        &self,
        replacements: &[(String, String)],
        workspace: Option<PathBuf>,
    ) -> Self {
        let mut copy = self.clone();
        for (from, to) in replacements {
            copy.cmd = replace_ignore_case(&copy.cmd, from, to);
            copy.restart_cmd = copy
                .restart_cmd
                .map(|restart| replace_ignore_case(&restart, from, to));
        }

        if let Some(workspace) = workspace {
            copy.workspace = workspace;
        }
        debug!(
            "Cloned '{}' into workspace {}",
            copy.name,
            copy.workspace.display()
        );

        copy.restart = false;
        copy.restarts = 0;
        copy.state = StepState::Initialized;
        copy.result = None;
        copy.created_at = Local::now();
        copy.started_at = None;
        copy.ended_at = None;
        copy.runtime = None;
        copy
    }

    /// Creates the workspace directory (if needed) and writes a status snapshot.
    pub fn setup_workspace(&self) -> Result<(), StatusError> {
        self.persist()?;
        debug!(
            "Workspace ready for '{}': {}",
            self.name,
            self.workspace.display()
        );
        Ok(())
    }

    /// Moves the instance to `RUNNING`.
    ///
    /// The start time is only recorded on the first call; later calls still
    /// rewrite the status file.
    pub fn mark_running(&mut self) -> Result<(), StatusError> {
        debug!(
            "Marking '{}' as RUNNING (previously {})",
            self.name, self.state
        );
        self.state = StepState::Running;
        self.ended_at = None;

        if self.started_at.is_none() {
            self.started_at = Some(Local::now());
        } else {
            debug!(
                "Start time of '{}' is already set; keeping the original",
                self.name
            );
        }
        self.persist()
    }

    /// Moves the instance to the terminal state matching `code`.
    pub fn mark_end(&mut self, code: ReturnCode, hit_max_retries: bool) -> Result<(), StatusError> {
        self.finish(Some(code), hit_max_retries)
    }

    /// Like [`mark_end`](Self::mark_end), for a raw code reported by a runtime.
    ///
    /// Codes outside the vocabulary end in `UNKNOWN`.
    pub fn mark_end_code(&mut self, code: i32, hit_max_retries: bool) -> Result<(), StatusError> {
        let known = ReturnCode::from_code(code);
        if known.is_none() {
            warn!("Step '{}' returned unrecognized code {}", self.name, code);
        }
        self.finish(known, hit_max_retries)
    }

    fn finish(&mut self, code: Option<ReturnCode>, hit_max_retries: bool) -> Result<(), StatusError> {
        let (state, result) = outcome(code, hit_max_retries);
        info!("Step '{}' ended: {} ({})", self.name, state, result);

        self.state = state;
        self.result = Some(result);
        self.ended_at = Some(Local::now());
        self.persist()
    }

    /// Counts one restart if the limit allows it.
    ///
    /// Returns whether the counter moved. The status file is rewritten either
    /// way.
    pub fn mark_restart(&mut self) -> Result<bool, StatusError> {
        let counted = self.can_restart();
        if counted {
            self.restarts += 1;
            debug!(
                "Restart {} of '{}' (limit {})",
                self.restarts, self.name, self.restart_limit
            );
        } else {
            debug!(
                "Restart limit {} reached for '{}'",
                self.restart_limit, self.name
            );
        }
        self.persist()?;
        Ok(counted)
    }

    /// Current status view.
    pub fn status(&self) -> StatusRecord {
        let until = self.ended_at.unwrap_or_else(Local::now);
        let run_time = match self.started_at {
            Some(start) => format_duration(until - start),
            None => RUN_TIME_PLACEHOLDER.to_string(),
        };

        StatusRecord {
            name: self.name.clone(),
            state: self.state,
            result: self
                .result
                .clone()
                .unwrap_or_else(|| RESULT_PLACEHOLDER.to_string()),
            elapsed_time: format_duration(until - self.created_at),
            run_time,
            restarts: self.restarts,
            workspace: self.condensed_workspace(),
            runtime: self.runtime.clone(),
        }
    }

    fn condensed_workspace(&self) -> String {
        let relative = self
            .study_root
            .as_deref()
            .and_then(|root| self.workspace.strip_prefix(root).ok())
            .filter(|rel| !rel.as_os_str().is_empty());

        relative
            .unwrap_or(&self.workspace)
            .display()
            .to_string()
            .replace(char::is_whitespace, "_")
    }

    fn persist(&self) -> Result<(), StatusError> {
        fs::create_dir_all(&self.workspace).map_err(|source| StatusError::Write {
            path: self.workspace.clone(),
            source,
        })?;
        self.status().write_to(&self.workspace).map(|_| ())
    }
}

/// Replaces every ASCII case-insensitive occurrence of `from` with `to`.
fn replace_ignore_case(text: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        return text.to_string();
    }

    let haystack = text.to_ascii_lowercase();
    let needle = from.to_ascii_lowercase();
    let mut output = String::with_capacity(text.len());
    let mut last = 0;

    for (start, _) in haystack.match_indices(&needle) {
        output.push_str(&text[last..start]);
        output.push_str(to);
        last = start + needle.len();
    }
    output.push_str(&text[last..]);
    output
}
