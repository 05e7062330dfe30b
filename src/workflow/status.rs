//! Step Status Persistence
//!
//! Return-code vocabulary, lifecycle states and the on-disk status record.
//!
//! Each instance workspace holds a single `STATUS` file that is rewritten
//! in full after every transition. The file is one line of
//! whitespace-separated fields:
//!
//! ```text
//! name state result elapsed_time run_time restart_count workspace [queue worker]
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Duration;
use log::{debug, warn};
use thiserror::Error;

/// Name of the status file inside an instance workspace.
pub const STATUS_FILE_NAME: &str = "STATUS";

/// Result placeholder written until a terminal transition.
pub const RESULT_PLACEHOLDER: &str = "-------";

/// Run time placeholder for instances that never started.
pub const RUN_TIME_PLACEHOLDER: &str = "--:--:--";

/// Suffix added to a soft failure once the retry budget is spent.
pub const MAX_RETRIES_SUFFIX: &str = "_MAX_RETRIES_REACHED";

/// Errors raised while reading or writing status files.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to write status file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read status file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("malformed status line '{0}'")]
    Malformed(String),

    #[error("unknown step state '{0}'")]
    UnknownState(String),
}

/// Closed vocabulary of execution outcomes reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Ok,
    DryOk,
    Retry,
    Restart,
    SoftFail,
    HardFail,
    StopWorkers,
}

impl ReturnCode {
    /// Integer used on the wire (and as a process exit status).
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Restart => 100,
            Self::SoftFail => 101,
            Self::HardFail => 102,
            Self::DryOk => 103,
            Self::Retry => 104,
            Self::StopWorkers => 105,
        }
    }

    /// Maps a wire integer back to a return code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            100 => Some(Self::Restart),
            101 => Some(Self::SoftFail),
            102 => Some(Self::HardFail),
            103 => Some(Self::DryOk),
            104 => Some(Self::Retry),
            105 => Some(Self::StopWorkers),
            _ => None,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::DryOk => "DRY_OK",
            Self::Retry => "RETRY",
            Self::Restart => "RESTART",
            Self::SoftFail => "SOFT_FAIL",
            Self::HardFail => "HARD_FAIL",
            Self::StopWorkers => "STOP_WORKERS",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepState {
    Initialized,
    Running,
    Finished,
    Failed,
    Cancelled,
    DryRun,
    Unknown,
}

impl StepState {
    /// Token written to the status file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::DryRun => "DRYRUN",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// True for states no further transition leaves (except a restart cycle).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initialized | Self::Running)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepState {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZED" => Ok(Self::Initialized),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "DRYRUN" => Ok(Self::DryRun),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(StatusError::UnknownState(other.to_string())),
        }
    }
}

/// Maps an outcome to its lifecycle state and result label.
///
/// `None` stands for a code outside the vocabulary and lands in
/// [`StepState::Unknown`].
pub fn outcome(code: Option<ReturnCode>, hit_max_retries: bool) -> (StepState, String) {
    let (state, label) = match code {
        Some(ReturnCode::Ok) => (StepState::Finished, "SUCCESS"),
        Some(ReturnCode::DryOk) => (StepState::DryRun, "DRY_SUCCESS"),
        Some(ReturnCode::Retry) => (StepState::Finished, "RETRY_REQUESTED"),
        Some(ReturnCode::Restart) => (StepState::Finished, "RESTART_REQUESTED"),
        Some(ReturnCode::SoftFail) => (StepState::Failed, "SOFT_FAIL"),
        Some(ReturnCode::HardFail) => (StepState::Failed, "HARD_FAIL"),
        Some(ReturnCode::StopWorkers) => (StepState::Cancelled, "STOP_WORKERS"),
        None => (StepState::Unknown, "UNRECOGNIZED_RETURN_CODE"),
    };

    let mut label = label.to_string();
    if code == Some(ReturnCode::SoftFail) && hit_max_retries {
        label.push_str(MAX_RETRIES_SUFFIX);
    }
    (state, label)
}

/// Formats a duration as `Dd:HHh:MMm:SSs`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{}d:{:02}h:{:02}m:{:02}s", days, hours, minutes, seconds)
}

/// Queue and worker that handled an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    pub queue: String,
    pub worker: String,
}

/// Point-in-time view of one instance, as written to its status file.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub name: String,
    pub state: StepState,
    pub result: String,
    pub elapsed_time: String,
    pub run_time: String,
    pub restarts: u32,
    pub workspace: String,
    pub runtime: Option<RuntimeContext>,
}

impl StatusRecord {
    /// Writes the record to `<workspace>/STATUS`, replacing any previous content.
    ///
    /// The line goes to a sibling temp file first and is renamed into place,
    /// so readers never observe a partial line.
    pub fn write_to(&self, workspace: &Path) -> Result<PathBuf, StatusError> {
        let path = workspace.join(STATUS_FILE_NAME);
        let tmp = workspace.join(format!(".{}.tmp", STATUS_FILE_NAME));

        fs::write(&tmp, format!("{}\n", self))
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|source| StatusError::Write {
                path: path.clone(),
                source,
            })?;

        debug!("Wrote status for '{}': {}", self.name, self.state);
        Ok(path)
    }
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.name,
            self.state,
            self.result,
            self.elapsed_time,
            self.run_time,
            self.restarts,
            self.workspace
        )?;
        if let Some(ctx) = &self.runtime {
            write!(f, " {} {}", ctx.queue, ctx.worker)?;
        }
        Ok(())
    }
}

impl FromStr for StatusRecord {
    type Err = StatusError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let runtime = match fields.len() {
            7 => None,
            9 => Some(RuntimeContext {
                queue: fields[7].to_string(),
                worker: fields[8].to_string(),
            }),
            _ => return Err(StatusError::Malformed(line.to_string())),
        };

        let restarts = fields[5]
            .parse()
            .map_err(|_| StatusError::Malformed(line.to_string()))?;

        Ok(Self {
            name: fields[0].to_string(),
            state: fields[1].parse()?,
            result: fields[2].to_string(),
            elapsed_time: fields[3].to_string(),
            run_time: fields[4].to_string(),
            restarts,
            workspace: fields[6].to_string(),
            runtime,
        })
    }
}

/// Reads the status record stored in a workspace.
pub fn read_status(workspace: &Path) -> Result<StatusRecord, StatusError> {
    let path = workspace.join(STATUS_FILE_NAME);
    let content = fs::read_to_string(&path).map_err(|source| StatusError::Read {
        path: path.clone(),
        source,
    })?;
    content.trim().parse()
}

/// Collects every status record below `root`, sorted by step name.
///
/// Unreadable or malformed files are skipped with a warning so one broken
/// workspace does not hide the rest of a study.
pub fn collect_statuses(root: &Path) -> Result<Vec<StatusRecord>, StatusError> {
    let mut records = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|source| StatusError::Read {
            path: dir.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name().and_then(|n| n.to_str()) == Some(STATUS_FILE_NAME) {
                let Some(workspace) = path.parent() else {
                    continue;
                };
                match read_status(workspace) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping {}: {}", path.display(), e),
                }
            }
        }
    }

    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record() -> StatusRecord {
        StatusRecord {
            name: "sim_X.1".to_string(),
            state: StepState::Finished,
            result: "SUCCESS".to_string(),
            elapsed_time: "0d:00h:00m:03s".to_string(),
            run_time: "0d:00h:00m:02s".to_string(),
            restarts: 1,
            workspace: "sim/X.1".to_string(),
            runtime: None,
        }
    }

    #[test]
    fn test_return_code_wire_values() {
        let all = [
            ReturnCode::Ok,
            ReturnCode::DryOk,
            ReturnCode::Retry,
            ReturnCode::Restart,
            ReturnCode::SoftFail,
            ReturnCode::HardFail,
            ReturnCode::StopWorkers,
        ];
        for code in all {
            assert_eq!(ReturnCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ReturnCode::from_code(1), None);
        assert_eq!(ReturnCode::from_code(-9), None);
    }

    #[test]
    fn test_outcome_table() {
        assert_eq!(
            outcome(Some(ReturnCode::Ok), false),
            (StepState::Finished, "SUCCESS".to_string())
        );
        assert_eq!(outcome(Some(ReturnCode::DryOk), false).0, StepState::DryRun);
        assert_eq!(outcome(Some(ReturnCode::Retry), false).0, StepState::Finished);
        assert_eq!(outcome(Some(ReturnCode::Restart), false).0, StepState::Finished);
        assert_eq!(outcome(Some(ReturnCode::HardFail), false).0, StepState::Failed);
        assert_eq!(
            outcome(Some(ReturnCode::StopWorkers), false).0,
            StepState::Cancelled
        );
        assert_eq!(
            outcome(None, false),
            (StepState::Unknown, "UNRECOGNIZED_RETURN_CODE".to_string())
        );
    }

    #[test]
    fn test_outcome_soft_fail_suffix() {
        let (state, label) = outcome(Some(ReturnCode::SoftFail), true);
        assert_eq!(state, StepState::Failed);
        assert_eq!(label, "SOFT_FAIL_MAX_RETRIES_REACHED");

        let (_, label) = outcome(Some(ReturnCode::SoftFail), false);
        assert_eq!(label, "SOFT_FAIL");

        // Only soft failures carry the suffix
        let (_, label) = outcome(Some(ReturnCode::HardFail), true);
        assert_eq!(label, "HARD_FAIL");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(0)), "0d:00h:00m:00s");
        assert_eq!(format_duration(Duration::seconds(3_725)), "0d:01h:02m:05s");
        assert_eq!(format_duration(Duration::seconds(90_061)), "1d:01h:01m:01s");
        assert_eq!(format_duration(Duration::seconds(-5)), "0d:00h:00m:00s");
    }

    #[test]
    fn test_status_line_without_runtime() {
        let line = sample_record().to_string();
        assert_eq!(
            line,
            "sim_X.1 FINISHED SUCCESS 0d:00h:00m:03s 0d:00h:00m:02s 1 sim/X.1"
        );
    }

    #[test]
    fn test_status_line_with_runtime() {
        let mut record = sample_record();
        record.runtime = Some(RuntimeContext {
            queue: "[merlin]_sim".to_string(),
            worker: "w1@node7".to_string(),
        });
        let line = record.to_string();
        assert!(line.ends_with(" [merlin]_sim w1@node7"));

        let parsed: StatusRecord = line.parse().unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!("only three fields".parse::<StatusRecord>().is_err());
        assert!("a RUNNING - t r notanumber ws".parse::<StatusRecord>().is_err());
        assert!(matches!(
            "a BOGUS - t r 0 ws".parse::<StatusRecord>(),
            Err(StatusError::UnknownState(_))
        ));
    }

    #[test]
    fn test_write_overwrites_previous_status() {
        let dir = tempdir().unwrap();
        let mut record = sample_record();
        record.state = StepState::Running;
        record.result = RESULT_PLACEHOLDER.to_string();
        record.write_to(dir.path()).unwrap();

        record.state = StepState::Finished;
        record.result = "SUCCESS".to_string();
        let path = record.write_to(dir.path()).unwrap();

        let content = fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.ends_with('\n'));
        assert_eq!(read_status(dir.path()).unwrap(), record);
    }

    #[test]
    fn test_write_to_missing_workspace_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = sample_record().write_to(&missing);
        assert!(matches!(result, Err(StatusError::Write { .. })));
    }

    #[test]
    fn test_collect_statuses_walks_tree() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("sim/X.2");
        let b = dir.path().join("sim/X.1");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        let mut first = sample_record();
        first.name = "sim_X.2".to_string();
        first.write_to(&a).unwrap();
        sample_record().write_to(&b).unwrap();
        fs::write(dir.path().join("sim").join(STATUS_FILE_NAME), "garbage\n").unwrap();

        let records = collect_statuses(dir.path()).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["sim_X.1", "sim_X.2"]);
    }

    #[test]
    fn test_state_terminal() {
        assert!(!StepState::Initialized.is_terminal());
        assert!(!StepState::Running.is_terminal());
        assert!(StepState::Finished.is_terminal());
        assert!(StepState::Unknown.is_terminal());
        assert_eq!("DRYRUN".parse::<StepState>().unwrap(), StepState::DryRun);
    }
}
