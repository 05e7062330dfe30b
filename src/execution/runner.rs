//! Step Runner
//!
//! Drives step instances to a terminal state:
//! - Expands a template into instances (or passes it through)
//! - Routes every instance to its queue
//! - Submits through the [`ExecutionBridge`], honouring RETRY / RESTART
//!   within the step's retry budget
//! - Runs independent instances on a bounded pool of threads

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use sysinfo::System;

use super::adapter::{ExecutionBridge, ExecutionError, ScriptAdapter};
use super::instance::StepInstance;
use crate::workflow::model::{ParameterSet, StepTemplate};
use crate::workflow::parameters::instances_for;
use crate::workflow::queue::QueueResolver;
use crate::workflow::status::{ReturnCode, StatusRecord};

/// Worker identity used for instances run on this machine.
pub fn local_worker_name() -> String {
    let host = System::host_name().unwrap_or_else(|| "localhost".to_string());
    format!("local@{}", host)
}

/// Final outcome of one instance.
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub name: String,
    pub return_code: ReturnCode,
    pub status: StatusRecord,
}

/// Outcomes of every instance of a run, in completion order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<InstanceReport>,
}

impl RunSummary {
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Reports whose final code is `OK` or `DRY_OK`.
    pub fn succeeded(&self) -> impl Iterator<Item = &InstanceReport> {
        self.reports
            .iter()
            .filter(|r| matches!(r.return_code, ReturnCode::Ok | ReturnCode::DryOk))
    }

    /// Reports that ended in any other way.
    pub fn failed(&self) -> impl Iterator<Item = &InstanceReport> {
        self.reports
            .iter()
            .filter(|r| !matches!(r.return_code, ReturnCode::Ok | ReturnCode::DryOk))
    }

    /// True if some instance asked for workers to stop.
    pub fn stop_requested(&self) -> bool {
        self.reports
            .iter()
            .any(|r| r.return_code == ReturnCode::StopWorkers)
    }

    fn extend(&mut self, other: RunSummary) {
        self.reports.extend(other.reports);
    }
}

/// Submits one instance until it reaches a terminal state.
///
/// RESTART switches the instance to its restart command, RETRY reruns the
/// primary command. Either one consumes a restart; once the budget is spent
/// the instance ends as a soft failure with the max-retries label.
pub fn drive_instance<A: ScriptAdapter>(
    bridge: &ExecutionBridge<A>,
    instance: &mut StepInstance,
) -> Result<ReturnCode, ExecutionError> {
    loop {
        instance.mark_running()?;
        let submission = match bridge.submit(instance) {
            Ok(submission) => submission,
            Err(e) => {
                error!("Submission of '{}' failed: {}", instance.name(), e);
                end_after_failure(instance);
                return Err(e);
            }
        };
        let code = submission.return_code;
        info!(
            "Step '{}' (job {}) returned {}",
            instance.name(),
            submission.job_id,
            code
        );

        match code {
            ReturnCode::Restart | ReturnCode::Retry => {
                instance.set_restart(code == ReturnCode::Restart);

                if !instance.mark_restart()? {
                    warn!(
                        "Step '{}' hit its retry limit ({})",
                        instance.name(),
                        instance.restart_limit()
                    );
                    instance.mark_end(ReturnCode::SoftFail, true)?;
                    return Ok(ReturnCode::SoftFail);
                }

                let delay = instance.run_config().retry_delay;
                warn!(
                    "Resubmitting '{}' in {}s ({} {}/{})",
                    instance.name(),
                    delay,
                    code,
                    instance.restarts(),
                    instance.restart_limit()
                );
                thread::sleep(Duration::from_secs(delay));
            }
            other => {
                instance.mark_end(other, false)?;
                return Ok(other);
            }
        }
    }
}

/// Leaves a terminal `HARD_FAIL` in the status file of an instance that could
/// not be run, so it does not stay `RUNNING`.
fn end_after_failure(instance: &mut StepInstance) {
    if let Err(e) = instance.mark_end(ReturnCode::HardFail, false) {
        warn!("Could not record failure of '{}': {}", instance.name(), e);
    }
}

/// Runs step templates through a bridge.
///
/// # Example
///
/// ```rust,no_run
/// use steprunner::execution::{AdapterConfig, ExecutionBridge, LocalAdapter, StepRunner};
/// use steprunner::workflow::queue::{QueueConfig, QueueResolver};
/// use steprunner::workflow::{ParameterSet, StepTemplate};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bridge = ExecutionBridge::new(AdapterConfig::default(), LocalAdapter::new());
///     let mut runner = StepRunner::new(bridge, QueueResolver::new(QueueConfig::default()), "study");
///     runner.set_max_parallel(4);
///
///     let step = StepTemplate::new("sim", "echo $(X)");
///     let params = ParameterSet::new().with_parameter("X", "X.%%", [1, 2, 3]);
///     let summary = runner.run_template(&step, &params)?;
///     println!("{} instances finished", summary.len());
///     Ok(())
/// }
/// ```
pub struct StepRunner<A> {
    bridge: Arc<ExecutionBridge<A>>,
    queues: QueueResolver,
    workspace_root: PathBuf,
    max_parallel: usize,
    worker_name: String,
}

impl<A: ScriptAdapter + 'static> StepRunner<A> {
    pub fn new(
        bridge: ExecutionBridge<A>,
        queues: QueueResolver,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bridge: Arc::new(bridge),
            queues,
            workspace_root: workspace_root.into(),
            max_parallel: num_cpus::get().max(1),
            worker_name: local_worker_name(),
        }
    }

    /// Sets the maximum number of instances running at once.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    /// Sets the worker identity recorded in status files.
    pub fn set_worker_name(&mut self, name: impl Into<String>) {
        self.worker_name = name.into();
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn bridge(&self) -> &ExecutionBridge<A> {
        &self.bridge
    }

    /// Prepares the instances of one template, routed to their queue.
    ///
    /// Fails before anything is written if expansion or queue resolution
    /// rejects the configuration.
    pub fn prepare(
        &self,
        template: &StepTemplate,
        params: &ParameterSet,
    ) -> Result<Vec<StepInstance>, ExecutionError> {
        let queue = self.queues.resolve_step(template)?;
        let mut instances = instances_for(template, params, &self.workspace_root)?;

        for instance in &mut instances {
            instance.set_runtime_context(queue.clone(), self.worker_name.clone());
        }
        info!(
            "Step '{}': {} instance(s) on queue '{}'",
            template.name,
            instances.len(),
            queue
        );
        Ok(instances)
    }

    /// Expands and runs one template.
    pub fn run_template(
        &self,
        template: &StepTemplate,
        params: &ParameterSet,
    ) -> Result<RunSummary, ExecutionError> {
        let instances = self.prepare(template, params)?;
        self.run_instances(instances)
    }

    /// Runs several templates one after another.
    ///
    /// Ordering between templates is the caller's; a template whose
    /// instances asked workers to stop ends the sequence early.
    pub fn run_all(
        &self,
        templates: &[StepTemplate],
        params: &ParameterSet,
    ) -> Result<RunSummary, ExecutionError> {
        let mut summary = RunSummary::default();
        for template in templates {
            let step_summary = self.run_template(template, params)?;
            let stop = step_summary.stop_requested();
            summary.extend(step_summary);

            if stop {
                warn!("Step '{}' requested a worker stop", template.name);
                break;
            }
        }
        Ok(summary)
    }

    /// Runs instances on up to `max_parallel` threads.
    ///
    /// Each instance moves into exactly one thread, which owns it until it is
    /// terminal.
    pub fn run_instances(
        &self,
        instances: Vec<StepInstance>,
    ) -> Result<RunSummary, ExecutionError> {
        type Outcome = (String, Result<InstanceReport, ExecutionError>);
        let (tx, rx): (Sender<Outcome>, Receiver<Outcome>) = channel();
        let mut tx = Some(tx);

        let mut pending = instances.into_iter();
        let mut running = 0;
        let mut summary = RunSummary::default();
        let mut first_error = None;

        loop {
            while running < self.max_parallel {
                let Some(sender) = tx.as_ref() else {
                    break;
                };
                let Some(mut instance) = pending.next() else {
                    break;
                };

                let worker_tx = sender.clone();
                let bridge = Arc::clone(&self.bridge);
                thread::spawn(move || {
                    let name = instance.name().to_string();
                    let driven =
                        panic::catch_unwind(AssertUnwindSafe(|| drive_instance(&*bridge, &mut instance)));

                    let result = match driven {
                        Ok(Ok(code)) => Ok(InstanceReport {
                            name: name.clone(),
                            return_code: code,
                            status: instance.status(),
                        }),
                        Ok(Err(e)) => Err(e),
                        Err(_) => {
                            error!("Worker for '{}' panicked", name);
                            end_after_failure(&mut instance);
                            Err(ExecutionError::WorkerLost(name.clone()))
                        }
                    };

                    if let Err(e) = worker_tx.send((name, result)) {
                        error!("Failed to send completion signal: {}", e);
                    }
                });
                running += 1;
            }

            // Once everything is dispatched only workers hold senders, so a
            // worker that dies without reporting ends `recv` instead of hanging it.
            if pending.len() == 0 {
                tx = None;
            }

            if running == 0 {
                break;
            }

            let (name, result) = rx
                .recv()
                .map_err(|_| ExecutionError::WorkerLost("<unknown>".to_string()))?;
            running -= 1;

            match result {
                Ok(report) => summary.reports.push(report),
                Err(e) => {
                    error!("Step '{}' could not be run: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::adapter::{
        AdapterConfig, AdapterError, EffectiveConfig, StepScript, Submission,
    };
    use crate::workflow::queue::QueueConfig;
    use crate::workflow::status::{read_status, StepState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Adapter that replays a fixed sequence of codes, then OK.
    struct ScriptedAdapter {
        codes: Mutex<Vec<ReturnCode>>,
        calls: AtomicUsize,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(codes: &[ReturnCode]) -> Self {
            let mut codes = codes.to_vec();
            codes.reverse();
            Self {
                codes: Mutex::new(codes),
                calls: AtomicUsize::new(0),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScriptAdapter for ScriptedAdapter {
        fn submit(
            &self,
            script: &StepScript,
            _config: &EffectiveConfig,
        ) -> Result<Submission, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.commands.lock().unwrap().push(script.command.clone());
            let code = self.codes.lock().unwrap().pop().unwrap_or(ReturnCode::Ok);
            Ok(Submission {
                return_code: code,
                job_id: "job".to_string(),
            })
        }
    }

    /// Adapter whose launches always fail.
    struct BrokenShellAdapter;

    impl ScriptAdapter for BrokenShellAdapter {
        fn submit(
            &self,
            _script: &StepScript,
            config: &EffectiveConfig,
        ) -> Result<Submission, AdapterError> {
            Err(AdapterError::Spawn {
                shell: config.shell.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such shell"),
            })
        }
    }

    /// Adapter that panics for commands containing `boom`.
    struct PanickyAdapter;

    impl ScriptAdapter for PanickyAdapter {
        fn submit(
            &self,
            script: &StepScript,
            _config: &EffectiveConfig,
        ) -> Result<Submission, AdapterError> {
            if script.command.contains("boom") {
                panic!("adapter bug");
            }
            Ok(Submission {
                return_code: ReturnCode::Ok,
                job_id: "job".to_string(),
            })
        }
    }

    fn runner_with<A: ScriptAdapter + 'static>(root: &Path, adapter: A) -> StepRunner<A> {
        let bridge = ExecutionBridge::new(AdapterConfig::default(), adapter);
        let mut runner = StepRunner::new(bridge, QueueResolver::new(QueueConfig::default()), root);
        runner.set_worker_name("w1@test");
        runner
    }

    fn runner(root: &Path, codes: &[ReturnCode]) -> StepRunner<ScriptedAdapter> {
        let bridge = ExecutionBridge::new(AdapterConfig::default(), ScriptedAdapter::new(codes));
        let queues = QueueResolver::new(QueueConfig {
            queue_tag: "q_".to_string(),
            omit_queue_tag: false,
        });
        let mut runner = StepRunner::new(bridge, queues, root);
        runner.set_worker_name("w1@test");
        runner
    }

    #[test]
    fn test_drive_instance_ok() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &[]);
        let template = StepTemplate::new("sim", "echo");
        let mut inst = StepInstance::from_template(&template, dir.path().join("sim"));

        let code = drive_instance(r.bridge(), &mut inst).unwrap();
        assert_eq!(code, ReturnCode::Ok);
        assert_eq!(inst.state(), StepState::Finished);
        assert_eq!(read_status(inst.workspace()).unwrap().result, "SUCCESS");
    }

    #[test]
    fn test_restart_uses_restart_command() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &[ReturnCode::Restart]);
        let template = StepTemplate::new("sim", "echo run")
            .with_restart("echo resume")
            .with_retry_delay(0);
        let mut inst = StepInstance::from_template(&template, dir.path().join("sim"));

        let code = drive_instance(r.bridge(), &mut inst).unwrap();
        assert_eq!(code, ReturnCode::Ok);
        assert_eq!(inst.restarts(), 1);

        let commands = r.bridge().adapter().commands.lock().unwrap();
        assert_eq!(*commands, vec!["echo run", "echo resume"]);
    }

    #[test]
    fn test_retry_reruns_primary_command() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &[ReturnCode::Retry, ReturnCode::Retry]);
        let template = StepTemplate::new("sim", "echo run")
            .with_restart("echo resume")
            .with_retry_delay(0);
        let mut inst = StepInstance::from_template(&template, dir.path().join("sim"));

        drive_instance(r.bridge(), &mut inst).unwrap();
        let commands = r.bridge().adapter().commands.lock().unwrap();
        assert!(commands.iter().all(|c| c == "echo run"));
        assert_eq!(inst.restarts(), 2);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &[ReturnCode::Retry; 5]);
        let template = StepTemplate::new("sim", "echo")
            .with_max_retries(2)
            .with_retry_delay(0);
        let mut inst = StepInstance::from_template(&template, dir.path().join("sim"));

        let code = drive_instance(r.bridge(), &mut inst).unwrap();
        assert_eq!(code, ReturnCode::SoftFail);
        assert_eq!(inst.restarts(), 2);
        assert_eq!(r.bridge().adapter().calls.load(Ordering::SeqCst), 3);

        let record = read_status(inst.workspace()).unwrap();
        assert_eq!(record.state, StepState::Failed);
        assert_eq!(record.result, "SOFT_FAIL_MAX_RETRIES_REACHED");
    }

    #[test]
    fn test_hard_fail_is_terminal() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &[ReturnCode::HardFail]);
        let template = StepTemplate::new("sim", "echo");
        let mut inst = StepInstance::from_template(&template, dir.path().join("sim"));

        assert_eq!(drive_instance(r.bridge(), &mut inst).unwrap(), ReturnCode::HardFail);
        assert_eq!(r.bridge().adapter().calls.load(Ordering::SeqCst), 1);
        assert_eq!(inst.result(), Some("HARD_FAIL"));
    }

    #[test]
    fn test_run_template_expands_and_routes() {
        let dir = tempdir().unwrap();
        let mut r = runner(dir.path(), &[]);
        r.set_max_parallel(2);

        let template = StepTemplate::new("sim", "echo $(X)").with_task_queue("sim");
        let params = ParameterSet::new().with_parameter("X", "X.%%", [1, 2, 3]);
        let summary = r.run_template(&template, &params).unwrap();

        assert_eq!(summary.len(), 3);
        assert_eq!(summary.succeeded().count(), 3);
        assert_eq!(summary.failed().count(), 0);

        let record = read_status(&dir.path().join("sim/X.2")).unwrap();
        assert_eq!(record.name, "sim_X.2");
        assert_eq!(record.workspace, "sim/X.2");
        let ctx = record.runtime.unwrap();
        assert_eq!(ctx.queue, "q_sim");
        assert_eq!(ctx.worker, "w1@test");
    }

    #[test]
    fn test_prepare_rejects_bad_parameters() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &[]);

        let template = StepTemplate::new("sim", "echo $(X) $(Y)");
        let params = ParameterSet::new()
            .with_parameter("X", "X.%%", [1, 2])
            .with_parameter("Y", "Y.%%", [1]);

        assert!(matches!(
            r.prepare(&template, &params),
            Err(ExecutionError::Expansion(_))
        ));
        assert!(!dir.path().join("sim").exists());
    }

    #[test]
    fn test_run_all_stops_on_stop_workers() {
        let dir = tempdir().unwrap();
        let r = runner(dir.path(), &[ReturnCode::StopWorkers]);

        let templates = vec![
            StepTemplate::new("first", "echo 1"),
            StepTemplate::new("second", "echo 2"),
        ];
        let summary = r.run_all(&templates, &ParameterSet::new()).unwrap();

        assert_eq!(summary.len(), 1);
        assert!(summary.stop_requested());
        assert!(!dir.path().join("second").exists());
        assert_eq!(
            read_status(&dir.path().join("first")).unwrap().state,
            StepState::Cancelled
        );
    }

    #[test]
    fn test_submit_error_leaves_terminal_status() {
        let dir = tempdir().unwrap();
        let r = runner_with(dir.path(), BrokenShellAdapter);
        let template = StepTemplate::new("sim", "echo").with_shell("/no/such/shell");

        let err = r.run_template(&template, &ParameterSet::new()).unwrap_err();
        assert!(matches!(err, ExecutionError::Adapter(AdapterError::Spawn { .. })));

        let record = read_status(&dir.path().join("sim")).unwrap();
        assert_eq!(record.state, StepState::Failed);
        assert_eq!(record.result, "HARD_FAIL");
    }

    #[test]
    fn test_panicking_worker_reports_worker_lost() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (done_tx, done_rx) = channel();

        thread::spawn(move || {
            let mut r = runner_with(&root, PanickyAdapter);
            r.set_max_parallel(1);
            let template = StepTemplate::new("sim", "echo $(X)");
            let params = ParameterSet::new().with_parameter("X", "X.%%", ["boom", "fine"]);
            let _ = done_tx.send(r.run_template(&template, &params));
        });

        let result = done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("runner did not return after a worker panic");
        match result {
            Err(ExecutionError::WorkerLost(name)) => assert_eq!(name, "sim_X.boom"),
            other => panic!("expected WorkerLost, got {:?}", other.map(|s| s.len())),
        }

        let lost = read_status(&dir.path().join("sim/X.boom")).unwrap();
        assert_eq!(lost.state, StepState::Failed);
        assert_eq!(lost.result, "HARD_FAIL");

        let fine = read_status(&dir.path().join("sim/X.fine")).unwrap();
        assert_eq!(fine.state, StepState::Finished);
    }

    #[test]
    fn test_set_max_parallel_floor() {
        let dir = tempdir().unwrap();
        let mut r = runner(dir.path(), &[]);
        r.set_max_parallel(0);
        assert_eq!(r.max_parallel(), 1);
    }

    #[test]
    fn test_local_worker_name_shape() {
        assert!(local_worker_name().starts_with("local@"));
    }
}
