//! Run-level actions: create, abort, pause, resume, retry.
//!
//! Each action is a store mutation plus, where the run owns live
//! children, a registry kill. Preconditions surface as typed errors with
//! stable phrases the HTTP layer (and its tests) match on.

use crate::flow::{read_flow_title, FlowInvocation, FlowRunner};
use crate::registry::ProcessRegistry;
use chrono::Utc;
use maxq_core::{validate_name, RunId};
use maxq_store::{
    RunRecord, RunStatus, StepRecord, StepStatus, Store, StoreError, TerminationReason,
};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Errors from run controller operations.
#[derive(Debug)]
pub enum ControllerError {
    /// The named flow has no `flow.sh` under the flows root.
    FlowNotFound { flow_name: String },
    /// A name failed charset validation.
    InvalidName { message: String },
    /// No run with this id.
    RunNotFound { run_id: RunId },
    /// The action requires a non-terminal run.
    RunAlreadyTerminal { run_id: RunId },
    /// Resume requires a paused run.
    RunNotPaused { run_id: RunId },
    /// Retry is not legal on a completed run.
    RunCompleted { run_id: RunId },
    /// Retry requested while the run is still in progress.
    RunInProgress { run_id: RunId },
    /// No step with this id in the run.
    StepNotFound { run_id: RunId, step_id: String },
    /// Step retry requires a failed step.
    StepNotFailed { step_id: String },
    /// Store failure.
    Store(StoreError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowNotFound { flow_name } => write!(f, "flow '{flow_name}' not found"),
            Self::InvalidName { message } => write!(f, "{message}"),
            Self::RunNotFound { run_id } => write!(f, "run '{run_id}' not found"),
            Self::RunAlreadyTerminal { run_id } => {
                write!(f, "run '{run_id}' is already in a terminal state")
            }
            Self::RunNotPaused { run_id } => write!(f, "run '{run_id}' is not paused"),
            Self::RunCompleted { run_id } => {
                write!(f, "run '{run_id}' is completed and cannot be retried")
            }
            Self::RunInProgress { run_id } => {
                write!(f, "run '{run_id}' is still in progress")
            }
            Self::StepNotFound { run_id, step_id } => {
                write!(f, "step '{step_id}' not found in run '{run_id}'")
            }
            Self::StepNotFailed { step_id } => {
                write!(f, "step '{step_id}' is not failed")
            }
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<StoreError> for ControllerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Controller tuning knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root directory containing flow definitions.
    pub flows_root: PathBuf,
    /// Grace period between SIGTERM and SIGKILL on abort.
    pub abort_grace: Duration,
    /// Grace period between SIGTERM and SIGKILL on pause.
    pub pause_grace: Duration,
}

/// Result of an abort or pause.
#[derive(Debug, Clone, Copy)]
pub struct KillOutcome {
    /// Processes initially signalled.
    pub processes_killed: usize,
}

/// Result of a step retry.
#[derive(Debug, Clone)]
pub struct StepRetryOutcome {
    /// The reset step.
    pub step: StepRecord,
    /// Ids of downstream failed steps that were also reset.
    pub cascaded_steps: Vec<String>,
}

/// The run controller.
///
/// Cheap to clone: every field is a shared handle.
#[derive(Clone)]
pub struct RunController {
    store: Store,
    registry: ProcessRegistry,
    flow: Arc<dyn FlowRunner>,
    config: ControllerConfig,
}

impl RunController {
    /// Creates a controller.
    pub fn new(
        store: Store,
        registry: ProcessRegistry,
        flow: Arc<dyn FlowRunner>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            flow,
            config,
        }
    }

    /// Creates a pending run and kicks off the initial flow invocation
    /// asynchronously. Responds as soon as the row exists.
    ///
    /// # Errors
    ///
    /// Rejects invalid flow names and flows without an executable script
    /// path on disk.
    pub async fn create_run(
        &self,
        flow_name: &str,
        input: Option<JsonValue>,
        metadata: Option<JsonValue>,
    ) -> Result<RunRecord, ControllerError> {
        validate_name("flow name", flow_name).map_err(|e| ControllerError::InvalidName {
            message: e.to_string(),
        })?;

        let script = self.config.flows_root.join(flow_name).join("flow.sh");
        if !script.is_file() {
            return Err(ControllerError::FlowNotFound {
                flow_name: flow_name.to_string(),
            });
        }

        let mut run = RunRecord::new(flow_name.to_string(), input, metadata);
        run.flow_title = read_flow_title(&self.config.flows_root, flow_name);
        self.store.runs().create(&run).await?;

        tracing::info!(run_id = %run.id, flow_name, "run created");

        let controller = self.clone();
        let spawned = run.clone();
        tokio::spawn(async move {
            controller.drive_initial_flow(spawned).await;
        });

        Ok(run)
    }

    /// Runs the initial flow invocation and applies its outcome.
    async fn drive_initial_flow(&self, run: RunRecord) {
        let run_id = run.id;
        if let Err(e) = self.store.runs().mark_running(run_id, Utc::now()).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to mark run running");
        }

        match self
            .flow
            .run_flow(run_id, &run.flow_name, FlowInvocation::Initial)
            .await
        {
            Ok(output) => {
                if let Err(e) = self
                    .store
                    .runs()
                    .set_output_streams(run_id, &output.stdout, &output.stderr)
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to store flow output");
                }

                if output.success() {
                    // A flow that scheduled nothing and exited cleanly is done.
                    match self.run_has_live_work(run_id).await {
                        Ok(false) => {
                            let _ = self
                                .store
                                .runs()
                                .finish(run_id, RunStatus::Completed, None, Utc::now())
                                .await;
                            tracing::info!(run_id = %run_id, "flow scheduled no stages; run completed");
                        }
                        Ok(true) => {}
                        Err(e) => {
                            tracing::warn!(run_id = %run_id, error = %e, "failed to inspect run work");
                        }
                    }
                } else {
                    let error = format!("flow exited with code {}", output.exit_code);
                    tracing::warn!(run_id = %run_id, exit_code = output.exit_code, "initial flow failed");
                    let _ = self
                        .store
                        .runs()
                        .finish(run_id, RunStatus::Failed, Some(&error), Utc::now())
                        .await;
                }
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(run_id = %run_id, error = %error, "initial flow could not be spawned");
                let _ = self
                    .store
                    .runs()
                    .finish(run_id, RunStatus::Failed, Some(&error), Utc::now())
                    .await;
            }
        }
    }

    async fn run_has_live_work(&self, run_id: RunId) -> Result<bool, StoreError> {
        let stages = self.store.stages().list_by_run(run_id).await?;
        if stages.iter().any(|s| !s.status.is_terminal()) {
            return Ok(true);
        }
        Ok(self.store.steps().count_live_by_run(run_id).await? > 0)
    }

    async fn require_run(&self, run_id: RunId) -> Result<RunRecord, ControllerError> {
        self.store
            .runs()
            .find_by_id(run_id)
            .await?
            .ok_or(ControllerError::RunNotFound { run_id })
    }

    /// Aborts a non-terminal run: sets the termination marker, kills its
    /// processes, and bulk-fails its stages and steps.
    pub async fn abort(&self, run_id: RunId) -> Result<KillOutcome, ControllerError> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(ControllerError::RunAlreadyTerminal { run_id });
        }

        let now = Utc::now();
        self.store
            .runs()
            .terminate(run_id, TerminationReason::Aborted, now)
            .await?;
        let processes_killed = self
            .registry
            .kill_run(run_id, self.config.abort_grace)
            .await;
        self.store
            .stages()
            .terminate_by_run(run_id, TerminationReason::Aborted, now)
            .await?;
        self.store
            .steps()
            .terminate_by_run(run_id, TerminationReason::Aborted, now)
            .await?;

        tracing::info!(run_id = %run_id, processes_killed, "run aborted");
        Ok(KillOutcome { processes_killed })
    }

    /// Pauses a non-terminal run: the scheduler stops claiming its steps
    /// and live children are signalled.
    pub async fn pause(&self, run_id: RunId) -> Result<KillOutcome, ControllerError> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(ControllerError::RunAlreadyTerminal { run_id });
        }

        self.store.runs().pause(run_id).await?;
        let processes_killed = self
            .registry
            .kill_run(run_id, self.config.pause_grace)
            .await;

        tracing::info!(run_id = %run_id, processes_killed, "run paused");
        Ok(KillOutcome { processes_killed })
    }

    /// Resumes a paused run: non-completed stages and steps (including
    /// steps failed by pause signals) go back to pending for the
    /// scheduler to pick up.
    pub async fn resume(&self, run_id: RunId) -> Result<RunRecord, ControllerError> {
        let run = self.require_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(ControllerError::RunNotPaused { run_id });
        }

        let now = Utc::now();
        self.store.stages().reset_non_completed_by_run(run_id).await?;
        self.store
            .steps()
            .reset_non_completed_by_run(run_id, now)
            .await?;
        self.store.runs().resume(run_id).await?;

        tracing::info!(run_id = %run_id, "run resumed");
        self.require_run(run_id).await
    }

    /// Retries a failed run: resets non-completed stages/steps, clears the
    /// termination marker, and re-invokes the initial flow. The flow's
    /// scheduling request reuses the existing stage/step rows.
    pub async fn retry_run(&self, run_id: RunId) -> Result<RunRecord, ControllerError> {
        let run = self.require_run(run_id).await?;
        match run.status {
            RunStatus::Completed => return Err(ControllerError::RunCompleted { run_id }),
            RunStatus::Failed => {}
            _ => return Err(ControllerError::RunInProgress { run_id }),
        }

        let now = Utc::now();
        self.store.stages().reset_non_completed_by_run(run_id).await?;
        self.store
            .steps()
            .reset_non_completed_by_run(run_id, now)
            .await?;
        self.store.runs().reset_for_retry(run_id).await?;

        tracing::info!(run_id = %run_id, "run retry requested");

        let refreshed = self.require_run(run_id).await?;
        let controller = self.clone();
        let spawned = refreshed.clone();
        tokio::spawn(async move {
            controller.drive_initial_flow(spawned).await;
        });

        Ok(refreshed)
    }

    /// Retries a failed step, optionally resetting every failed step that
    /// transitively depends on it within the same stage, and reopens the
    /// run and stage for the scheduler.
    pub async fn retry_step(
        &self,
        run_id: RunId,
        step_id: &str,
        cascade_downstream: bool,
    ) -> Result<StepRetryOutcome, ControllerError> {
        let run = self.require_run(run_id).await?;
        if run.status == RunStatus::Completed {
            return Err(ControllerError::RunCompleted { run_id });
        }

        let step = self
            .store
            .steps()
            .find(run_id, step_id)
            .await?
            .ok_or_else(|| ControllerError::StepNotFound {
                run_id,
                step_id: step_id.to_string(),
            })?;
        if step.status != StepStatus::Failed {
            return Err(ControllerError::StepNotFailed {
                step_id: step_id.to_string(),
            });
        }

        let now = Utc::now();
        self.store
            .steps()
            .reset_to_pending(run_id, step_id, now)
            .await?;

        let mut cascaded_steps = Vec::new();
        if cascade_downstream {
            let siblings = self.store.steps().list_by_stage(step.stage_id).await?;
            for dependent in failed_dependents(step_id, &siblings) {
                self.store
                    .steps()
                    .reset_to_pending(run_id, &dependent, now)
                    .await?;
                cascaded_steps.push(dependent);
            }
        }

        self.store.stages().reopen(step.stage_id).await?;
        self.store.runs().reopen_for_step_retry(run_id).await?;

        tracing::info!(
            run_id = %run_id,
            step_id,
            cascaded = cascaded_steps.len(),
            "step retry requested"
        );

        let step = self
            .store
            .steps()
            .find(run_id, step_id)
            .await?
            .ok_or_else(|| ControllerError::StepNotFound {
                run_id,
                step_id: step_id.to_string(),
            })?;

        Ok(StepRetryOutcome {
            step,
            cascaded_steps,
        })
    }
}

/// Failed steps that transitively depend on `root` within the stage,
/// in a deterministic order.
fn failed_dependents(root: &str, siblings: &[StepRecord]) -> Vec<String> {
    let mut reset: HashSet<&str> = HashSet::new();
    reset.insert(root);

    let mut out = Vec::new();
    loop {
        let mut progressed = false;
        for step in siblings {
            if step.status != StepStatus::Failed || reset.contains(step.step_id.as_str()) {
                continue;
            }
            if step.depends_on.iter().any(|dep| reset.contains(dep.as_str())) {
                reset.insert(step.step_id.as_str());
                out.push(step.step_id.clone());
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowExecutor;
    use maxq_core::WorkerId;
    use maxq_store::{StageStatus, StepDef, StepOutcome};
    use std::io::Write;
    use std::path::Path;

    fn write_flow(root: &Path, flow: &str, body: &str) {
        let dir = root.join(flow);
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("flow.sh");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        write!(file, "{body}").unwrap();
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn controller_over(root: &Path, store: &Store) -> Arc<RunController> {
        let registry = ProcessRegistry::new();
        let flow = Arc::new(FlowExecutor::new(
            root.to_path_buf(),
            "http://127.0.0.1:5003/api/v1".to_string(),
            8192,
            registry.clone(),
        ));
        Arc::new(RunController::new(
            store.clone(),
            registry,
            flow,
            ControllerConfig {
                flows_root: root.to_path_buf(),
                abort_grace: Duration::from_millis(200),
                pause_grace: Duration::from_millis(200),
            },
        ))
    }

    async fn wait_for_status(store: &Store, run_id: RunId, status: RunStatus) {
        for _ in 0..200 {
            let run = store.runs().find_by_id(run_id).await.unwrap().unwrap();
            if run.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run never reached {status:?}");
    }

    fn def(id: &str, deps: &[&str]) -> StepDef {
        StepDef {
            id: id.to_string(),
            name: id.to_string(),
            depends_on: deps.iter().map(|s| (*s).to_string()).collect(),
            max_retries: 0,
            env: None,
        }
    }

    #[tokio::test]
    async fn create_run_rejects_unknown_flow() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let err = controller.create_run("ghost", None, None).await.unwrap_err();
        assert!(matches!(err, ControllerError::FlowNotFound { .. }));

        let err = controller
            .create_run("../escape", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidName { .. }));
    }

    #[tokio::test]
    async fn create_run_completes_when_flow_schedules_nothing() {
        let root = tempfile::tempdir().unwrap();
        write_flow(root.path(), "idle", "exit 0\n");

        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let run = controller.create_run("idle", None, None).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        wait_for_status(&store, run.id, RunStatus::Completed).await;
    }

    #[tokio::test]
    async fn create_run_fails_when_initial_flow_exits_nonzero() {
        let root = tempfile::tempdir().unwrap();
        write_flow(root.path(), "broken", "echo bad >&2\nexit 2\n");

        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let run = controller.create_run("broken", None, None).await.unwrap();
        wait_for_status(&store, run.id, RunStatus::Failed).await;

        let run = store.runs().find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(run.error.as_deref(), Some("flow exited with code 2"));
        assert!(run.termination_reason.is_none());
        assert!(run.stderr.unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn create_run_picks_up_flow_title() {
        let root = tempfile::tempdir().unwrap();
        write_flow(root.path(), "titled", "exit 0\n");
        std::fs::write(
            root.path().join("titled").join("flow.yaml"),
            "title: A Titled Flow\n",
        )
        .unwrap();

        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let run = controller.create_run("titled", None, None).await.unwrap();
        assert_eq!(run.flow_title.as_deref(), Some("A Titled Flow"));
    }

    #[tokio::test]
    async fn abort_terminates_rows_and_blocks_double_abort() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let mut run = RunRecord::new("flow".to_string(), None, None);
        run.status = RunStatus::Running;
        store.runs().create(&run).await.unwrap();
        store
            .stages()
            .schedule(run.id, "main", true, &[def("a", &[])])
            .await
            .unwrap();

        let outcome = controller.abort(run.id).await.unwrap();
        assert_eq!(outcome.processes_killed, 0);

        let aborted = store.runs().find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(aborted.status, RunStatus::Failed);
        assert_eq!(aborted.termination_reason, Some(TerminationReason::Aborted));

        let step = store.steps().find(run.id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.termination_reason, Some(TerminationReason::Aborted));

        let err = controller.abort(run.id).await.unwrap_err();
        assert!(matches!(err, ControllerError::RunAlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let mut run = RunRecord::new("flow".to_string(), None, None);
        run.status = RunStatus::Running;
        store.runs().create(&run).await.unwrap();

        let err = controller.resume(run.id).await.unwrap_err();
        assert!(matches!(err, ControllerError::RunNotPaused { .. }));
    }

    #[tokio::test]
    async fn pause_then_resume_resets_failed_steps() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let mut run = RunRecord::new("flow".to_string(), None, None);
        run.status = RunStatus::Running;
        store.runs().create(&run).await.unwrap();
        store
            .stages()
            .schedule(run.id, "main", true, &[def("a", &[])])
            .await
            .unwrap();

        // Simulate a claim that got killed by the pause signal.
        store
            .steps()
            .claim(run.id, "a", WorkerId::new(), Utc::now())
            .await
            .unwrap();
        controller.pause(run.id).await.unwrap();
        store
            .steps()
            .finish(
                run.id,
                "a",
                &StepOutcome {
                    status: StepStatus::Failed,
                    stdout: String::new(),
                    stderr: "Terminated".to_string(),
                    error: Some("step exited with code 143".to_string()),
                    retry_count: 0,
                    duration_ms: 10,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let resumed = controller.resume(run.id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Pending);

        let step = store.steps().find(run.id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.worker_id.is_none());
        assert!(step.error.is_none());
    }

    #[tokio::test]
    async fn retry_run_has_strict_preconditions() {
        let root = tempfile::tempdir().unwrap();
        write_flow(root.path(), "flow", "exit 0\n");
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let mut run = RunRecord::new("flow".to_string(), None, None);
        run.status = RunStatus::Running;
        store.runs().create(&run).await.unwrap();

        // Still in progress: conflict.
        let err = controller.retry_run(run.id).await.unwrap_err();
        assert!(matches!(err, ControllerError::RunInProgress { .. }));

        // Completed: invalid.
        store
            .runs()
            .finish(run.id, RunStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        let err = controller.retry_run(run.id).await.unwrap_err();
        assert!(matches!(err, ControllerError::RunCompleted { .. }));
    }

    #[tokio::test]
    async fn retry_run_resets_and_reinvokes_the_flow() {
        let root = tempfile::tempdir().unwrap();
        write_flow(root.path(), "flow", "touch reinvoked.txt\nexit 0\n");
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let mut run = RunRecord::new("flow".to_string(), None, None);
        run.status = RunStatus::Running;
        store.runs().create(&run).await.unwrap();
        store
            .stages()
            .schedule(run.id, "main", true, &[def("a", &[])])
            .await
            .unwrap();
        controller.abort(run.id).await.unwrap();

        let retried = controller.retry_run(run.id).await.unwrap();
        assert_eq!(retried.status, RunStatus::Pending);
        assert!(retried.termination_reason.is_none());

        // Rows were reused and reset, not duplicated.
        let stages = store.stages().list_by_run(run.id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Pending);
        let steps = store.steps().list_by_run(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Pending);

        // The initial flow ran again; with pending work restored the run
        // stays live for the scheduler rather than completing.
        let marker = root.path().join("flow").join("reinvoked.txt");
        for _ in 0..200 {
            if marker.is_file() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(marker.is_file());

        let run_after = store.runs().find_by_id(run.id).await.unwrap().unwrap();
        assert!(matches!(
            run_after.status,
            RunStatus::Pending | RunStatus::Running
        ));
    }

    #[tokio::test]
    async fn retry_step_resets_failed_dependents_on_cascade() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let mut run = RunRecord::new("flow".to_string(), None, None);
        run.status = RunStatus::Running;
        store.runs().create(&run).await.unwrap();
        let (stage, _) = store
            .stages()
            .schedule(
                run.id,
                "main",
                true,
                &[
                    def("root", &[]),
                    def("mid", &["root"]),
                    def("leaf", &["mid"]),
                    def("bystander", &[]),
                ],
            )
            .await
            .unwrap();

        // Fail root, cascade mid/leaf; bystander completes.
        let worker = WorkerId::new();
        for (id, status) in [
            ("root", StepStatus::Failed),
            ("bystander", StepStatus::Completed),
        ] {
            store.steps().claim(run.id, id, worker, Utc::now()).await.unwrap();
            store
                .steps()
                .finish(
                    run.id,
                    id,
                    &StepOutcome {
                        status,
                        stdout: String::new(),
                        stderr: String::new(),
                        error: None,
                        retry_count: 0,
                        duration_ms: 1,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        for id in ["mid", "leaf"] {
            store
                .steps()
                .mark_dependency_failed(run.id, id, "Skipped: dependency 'root' failed", Utc::now())
                .await
                .unwrap();
        }
        store
            .stages()
            .finish(stage.id, StageStatus::Failed, Utc::now())
            .await
            .unwrap();
        store
            .runs()
            .finish(run.id, RunStatus::Failed, Some("stage 'main' failed"), Utc::now())
            .await
            .unwrap();

        let outcome = controller.retry_step(run.id, "root", true).await.unwrap();
        assert_eq!(outcome.step.status, StepStatus::Pending);
        assert_eq!(outcome.cascaded_steps, vec!["leaf", "mid"]);

        // The completed bystander is untouched.
        let bystander = store.steps().find(run.id, "bystander").await.unwrap().unwrap();
        assert_eq!(bystander.status, StepStatus::Completed);

        let run_after = store.runs().find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(run_after.status, RunStatus::Running);
        let stage_after = store.stages().find_by_id(stage.id).await.unwrap().unwrap();
        assert_eq!(stage_after.status, StageStatus::Running);
    }

    #[tokio::test]
    async fn retry_step_preconditions() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let controller = controller_over(root.path(), &store);

        let mut run = RunRecord::new("flow".to_string(), None, None);
        run.status = RunStatus::Running;
        store.runs().create(&run).await.unwrap();
        store
            .stages()
            .schedule(run.id, "main", true, &[def("a", &[])])
            .await
            .unwrap();

        // Pending step cannot be retried.
        let err = controller.retry_step(run.id, "a", false).await.unwrap_err();
        assert!(matches!(err, ControllerError::StepNotFailed { .. }));

        // Unknown step.
        let err = controller.retry_step(run.id, "nope", false).await.unwrap_err();
        assert!(matches!(err, ControllerError::StepNotFound { .. }));

        // Completed run refuses step retries.
        store
            .runs()
            .finish(run.id, RunStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        let err = controller.retry_step(run.id, "a", false).await.unwrap_err();
        assert!(matches!(err, ControllerError::RunCompleted { .. }));
    }
}
