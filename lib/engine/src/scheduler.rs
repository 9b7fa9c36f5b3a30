//! The step scheduler.
//!
//! One scheduler runs per worker process. Each tick it counts running
//! steps, selects a batch of pending steps, filters out steps whose run is
//! paused or terminated or whose dependencies are not all completed, and
//! attempts the atomic claim on each survivor. Claimed steps are
//! dispatched on their own tasks so the polling loop never blocks on a
//! child process.
//!
//! Mutual exclusion between workers comes entirely from the store's
//! conditional claim update; the loop holds no in-memory locks.

use crate::error::EngineError;
use crate::flow::{FlowInvocation, FlowRunner};
use crate::process::{spawn_script, SpawnSpec};
use crate::registry::{ProcessKey, ProcessRegistry};
use chrono::Utc;
use maxq_core::{RunId, WorkerId};
use maxq_store::{
    RunRecord, RunStatus, StageStatus, StepOutcome, StepRecord, StepStatus, Store,
};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Polling period.
    pub interval: Duration,
    /// Maximum candidates considered per tick.
    pub batch_size: i64,
    /// Global cap on concurrently running steps for this worker.
    pub max_concurrent_steps: i64,
    /// Per-stream capture limit for step scripts.
    pub max_capture_bytes: usize,
    /// Root directory containing flow definitions.
    pub flows_root: PathBuf,
    /// Base URL advertised to children via `MAXQ_API`.
    pub api_base: String,
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop and waits for the current tick to finish.
    ///
    /// In-flight dispatches are not interrupted; they run to completion on
    /// their own tasks.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// The per-worker scheduler.
///
/// Cheap to clone: every field is a shared handle.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    registry: ProcessRegistry,
    flow: Arc<dyn FlowRunner>,
    config: SchedulerConfig,
    worker_id: WorkerId,
}

impl Scheduler {
    /// Creates a scheduler with a fresh worker identity.
    pub fn new(
        store: Store,
        registry: ProcessRegistry,
        flow: Arc<dyn FlowRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            flow,
            config,
            worker_id: WorkerId::new(),
        }
    }

    /// This worker's claim identity.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Starts the polling loop on its own task.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(worker_id = %scheduler.worker_id, "scheduler started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            tracing::warn!(error = %e, "scheduler tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!(worker_id = %scheduler.worker_id, "scheduler stopping");
                        break;
                    }
                }
            }
        });

        SchedulerHandle { shutdown, task }
    }

    /// Runs one scheduling pass. Returns the number of steps claimed.
    ///
    /// # Errors
    ///
    /// Propagates store failures; individual claim losses are not errors.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        let running = self.store.steps().count_running().await?;
        if running >= self.config.max_concurrent_steps {
            return Ok(0);
        }

        let budget = (self.config.max_concurrent_steps - running).min(self.config.batch_size);
        let candidates = self.store.steps().list_pending(budget).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut claimed = 0;
        for step in candidates {
            let Some(run) = self.store.runs().find_by_id(step.run_id).await? else {
                continue;
            };
            if run.termination_reason.is_some() || run.status == RunStatus::Paused {
                continue;
            }

            let siblings = self.store.steps().list_by_run(step.run_id).await?;
            if !dependencies_completed(&step, &siblings) {
                continue;
            }

            let now = Utc::now();
            if !self
                .store
                .steps()
                .claim(step.run_id, &step.step_id, self.worker_id, now)
                .await?
            {
                // Another worker won the row.
                continue;
            }
            claimed += 1;

            tracing::debug!(
                run_id = %step.run_id,
                step_id = %step.step_id,
                worker_id = %self.worker_id,
                "claimed step"
            );

            let _ = self.store.stages().mark_running(step.stage_id, now).await;
            let _ = self.store.runs().mark_running(step.run_id, now).await;

            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.dispatch(run, step).await;
            });
        }

        Ok(claimed)
    }

    /// Executes a claimed step to its terminal state, then applies cascade
    /// and stage-completion logic.
    async fn dispatch(&self, run: RunRecord, step: StepRecord) {
        let outcome = self.execute_attempts(&run, &step).await;
        let status = outcome.status;

        tracing::info!(
            run_id = %step.run_id,
            step_id = %step.step_id,
            status = ?status,
            retries = outcome.retry_count,
            "step finished"
        );

        if let Err(e) = self
            .store
            .steps()
            .finish(step.run_id, &step.step_id, &outcome, Utc::now())
            .await
        {
            tracing::warn!(step_id = %step.step_id, error = %e, "failed to record step outcome");
        }

        if status == StepStatus::Failed {
            if let Err(e) = self.cascade_failures(step.run_id, step.stage_id).await {
                tracing::warn!(run_id = %step.run_id, error = %e, "cascade failed");
            }
        }

        if let Err(e) = self.check_stage_completion(step.run_id, step.stage_id).await {
            tracing::warn!(run_id = %step.run_id, error = %e, "stage completion check failed");
        }
    }

    /// Runs the step script, retrying on non-zero exit up to `max_retries`
    /// additional attempts. The exit code of the final attempt is the sole
    /// determinant of the outcome status.
    async fn execute_attempts(&self, run: &RunRecord, step: &StepRecord) -> StepOutcome {
        let step_dir = self
            .config
            .flows_root
            .join(&run.flow_name)
            .join("steps")
            .join(&step.name);
        let script = step_dir.join("step.sh");

        let mut env: BTreeMap<String, String> = step.env.clone().unwrap_or_default();
        // Engine variables are applied last; user env may override none.
        env.insert("MAXQ_RUN_ID".to_string(), step.run_id.to_string());
        env.insert("MAXQ_FLOW_NAME".to_string(), run.flow_name.clone());
        env.insert("MAXQ_API".to_string(), self.config.api_base.clone());
        env.insert("MAXQ_STEP_ID".to_string(), step.step_id.clone());
        env.insert("MAXQ_STEP_NAME".to_string(), step.name.clone());
        if let Ok(Some(stage)) = self.store.stages().find_by_id(step.stage_id).await {
            env.insert("MAXQ_STAGE".to_string(), stage.name);
        }

        let spec = SpawnSpec {
            script,
            cwd: step_dir,
            env,
            max_capture_bytes: self.config.max_capture_bytes,
        };

        let max_retries = step.max_retries.max(0);
        let mut retry_count = 0i64;
        let key = ProcessKey::step(step.run_id, step.step_id.clone());

        loop {
            let registry = self.registry.clone();
            let register_key = key.clone();
            let result = spawn_script(&spec, move |pid| registry.register(register_key, pid)).await;
            self.registry.unregister(&key);

            match result {
                Err(e) => {
                    // A spawn failure is not a script exit; retrying cannot help.
                    let message = e.to_string();
                    return StepOutcome {
                        status: StepStatus::Failed,
                        stdout: String::new(),
                        stderr: message.clone(),
                        error: Some(message),
                        retry_count,
                        duration_ms: 0,
                    };
                }
                Ok(output) if output.success() => {
                    return StepOutcome {
                        status: StepStatus::Completed,
                        stdout: output.stdout,
                        stderr: output.stderr,
                        error: None,
                        retry_count,
                        duration_ms: output.duration_ms,
                    };
                }
                Ok(output) => {
                    if retry_count < max_retries {
                        retry_count += 1;
                        tracing::debug!(
                            step_id = %step.step_id,
                            attempt = retry_count,
                            exit_code = output.exit_code,
                            "retrying step"
                        );
                        if let Err(e) = self
                            .store
                            .steps()
                            .set_retry_count(step.run_id, &step.step_id, retry_count)
                            .await
                        {
                            tracing::warn!(step_id = %step.step_id, error = %e, "failed to bump retry count");
                        }
                        continue;
                    }
                    return StepOutcome {
                        status: StepStatus::Failed,
                        stdout: output.stdout,
                        stderr: output.stderr,
                        error: Some(format!("step exited with code {}", output.exit_code)),
                        retry_count,
                        duration_ms: output.duration_ms,
                    };
                }
            }
        }
    }

    /// Fails every not-yet-terminal step in the stage whose dependencies
    /// transitively include a failed step, until a fixed point.
    async fn cascade_failures(&self, run_id: RunId, stage_id: maxq_core::StageId) -> Result<(), EngineError> {
        let steps = self.store.steps().list_by_stage(stage_id).await?;

        let mut failed: HashSet<String> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_id.clone())
            .collect();
        let mut live: Vec<(String, Vec<String>)> = steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| (s.step_id.clone(), s.depends_on.clone()))
            .collect();

        loop {
            let victims: Vec<(String, String)> = live
                .iter()
                .filter_map(|(id, deps)| {
                    deps.iter()
                        .find(|dep| failed.contains(dep.as_str()))
                        .map(|dep| (id.clone(), dep.clone()))
                })
                .collect();
            if victims.is_empty() {
                break;
            }

            for (step_id, dependency) in victims {
                let stderr = format!("Skipped: dependency '{dependency}' failed");
                self.store
                    .steps()
                    .mark_dependency_failed(run_id, &step_id, &stderr, Utc::now())
                    .await?;
                tracing::info!(run_id = %run_id, step_id = %step_id, dependency = %dependency, "step skipped");
                failed.insert(step_id.clone());
                live.retain(|(id, _)| id != &step_id);
            }
        }

        Ok(())
    }

    /// Finalizes the stage once every step is terminal, then drives the
    /// run: failed-stage callback and run failure, run completion on a
    /// final stage, or the completed-stage callback otherwise.
    async fn check_stage_completion(
        &self,
        run_id: RunId,
        stage_id: maxq_core::StageId,
    ) -> Result<(), EngineError> {
        let Some(run) = self.store.runs().find_by_id(run_id).await? else {
            return Ok(());
        };
        // A paused or terminated run keeps its rows for resume/retry; no
        // finalization and no callbacks.
        if run.termination_reason.is_some()
            || matches!(
                run.status,
                RunStatus::Paused | RunStatus::Completed | RunStatus::Failed
            )
        {
            return Ok(());
        }

        let Some(stage) = self.store.stages().find_by_id(stage_id).await? else {
            return Ok(());
        };
        let steps = self.store.steps().list_by_stage(stage_id).await?;
        if steps.is_empty() || steps.iter().any(|s| !s.status.is_terminal()) {
            return Ok(());
        }

        let any_failed = steps.iter().any(|s| s.status == StepStatus::Failed);
        let status = if any_failed {
            StageStatus::Failed
        } else {
            StageStatus::Completed
        };

        // Conditional update: exactly one worker finalizes the stage and
        // owns the callback.
        if !self.store.stages().finish(stage_id, status, Utc::now()).await? {
            return Ok(());
        }
        tracing::info!(run_id = %run_id, stage = %stage.name, status = ?status, "stage finished");

        match status {
            StageStatus::Failed => {
                match self
                    .flow
                    .run_flow(
                        run_id,
                        &run.flow_name,
                        FlowInvocation::StageFailed {
                            stage: stage.name.clone(),
                        },
                    )
                    .await
                {
                    Ok(output) => {
                        let _ = self
                            .store
                            .runs()
                            .set_output_streams(run_id, &output.stdout, &output.stderr)
                            .await;
                        if !output.success() {
                            tracing::warn!(
                                run_id = %run_id,
                                exit_code = output.exit_code,
                                "stage-failed callback exited non-zero"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, error = %e, "stage-failed callback failed");
                    }
                }
                let error = format!("stage '{}' failed", stage.name);
                let _ = self
                    .store
                    .runs()
                    .finish(run_id, RunStatus::Failed, Some(&error), Utc::now())
                    .await?;
            }
            StageStatus::Completed if stage.is_final => {
                let _ = self
                    .store
                    .runs()
                    .finish(run_id, RunStatus::Completed, None, Utc::now())
                    .await?;
                tracing::info!(run_id = %run_id, "run completed");
            }
            StageStatus::Completed => {
                match self
                    .flow
                    .run_flow(
                        run_id,
                        &run.flow_name,
                        FlowInvocation::StageCompleted {
                            stage: stage.name.clone(),
                        },
                    )
                    .await
                {
                    Ok(output) if output.success() => {
                        let _ = self
                            .store
                            .runs()
                            .set_output_streams(run_id, &output.stdout, &output.stderr)
                            .await;
                        // The flow signalled "done" by scheduling nothing.
                        let live_stages = self.store.stages().count_live_by_run(run_id).await?;
                        let live_steps = self.store.steps().count_live_by_run(run_id).await?;
                        if live_stages == 0 && live_steps == 0 {
                            let _ = self
                                .store
                                .runs()
                                .finish(run_id, RunStatus::Completed, None, Utc::now())
                                .await?;
                            tracing::info!(run_id = %run_id, "run completed");
                        }
                    }
                    Ok(output) => {
                        tracing::warn!(
                            run_id = %run_id,
                            exit_code = output.exit_code,
                            "stage-completed callback exited non-zero"
                        );
                        let error = format!(
                            "flow callback for stage '{}' exited with code {}",
                            stage.name, output.exit_code
                        );
                        let _ = self
                            .store
                            .runs()
                            .finish(run_id, RunStatus::Failed, Some(&error), Utc::now())
                            .await?;
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, error = %e, "stage-completed callback failed");
                        let error = format!(
                            "flow callback for stage '{}' failed: {e}",
                            stage.name
                        );
                        let _ = self
                            .store
                            .runs()
                            .finish(run_id, RunStatus::Failed, Some(&error), Utc::now())
                            .await?;
                    }
                }
            }
            StageStatus::Pending | StageStatus::Running => {}
        }

        Ok(())
    }
}

/// True when every dependency of `step` resolves to a completed sibling.
fn dependencies_completed(step: &StepRecord, siblings: &[StepRecord]) -> bool {
    step.depends_on.iter().all(|dep| {
        siblings
            .iter()
            .any(|s| &s.step_id == dep && s.status == StepStatus::Completed)
    })
}
