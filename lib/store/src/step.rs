//! Step records, scheduling fields, and the claim primitive.

use crate::error::StoreError;
use crate::run::TerminationReason;
use chrono::{DateTime, Utc};
use maxq_core::{RunId, StageId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Lifecycle state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for dependencies and a worker claim.
    Pending,
    /// Claimed; the script is executing.
    Running,
    /// Final attempt exited zero.
    Completed,
    /// Final attempt exited non-zero, or the step was skipped/terminated.
    Failed,
}

impl StepStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn from_str_value(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A step definition within a stage-scheduling request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDef {
    /// Flow-author-chosen id, unique within the run.
    pub id: String,
    /// Step-script directory name under `steps/`.
    pub name: String,
    /// Ids of sibling steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Additional attempts on non-zero exit.
    #[serde(default)]
    pub max_retries: i64,
    /// Extra environment for the step script.
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
}

/// A step record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Owning run.
    pub run_id: RunId,
    /// Flow-author-chosen id, unique within the run.
    pub step_id: String,
    /// Owning stage.
    pub stage_id: StageId,
    /// Step-script directory name.
    pub name: String,
    /// Current status.
    pub status: StepStatus,
    /// Ids of sibling steps that must complete first.
    pub depends_on: Vec<String>,
    /// Attempts consumed beyond the first.
    pub retry_count: i64,
    /// Additional attempts allowed on non-zero exit.
    pub max_retries: i64,
    /// Extra environment for the step script.
    pub env: Option<BTreeMap<String, String>>,
    /// Arbitrary JSON posted back by the script; never affects status.
    pub fields: Option<JsonValue>,
    /// Engine-side error description (spawn failure, skip reason).
    pub error: Option<String>,
    /// Captured stdout of the last attempt.
    pub stdout: Option<String>,
    /// Captured stderr of the last attempt.
    pub stderr: Option<String>,
    /// Non-natural termination marker.
    pub termination_reason: Option<TerminationReason>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the step was enqueued by stage scheduling.
    pub queued_at: Option<DateTime<Utc>>,
    /// When a worker claimed the step.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last claim heartbeat.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Claiming worker.
    pub worker_id: Option<WorkerId>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the last attempt in milliseconds.
    pub duration_ms: Option<i64>,
}

const STEP_COLUMNS: &str = "run_id, step_id, stage_id, name, status, depends_on, retry_count, \
     max_retries, env, fields, error, stdout, stderr, termination_reason, created_at, \
     queued_at, claimed_at, heartbeat_at, worker_id, started_at, completed_at, duration_ms";

/// Row type for step queries.
#[derive(FromRow)]
struct StepRow {
    run_id: String,
    step_id: String,
    stage_id: String,
    name: String,
    status: String,
    depends_on: String,
    retry_count: i64,
    max_retries: i64,
    env: Option<String>,
    fields: Option<String>,
    error: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    termination_reason: Option<String>,
    created_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl StepRow {
    fn try_into_record(self) -> Result<StepRecord, StoreError> {
        let run_id = RunId::from_str(&self.run_id).map_err(|e| StoreError::Decode {
            message: format!("invalid run id '{}': {e}", self.run_id),
        })?;
        let stage_id = StageId::from_str(&self.stage_id).map_err(|e| StoreError::Decode {
            message: format!("invalid stage id '{}': {e}", self.stage_id),
        })?;
        let worker_id = self
            .worker_id
            .as_deref()
            .map(WorkerId::from_str)
            .transpose()
            .map_err(|e| StoreError::Decode {
                message: format!("invalid worker id: {e}"),
            })?;
        let depends_on: Vec<String> =
            serde_json::from_str(&self.depends_on).map_err(|e| StoreError::Decode {
                message: format!("invalid depends_on for step '{}': {e}", self.step_id),
            })?;
        let env: Option<BTreeMap<String, String>> = self
            .env
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Decode {
                message: format!("invalid env for step '{}': {e}", self.step_id),
            })?;
        let fields: Option<JsonValue> = self
            .fields
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Decode {
                message: format!("invalid fields for step '{}': {e}", self.step_id),
            })?;

        Ok(StepRecord {
            run_id,
            step_id: self.step_id,
            stage_id,
            name: self.name,
            status: StepStatus::from_str_value(&self.status),
            depends_on,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            env,
            fields,
            error: self.error,
            stdout: self.stdout,
            stderr: self.stderr,
            termination_reason: self
                .termination_reason
                .as_deref()
                .and_then(TerminationReason::from_str_value),
            created_at: self.created_at,
            queued_at: self.queued_at,
            claimed_at: self.claimed_at,
            heartbeat_at: self.heartbeat_at,
            worker_id,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
        })
    }
}

/// Terminal outcome of a step attempt sequence, written back by a worker.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub retry_count: i64,
    pub duration_ms: i64,
}

/// Repository for step operations.
pub struct StepRepository {
    pool: SqlitePool,
}

impl StepRepository {
    /// Creates a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Finds a step by its run and author-chosen id.
    pub async fn find(
        &self,
        run_id: RunId,
        step_id: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ? AND step_id = ?"
        ))
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StepRow::try_into_record).transpose()
    }

    /// Lists all steps of a run.
    pub async fn list_by_run(&self, run_id: RunId) -> Result<Vec<StepRecord>, StoreError> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ? ORDER BY created_at ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::try_into_record).collect()
    }

    /// Lists all steps of a stage.
    pub async fn list_by_stage(&self, stage_id: StageId) -> Result<Vec<StepRecord>, StoreError> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE stage_id = ? ORDER BY created_at ASC"
        ))
        .bind(stage_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::try_into_record).collect()
    }

    /// Counts steps currently running across all runs.
    pub async fn count_running(&self) -> Result<i64, StoreError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM steps WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Counts a run's steps that have not reached a terminal state.
    pub async fn count_live_by_run(&self, run_id: RunId) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM steps \
             WHERE run_id = ? AND status IN ('pending', 'running')",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Lists pending steps in queue order, up to `limit`.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<StepRecord>, StoreError> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE status = 'pending' \
             ORDER BY queued_at ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::try_into_record).collect()
    }

    /// Atomically claims a pending step for a worker.
    ///
    /// The update only applies while `status = 'pending'`; when multiple
    /// workers race, at most one sees an affected row.
    pub async fn claim(
        &self,
        run_id: RunId,
        step_id: &str,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE steps \
             SET status = 'running', worker_id = ?, claimed_at = ?, \
                 heartbeat_at = ?, started_at = ? \
             WHERE run_id = ? AND step_id = ? AND status = 'pending'",
        )
        .bind(worker_id.to_string())
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(run_id.to_string())
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Bumps the retry counter between attempts on the same row.
    pub async fn set_retry_count(
        &self,
        run_id: RunId,
        step_id: &str,
        retry_count: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE steps SET retry_count = ? WHERE run_id = ? AND step_id = ?")
            .bind(retry_count)
            .bind(run_id.to_string())
            .bind(step_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes the terminal outcome of a claimed step.
    ///
    /// Only applies while the step is still `running`, so a bulk terminate
    /// that already failed the row wins over a late worker write-back.
    pub async fn finish(
        &self,
        run_id: RunId,
        step_id: &str,
        outcome: &StepOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE steps \
             SET status = ?, stdout = ?, stderr = ?, error = ?, retry_count = ?, \
                 completed_at = ?, duration_ms = ? \
             WHERE run_id = ? AND step_id = ? AND status = 'running'",
        )
        .bind(outcome.status.as_str())
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(&outcome.error)
        .bind(outcome.retry_count)
        .bind(now)
        .bind(outcome.duration_ms)
        .bind(run_id.to_string())
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fails a not-yet-terminal step whose dependency failed.
    pub async fn mark_dependency_failed(
        &self,
        run_id: RunId,
        step_id: &str,
        stderr: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE steps \
             SET status = 'failed', stderr = ?, error = ?, completed_at = ? \
             WHERE run_id = ? AND step_id = ? AND status IN ('pending', 'running')",
        )
        .bind(stderr)
        .bind(stderr)
        .bind(now)
        .bind(run_id.to_string())
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Stores the fields blob posted by a step script, verbatim.
    pub async fn set_fields(
        &self,
        run_id: RunId,
        step_id: &str,
        fields: &JsonValue,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE steps SET fields = ? WHERE run_id = ? AND step_id = ?")
            .bind(fields.to_string())
            .bind(run_id.to_string())
            .bind(step_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Resets one step to pending, clearing every execution and scheduling
    /// field, and re-enqueues it.
    pub async fn reset_to_pending(
        &self,
        run_id: RunId,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE steps \
             SET status = 'pending', retry_count = 0, fields = NULL, error = NULL, \
                 stdout = NULL, stderr = NULL, termination_reason = NULL, \
                 queued_at = ?, claimed_at = NULL, heartbeat_at = NULL, worker_id = NULL, \
                 started_at = NULL, completed_at = NULL, duration_ms = NULL \
             WHERE run_id = ? AND step_id = ?",
        )
        .bind(now)
        .bind(run_id.to_string())
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Resets every non-completed step of a run to pending (resume, retry).
    pub async fn reset_non_completed_by_run(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE steps \
             SET status = 'pending', retry_count = 0, error = NULL, \
                 stdout = NULL, stderr = NULL, termination_reason = NULL, \
                 queued_at = ?, claimed_at = NULL, heartbeat_at = NULL, worker_id = NULL, \
                 started_at = NULL, completed_at = NULL, duration_ms = NULL \
             WHERE run_id = ? AND status != 'completed'",
        )
        .bind(now)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fails every non-terminal step of a run with a termination reason,
    /// clearing scheduling fields.
    pub async fn terminate_by_run(
        &self,
        run_id: RunId,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE steps \
             SET status = 'failed', termination_reason = ?, completed_at = ?, \
                 queued_at = NULL, claimed_at = NULL, heartbeat_at = NULL, worker_id = NULL \
             WHERE run_id = ? AND status IN ('pending', 'running')",
        )
        .bind(reason.as_str())
        .bind(now)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Inserts or reinitialises a step row within a stage-schedule
    /// transaction. Exposed for [`crate::StageRepository::schedule`].
    pub(crate) async fn upsert_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        run_id: RunId,
        stage_id: StageId,
        def: &StepDef,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let depends_on = serde_json::to_string(&def.depends_on)?;
        let env = def.env.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT INTO steps \
                 (run_id, step_id, stage_id, name, status, depends_on, retry_count, \
                  max_retries, env, created_at, queued_at) \
             VALUES (?, ?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?) \
             ON CONFLICT (run_id, step_id) DO UPDATE SET \
                 stage_id = excluded.stage_id, \
                 name = excluded.name, \
                 status = 'pending', \
                 depends_on = excluded.depends_on, \
                 retry_count = 0, \
                 max_retries = excluded.max_retries, \
                 env = excluded.env, \
                 fields = NULL, error = NULL, stdout = NULL, stderr = NULL, \
                 termination_reason = NULL, \
                 queued_at = excluded.queued_at, claimed_at = NULL, heartbeat_at = NULL, \
                 worker_id = NULL, started_at = NULL, completed_at = NULL, duration_ms = NULL",
        )
        .bind(run_id.to_string())
        .bind(&def.id)
        .bind(stage_id.to_string())
        .bind(&def.name)
        .bind(&depends_on)
        .bind(def.max_retries)
        .bind(env)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Returns `(step_id, fields)` for every step of the run that posted
    /// fields.
    pub async fn fields_by_run(
        &self,
        run_id: RunId,
    ) -> Result<Vec<(String, JsonValue)>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT step_id, fields FROM steps \
             WHERE run_id = ? AND fields IS NOT NULL ORDER BY step_id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(step_id, fields)| {
                let value = serde_json::from_str(&fields).map_err(|e| StoreError::Decode {
                    message: format!("invalid fields for step '{step_id}': {e}"),
                })?;
                Ok((step_id, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunRecord;
    use crate::Store;

    async fn seed_stage(store: &Store, defs: &[StepDef]) -> (RunId, StageId) {
        let run = RunRecord::new("flow".to_string(), None, None);
        store.runs().create(&run).await.unwrap();
        let (stage, _) = store
            .stages()
            .schedule(run.id, "build", false, defs)
            .await
            .unwrap();
        (run.id, stage.id)
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
    async fn claim_succeeds_exactly_once() {
        let store = Store::open_in_memory().await.unwrap();
        let (run_id, _) = seed_stage(&store, &[def("a", &[])]).await;

        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        assert!(store.steps().claim(run_id, "a", w1, Utc::now()).await.unwrap());
        assert!(!store.steps().claim(run_id, "a", w2, Utc::now()).await.unwrap());

        let step = store.steps().find(run_id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.worker_id, Some(w1));
        assert!(step.claimed_at.is_some());
        assert!(step.heartbeat_at.is_some());
        assert!(step.started_at.is_some());
    }

    #[tokio::test]
    async fn finish_only_applies_to_running_steps() {
        let store = Store::open_in_memory().await.unwrap();
        let (run_id, _) = seed_stage(&store, &[def("a", &[])]).await;

        let outcome = StepOutcome {
            status: StepStatus::Completed,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            error: None,
            retry_count: 0,
            duration_ms: 5,
        };

        // Not yet claimed: no write.
        assert!(!store.steps().finish(run_id, "a", &outcome, Utc::now()).await.unwrap());

        store
            .steps()
            .claim(run_id, "a", WorkerId::new(), Utc::now())
            .await
            .unwrap();
        assert!(store.steps().finish(run_id, "a", &outcome, Utc::now()).await.unwrap());

        let step = store.steps().find(run_id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.stdout.as_deref(), Some("hi\n"));
        assert_eq!(step.duration_ms, Some(5));
    }

    #[tokio::test]
    async fn terminate_clears_scheduling_fields() {
        let store = Store::open_in_memory().await.unwrap();
        let (run_id, _) = seed_stage(&store, &[def("a", &[]), def("b", &["a"])]).await;

        store
            .steps()
            .claim(run_id, "a", WorkerId::new(), Utc::now())
            .await
            .unwrap();

        let affected = store
            .steps()
            .terminate_by_run(run_id, TerminationReason::Aborted, Utc::now())
            .await
            .unwrap();
        assert_eq!(affected, 2);

        for id in ["a", "b"] {
            let step = store.steps().find(run_id, id).await.unwrap().unwrap();
            assert_eq!(step.status, StepStatus::Failed);
            assert_eq!(step.termination_reason, Some(TerminationReason::Aborted));
            assert!(step.queued_at.is_none());
            assert!(step.claimed_at.is_none());
            assert!(step.worker_id.is_none());
        }
    }

    #[tokio::test]
    async fn reset_non_completed_leaves_completed_steps() {
        let store = Store::open_in_memory().await.unwrap();
        let (run_id, _) = seed_stage(&store, &[def("a", &[]), def("b", &["a"])]).await;

        store
            .steps()
            .claim(run_id, "a", WorkerId::new(), Utc::now())
            .await
            .unwrap();
        store
            .steps()
            .finish(
                run_id,
                "a",
                &StepOutcome {
                    status: StepStatus::Completed,
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
        store
            .steps()
            .terminate_by_run(run_id, TerminationReason::Aborted, Utc::now())
            .await
            .unwrap();

        let affected = store
            .steps()
            .reset_non_completed_by_run(run_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let a = store.steps().find(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.status, StepStatus::Completed);

        let b = store.steps().find(run_id, "b").await.unwrap().unwrap();
        assert_eq!(b.status, StepStatus::Pending);
        assert!(b.termination_reason.is_none());
        assert!(b.queued_at.is_some());
    }

    #[tokio::test]
    async fn fields_stored_verbatim() {
        let store = Store::open_in_memory().await.unwrap();
        let (run_id, _) = seed_stage(&store, &[def("a", &[])]).await;

        let fields = serde_json::json!({"status": "failed", "reason": "x"});
        assert!(store.steps().set_fields(run_id, "a", &fields).await.unwrap());

        let step = store.steps().find(run_id, "a").await.unwrap().unwrap();
        assert_eq!(step.fields, Some(fields.clone()));
        // Fields never drive status.
        assert_eq!(step.status, StepStatus::Pending);

        let all = store.steps().fields_by_run(run_id).await.unwrap();
        assert_eq!(all, vec![("a".to_string(), fields)]);
    }

    #[tokio::test]
    async fn pending_listing_orders_by_queue_time() {
        let store = Store::open_in_memory().await.unwrap();
        let (run_id, _) = seed_stage(&store, &[def("a", &[])]).await;

        // A later stage enqueues a second step with a later queued_at.
        let (_, _) = store
            .stages()
            .schedule(run_id, "later", false, &[def("z", &[])])
            .await
            .unwrap();

        let pending = store.steps().list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].step_id, "a");
        assert_eq!(pending[1].step_id, "z");
    }
}
