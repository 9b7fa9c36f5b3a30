//! Chronological run logs.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use maxq_core::{RunId, RunLogId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

/// The entity a log line is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntityType {
    Run,
    Stage,
    Step,
}

impl LogEntityType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Stage => "stage",
            Self::Step => "step",
        }
    }

    /// Parses a user-supplied entity type.
    ///
    /// # Errors
    ///
    /// Returns the offending value when it names no known entity type.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "run" => Ok(Self::Run),
            "stage" => Ok(Self::Stage),
            "step" => Ok(Self::Step),
            other => Err(other.to_string()),
        }
    }
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parses a user-supplied level.
    ///
    /// # Errors
    ///
    /// Returns the offending value when it names no known level.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(other.to_string()),
        }
    }
}

/// A run log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogRecord {
    /// Log ID.
    pub id: RunLogId,
    /// Owning run.
    pub run_id: RunId,
    /// Entity kind the line refers to.
    pub entity_type: LogEntityType,
    /// Entity id within the run (stage id, step id).
    pub entity_id: Option<String>,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Structured payload.
    pub metadata: Option<JsonValue>,
    /// When recorded.
    pub created_at: DateTime<Utc>,
}

impl RunLogRecord {
    /// Creates a new log record stamped now.
    #[must_use]
    pub fn new(
        run_id: RunId,
        entity_type: LogEntityType,
        entity_id: Option<String>,
        level: LogLevel,
        message: String,
        metadata: Option<JsonValue>,
    ) -> Self {
        Self {
            id: RunLogId::new(),
            run_id,
            entity_type,
            entity_id,
            level,
            message,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Filters for log listings.
#[derive(Debug, Clone, Default)]
pub struct RunLogFilter {
    pub entity_type: Option<LogEntityType>,
    pub entity_id: Option<String>,
    pub level: Option<LogLevel>,
    pub limit: Option<i64>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
}

/// Row type for log queries.
#[derive(FromRow)]
struct RunLogRow {
    id: String,
    run_id: String,
    entity_type: String,
    entity_id: Option<String>,
    level: String,
    message: String,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
}

impl RunLogRow {
    fn try_into_record(self) -> Result<RunLogRecord, StoreError> {
        let id = RunLogId::from_str(&self.id).map_err(|e| StoreError::Decode {
            message: format!("invalid log id '{}': {e}", self.id),
        })?;
        let run_id = RunId::from_str(&self.run_id).map_err(|e| StoreError::Decode {
            message: format!("invalid run id '{}': {e}", self.run_id),
        })?;
        let metadata: Option<JsonValue> = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Decode {
                message: format!("invalid metadata in log '{}': {e}", self.id),
            })?;

        Ok(RunLogRecord {
            id,
            run_id,
            entity_type: LogEntityType::parse(&self.entity_type)
                .unwrap_or(LogEntityType::Run),
            entity_id: self.entity_id,
            level: LogLevel::parse(&self.level).unwrap_or(LogLevel::Info),
            message: self.message,
            metadata,
            created_at: self.created_at,
        })
    }
}

/// Repository for run-log operations.
pub struct RunLogRepository {
    pool: SqlitePool,
}

impl RunLogRepository {
    /// Creates a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a log line.
    pub async fn create(&self, log: &RunLogRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO run_logs \
                 (id, run_id, entity_type, entity_id, level, message, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.id.to_string())
        .bind(log.run_id.to_string())
        .bind(log.entity_type.as_str())
        .bind(&log.entity_id)
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(log.metadata.as_ref().map(std::string::ToString::to_string))
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists a run's logs, oldest first, with optional filters.
    pub async fn list(
        &self,
        run_id: RunId,
        filter: &RunLogFilter,
    ) -> Result<Vec<RunLogRecord>, StoreError> {
        let mut clauses = vec!["run_id = ?".to_string()];
        if filter.entity_type.is_some() {
            clauses.push("entity_type = ?".to_string());
        }
        if filter.entity_id.is_some() {
            clauses.push("entity_id = ?".to_string());
        }
        if filter.level.is_some() {
            clauses.push("level = ?".to_string());
        }
        if filter.before.is_some() {
            clauses.push("created_at < ?".to_string());
        }
        if filter.after.is_some() {
            clauses.push("created_at > ?".to_string());
        }

        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let sql = format!(
            "SELECT id, run_id, entity_type, entity_id, level, message, metadata, created_at \
             FROM run_logs WHERE {} ORDER BY created_at ASC LIMIT ?",
            clauses.join(" AND ")
        );

        let mut query = sqlx::query_as::<_, RunLogRow>(&sql).bind(run_id.to_string());
        if let Some(entity_type) = filter.entity_type {
            query = query.bind(entity_type.as_str());
        }
        if let Some(entity_id) = &filter.entity_id {
            query = query.bind(entity_id);
        }
        if let Some(level) = filter.level {
            query = query.bind(level.as_str());
        }
        if let Some(before) = filter.before {
            query = query.bind(before);
        }
        if let Some(after) = filter.after {
            query = query.bind(after);
        }

        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(RunLogRow::try_into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunRecord;
    use crate::Store;

    #[tokio::test]
    async fn create_and_list_logs() {
        let store = Store::open_in_memory().await.unwrap();
        let run = RunRecord::new("flow".to_string(), None, None);
        store.runs().create(&run).await.unwrap();

        for (level, message) in [
            (LogLevel::Info, "starting"),
            (LogLevel::Error, "boom"),
            (LogLevel::Info, "done"),
        ] {
            let log = RunLogRecord::new(
                run.id,
                LogEntityType::Run,
                None,
                level,
                message.to_string(),
                None,
            );
            store.run_logs().create(&log).await.unwrap();
        }

        let all = store
            .run_logs()
            .list(run.id, &RunLogFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "starting");

        let errors = store
            .run_logs()
            .list(
                run.id,
                &RunLogFilter {
                    level: Some(LogLevel::Error),
                    ..RunLogFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");
    }

    #[tokio::test]
    async fn entity_filter_scopes_to_step() {
        let store = Store::open_in_memory().await.unwrap();
        let run = RunRecord::new("flow".to_string(), None, None);
        store.runs().create(&run).await.unwrap();

        let step_log = RunLogRecord::new(
            run.id,
            LogEntityType::Step,
            Some("extract".to_string()),
            LogLevel::Debug,
            "step detail".to_string(),
            Some(serde_json::json!({"rows": 10})),
        );
        store.run_logs().create(&step_log).await.unwrap();
        let run_log = RunLogRecord::new(
            run.id,
            LogEntityType::Run,
            None,
            LogLevel::Info,
            "run detail".to_string(),
            None,
        );
        store.run_logs().create(&run_log).await.unwrap();

        let scoped = store
            .run_logs()
            .list(
                run.id,
                &RunLogFilter {
                    entity_type: Some(LogEntityType::Step),
                    entity_id: Some("extract".to_string()),
                    ..RunLogFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].metadata, Some(serde_json::json!({"rows": 10})));
    }
}
