//! Run session persistence
//!
//! A run record is created before the first stage, receives one outcome per
//! stage and is sealed by `finish_run`. Sealed records reject further writes.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use super::outcome::{RunRecord, RunStatus, StageOutcome};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} does not exist")]
    UnknownRun(i64),

    #[error("run {0} is already finished")]
    Finalized(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run store lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run session and return its monotonic id
    async fn begin_run(&self, pipeline: &str) -> Result<i64, StoreError>;

    async fn record_stage(&self, run_id: i64, outcome: &StageOutcome) -> Result<(), StoreError>;

    /// Seal the run with its terminal status and aggregate artifact list
    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        artifacts: &[PathBuf],
    ) -> Result<(), StoreError>;
}

/// Process-local store, used when no run store URL is configured
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    next_id: AtomicI64,
    runs: Mutex<BTreeMap<i64, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: i64) -> Option<RunRecord> {
        self.runs.lock().ok()?.get(&run_id).cloned()
    }

    fn with_open_run<T>(
        &self,
        run_id: i64,
        f: impl FnOnce(&mut RunRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut runs = self.runs.lock().map_err(|_| StoreError::Poisoned)?;
        let run = runs.get_mut(&run_id).ok_or(StoreError::UnknownRun(run_id))?;
        if run.finished_at.is_some() {
            return Err(StoreError::Finalized(run_id));
        }
        Ok(f(run))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn begin_run(&self, pipeline: &str) -> Result<i64, StoreError> {
        let run_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = RunRecord {
            run_id,
            pipeline: pipeline.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::new(),
            artifacts: Vec::new(),
        };
        self.runs
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(run_id, record);
        Ok(run_id)
    }

    async fn record_stage(&self, run_id: i64, outcome: &StageOutcome) -> Result<(), StoreError> {
        self.with_open_run(run_id, |run| run.stages.push(outcome.clone()))
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        artifacts: &[PathBuf],
    ) -> Result<(), StoreError> {
        self.with_open_run(run_id, |run| {
            run.status = status;
            run.artifacts = artifacts.to_vec();
            run.finished_at = Some(Utc::now());
        })
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS etl_runs (
        id BIGSERIAL PRIMARY KEY,
        pipeline TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        finished_at TIMESTAMPTZ,
        artifacts JSONB NOT NULL DEFAULT '[]'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS etl_stage_results (
        id BIGSERIAL PRIMARY KEY,
        run_id BIGINT NOT NULL REFERENCES etl_runs(id),
        stage_index INTEGER NOT NULL,
        stage_name TEXT NOT NULL,
        transform TEXT NOT NULL,
        status TEXT NOT NULL,
        failed_in TEXT,
        error TEXT,
        sink_errors JSONB NOT NULL DEFAULT '[]'::jsonb,
        provider_errors JSONB NOT NULL DEFAULT '[]'::jsonb,
        artifacts JSONB NOT NULL DEFAULT '[]'::jsonb,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ
    )
    "#,
];

/// PostgreSQL-backed store (`etl_runs`, `etl_stage_results`)
#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Connect and create the tables when missing
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = crate::db::create_pool(url, 2).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_open(&self, run_id: i64) -> Result<(), StoreError> {
        let finished: Option<Option<chrono::DateTime<Utc>>> =
            sqlx::query_scalar("SELECT finished_at FROM etl_runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        match finished {
            None => Err(StoreError::UnknownRun(run_id)),
            Some(Some(_)) => Err(StoreError::Finalized(run_id)),
            Some(None) => Ok(()),
        }
    }
}

fn paths_json(paths: &[PathBuf]) -> Json<Vec<String>> {
    Json(paths.iter().map(|p| p.display().to_string()).collect())
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn begin_run(&self, pipeline: &str) -> Result<i64, StoreError> {
        let run_id: i64 =
            sqlx::query_scalar("INSERT INTO etl_runs (pipeline, status) VALUES ($1, $2) RETURNING id")
                .bind(pipeline)
                .bind(RunStatus::Running.as_str())
                .fetch_one(&self.pool)
                .await?;
        debug!(run_id, pipeline, "Run session created");
        Ok(run_id)
    }

    async fn record_stage(&self, run_id: i64, outcome: &StageOutcome) -> Result<(), StoreError> {
        self.ensure_open(run_id).await?;
        sqlx::query(
            r#"
            INSERT INTO etl_stage_results (
                run_id, stage_index, stage_name, transform, status, failed_in, error,
                sink_errors, provider_errors, artifacts, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run_id)
        .bind(outcome.index as i32)
        .bind(&outcome.name)
        .bind(&outcome.transform)
        .bind(outcome.status.as_str())
        .bind(outcome.failed_in.as_ref().map(|s| s.as_str().to_string()))
        .bind(outcome.error.as_deref())
        .bind(Json(&outcome.sink_errors))
        .bind(Json(&outcome.provider_errors))
        .bind(paths_json(&outcome.artifacts))
        .bind(outcome.started_at)
        .bind(outcome.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        artifacts: &[PathBuf],
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE etl_runs
            SET status = $1, artifacts = $2, finished_at = NOW()
            WHERE id = $3 AND finished_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(paths_json(artifacts))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_open(run_id).await?;
        }
        Ok(())
    }
}
