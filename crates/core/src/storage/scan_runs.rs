use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// One row per worker run, written whether the run succeeded or not.
#[derive(Debug, Clone)]
pub struct ScanRunRecord {
    pub as_of_date: NaiveDate,
    pub version: String,
    pub mode: String,
    pub regime: Option<String>,
    pub chosen_stage: Option<i32>,
    pub selected: i32,
    pub created: i32,
    pub replaced: i32,
    pub failed: i32,
    pub outcome: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub async fn record_scan_run(pool: &sqlx::PgPool, run: &ScanRunRecord) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO scan_runs (id, as_of_date, version, mode, regime, chosen_stage, selected, \
         created, replaced, failed, outcome, error, started_at, finished_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .persistent(false)
    .bind(id)
    .bind(run.as_of_date)
    .bind(&run.version)
    .bind(&run.mode)
    .bind(&run.regime)
    .bind(run.chosen_stage)
    .bind(run.selected)
    .bind(run.created)
    .bind(run.replaced)
    .bind(run.failed)
    .bind(&run.outcome)
    .bind(&run.error)
    .bind(run.started_at)
    .bind(run.finished_at)
    .execute(pool)
    .await
    .context("insert scan_runs failed")?;

    Ok(id)
}
