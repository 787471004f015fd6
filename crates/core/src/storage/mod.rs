pub mod indicators;
pub mod lock;
pub mod memory;
pub mod recommendations;
pub mod regime;
pub mod scan_runs;

use crate::domain::error::LifecycleError;
use crate::domain::recommendation::{
    CreateOutcome, NewRecommendation, Recommendation, RecommendationStateEvent,
    RecommendationStatus, TransitionRequest,
};
use crate::domain::regime::RegimeSnapshot;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Durable recommendations plus their append-only event log.
///
/// Every mutating call is one transaction: the status change and its event row become visible
/// together or not at all. At most one row per ticker may be open; implementations enforce this
/// with a uniqueness constraint and report a violation as `LifecycleError::OpenConflict`.
#[async_trait::async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn create_or_replace(
        &self,
        new: &NewRecommendation,
        at: DateTime<Utc>,
    ) -> Result<CreateOutcome, LifecycleError>;

    async fn transition(&self, req: &TransitionRequest) -> Result<Recommendation, LifecycleError>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Recommendation>>;

    async fn find_open_by_ticker(&self, ticker: &str) -> anyhow::Result<Option<Recommendation>>;

    async fn list_by_status(
        &self,
        statuses: &[RecommendationStatus],
    ) -> anyhow::Result<Vec<Recommendation>>;

    async fn list_by_anchor_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<Recommendation>>;

    async fn events_for(&self, id: Uuid) -> anyhow::Result<Vec<RecommendationStateEvent>>;
}

/// Regime snapshots keyed by (date, version). Writes overwrite; they never append.
#[async_trait::async_trait]
pub trait RegimeStore: Send + Sync {
    async fn upsert(&self, snapshot: &RegimeSnapshot) -> anyhow::Result<()>;

    async fn get(&self, as_of_date: NaiveDate, version: &str)
        -> anyhow::Result<Option<RegimeSnapshot>>;
}
