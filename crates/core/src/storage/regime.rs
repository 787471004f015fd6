use crate::domain::regime::RegimeSnapshot;
use crate::storage::RegimeStore;
use anyhow::Context;
use chrono::NaiveDate;

/// `regime_snapshots` keeps the headline columns for querying and the full snapshot as JSON.
#[derive(Clone)]
pub struct PgRegimeStore {
    pool: sqlx::PgPool,
}

impl PgRegimeStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RegimeStore for PgRegimeStore {
    async fn upsert(&self, snapshot: &RegimeSnapshot) -> anyhow::Result<()> {
        let payload = serde_json::to_value(snapshot).context("serialize regime snapshot failed")?;

        sqlx::query(
            "INSERT INTO regime_snapshots (as_of_date, version, mode, final_regime, final_score, \
             local_score, external_score, preopen_score, degraded, payload, computed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (as_of_date, version) DO UPDATE SET \
             mode = EXCLUDED.mode, final_regime = EXCLUDED.final_regime, \
             final_score = EXCLUDED.final_score, local_score = EXCLUDED.local_score, \
             external_score = EXCLUDED.external_score, preopen_score = EXCLUDED.preopen_score, \
             degraded = EXCLUDED.degraded, payload = EXCLUDED.payload, \
             computed_at = EXCLUDED.computed_at",
        )
        .persistent(false)
        .bind(snapshot.as_of_date)
        .bind(&snapshot.version)
        .bind(snapshot.mode.as_str())
        .bind(snapshot.final_regime.as_str())
        .bind(snapshot.final_score)
        .bind(snapshot.local.total)
        .bind(snapshot.external.total)
        .bind(snapshot.preopen.score)
        .bind(&snapshot.degraded)
        .bind(payload)
        .bind(snapshot.computed_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "upsert regime_snapshots failed (as_of_date={}, version={})",
                snapshot.as_of_date, snapshot.version
            )
        })?;

        Ok(())
    }

    async fn get(
        &self,
        as_of_date: NaiveDate,
        version: &str,
    ) -> anyhow::Result<Option<RegimeSnapshot>> {
        let payload: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT payload FROM regime_snapshots WHERE as_of_date = $1 AND version = $2",
        )
        .persistent(false)
        .bind(as_of_date)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("select regime_snapshots failed")?;

        payload
            .map(|v| serde_json::from_value(v).context("decode regime snapshot payload failed"))
            .transpose()
    }
}
