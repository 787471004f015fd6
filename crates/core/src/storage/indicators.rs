use crate::domain::indicator::{json_to_field_map, IndicatorSnapshot};
use crate::ingest::provider::IndicatorProvider;
use crate::ingest::types::{IndicatorRecord, UniverseEntry};
use anyhow::Context;
use chrono::NaiveDate;
use serde_json::Value;

/// Reads the daily indicator table written by the upstream indicator job.
#[derive(Clone)]
pub struct PgIndicatorProvider {
    pool: sqlx::PgPool,
}

impl PgIndicatorProvider {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    ticker: String,
    close: Option<f64>,
    volume: Option<f64>,
    trading_value: Option<f64>,
    fields: Value,
}

impl SnapshotRow {
    fn into_snapshot(self, as_of_date: NaiveDate) -> IndicatorSnapshot {
        let fields = json_to_field_map(self.fields);
        let mut snap = IndicatorSnapshot::from_fields(self.ticker, as_of_date, &fields);
        // Column values win over duplicates inside the JSON map.
        snap.close = self.close.filter(|v| v.is_finite()).or(snap.close);
        snap.volume = self.volume.filter(|v| v.is_finite()).or(snap.volume);
        snap.trading_value = self.trading_value.filter(|v| v.is_finite()).or(snap.trading_value);
        snap
    }
}

#[async_trait::async_trait]
impl IndicatorProvider for PgIndicatorProvider {
    fn provider_name(&self) -> &'static str {
        "pg"
    }

    async fn list_universe(&self, as_of_date: NaiveDate) -> anyhow::Result<Vec<UniverseEntry>> {
        let rows: Vec<(String, String, Option<f64>, Option<f64>, Option<f64>)> = sqlx::query_as(
            "SELECT ticker, name, close, volume, trading_value \
             FROM indicator_snapshots_daily \
             WHERE as_of_date = $1 \
             ORDER BY trading_value DESC NULLS LAST, ticker ASC",
        )
        .persistent(false)
        .bind(as_of_date)
        .fetch_all(&self.pool)
        .await
        .context("select universe from indicator_snapshots_daily failed")?;

        Ok(rows
            .into_iter()
            .map(|(ticker, name, close, volume, trading_value)| UniverseEntry {
                ticker,
                name,
                close,
                volume,
                trading_value,
            })
            .collect())
    }

    async fn get_indicator_snapshot(
        &self,
        ticker: &str,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<Option<IndicatorSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT ticker, close, volume, trading_value, fields \
             FROM indicator_snapshots_daily \
             WHERE as_of_date = $1 AND ticker = $2",
        )
        .persistent(false)
        .bind(as_of_date)
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("select indicator snapshot failed (ticker={ticker})"))?;

        Ok(row.map(|r| r.into_snapshot(as_of_date)))
    }
}

/// Load one day of indicator records atomically. Existing rows for the same
/// (date, ticker) are overwritten.
pub async fn upsert_indicator_snapshots(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    items: &[IndicatorRecord],
) -> anyhow::Result<u64> {
    anyhow::ensure!(!items.is_empty(), "items must be non-empty");

    let chunk_size: usize = crate::config::env_or("INDICATOR_UPSERT_BATCH", 200);
    anyhow::ensure!(chunk_size >= 1, "INDICATOR_UPSERT_BATCH must be >= 1");

    let mut encoded = Vec::with_capacity(items.len());
    for item in items {
        let fields = serde_json::to_value(&item.fields)
            .with_context(|| format!("encode indicator fields failed (ticker={})", item.ticker))?;
        encoded.push((item, fields));
    }

    let mut tx = pool.begin().await.context("begin transaction failed")?;
    let mut affected: u64 = 0;

    for (batch_idx, chunk) in encoded.chunks(chunk_size).enumerate() {
        let t0 = std::time::Instant::now();
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO indicator_snapshots_daily \
             (as_of_date, ticker, name, close, volume, trading_value, fields) ",
        );
        qb.push_values(chunk, |mut b, (item, fields)| {
            b.push_bind(as_of_date)
                .push_bind(item.ticker.trim())
                .push_bind(item.name.trim())
                .push_bind(item.close)
                .push_bind(item.volume)
                .push_bind(item.trading_value)
                .push_bind(fields.clone());
        });
        qb.push(
            " ON CONFLICT (as_of_date, ticker) DO UPDATE \
               SET name = EXCLUDED.name, close = EXCLUDED.close, volume = EXCLUDED.volume, \
               trading_value = EXCLUDED.trading_value, fields = EXCLUDED.fields",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut *tx)
            .await
            .context("batch upsert indicator_snapshots_daily failed")?;
        affected += res.rows_affected();

        tracing::debug!(
            %as_of_date,
            batch_idx,
            batch_size = chunk.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "indicator_snapshots_daily batch upsert"
        );
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn column_values_override_json_duplicates() {
        let row = SnapshotRow {
            ticker: "KRX:005930".to_string(),
            close: Some(71000.0),
            volume: None,
            trading_value: Some(f64::NAN),
            fields: json!({"close": 1.0, "volume": 500.0, "trading_value": 9.0, "rsi": 61.5}),
        };
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let snap = row.into_snapshot(date);
        assert_eq!(snap.close, Some(71000.0));
        assert_eq!(snap.volume, Some(500.0));
        assert_eq!(snap.trading_value, Some(9.0));
        assert_eq!(snap.rsi, Some(61.5));
        assert_eq!(snap.as_of_date, date);
    }
}
