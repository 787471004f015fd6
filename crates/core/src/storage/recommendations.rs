use crate::domain::error::LifecycleError;
use crate::domain::recommendation::{
    CreateOutcome, NewRecommendation, ReasonCode, Recommendation, RecommendationStateEvent,
    RecommendationStatus, TransitionRequest,
};
use crate::storage::RecommendationStore;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "id, ticker, anchor_date, anchor_close, status, strategy, stage, score, \
     score_label, created_at, status_changed_at, broken_at, broken_on, broken_price, broken_return_pct, \
     archive_price, archive_return_pct, archive_phase, archive_reason, replaces, replaced_by";

#[derive(Debug, sqlx::FromRow)]
struct RecommendationRow {
    id: Uuid,
    ticker: String,
    anchor_date: NaiveDate,
    anchor_close: f64,
    status: String,
    strategy: String,
    stage: Option<i32>,
    score: f64,
    score_label: String,
    created_at: DateTime<Utc>,
    status_changed_at: DateTime<Utc>,
    broken_at: Option<DateTime<Utc>>,
    broken_on: Option<NaiveDate>,
    broken_price: Option<f64>,
    broken_return_pct: Option<f64>,
    archive_price: Option<f64>,
    archive_return_pct: Option<f64>,
    archive_phase: Option<String>,
    archive_reason: Option<String>,
    replaces: Option<Uuid>,
    replaced_by: Option<Uuid>,
}

impl TryFrom<RecommendationRow> for Recommendation {
    type Error = anyhow::Error;

    fn try_from(r: RecommendationRow) -> anyhow::Result<Self> {
        Ok(Recommendation {
            status: r
                .status
                .parse()
                .with_context(|| format!("recommendation {} has bad status", r.id))?,
            id: r.id,
            ticker: r.ticker,
            anchor_date: r.anchor_date,
            anchor_close: r.anchor_close,
            strategy: r.strategy,
            stage: r.stage,
            score: r.score,
            score_label: r.score_label,
            created_at: r.created_at,
            status_changed_at: r.status_changed_at,
            broken_at: r.broken_at,
            broken_on: r.broken_on,
            broken_price: r.broken_price,
            broken_return_pct: r.broken_return_pct,
            archive_price: r.archive_price,
            archive_return_pct: r.archive_return_pct,
            archive_phase: r.archive_phase,
            archive_reason: r.archive_reason,
            replaces: r.replaces,
            replaced_by: r.replaced_by,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    recommendation_id: Uuid,
    from_status: Option<String>,
    to_status: String,
    reason_code: String,
    reason_text: Option<String>,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for RecommendationStateEvent {
    type Error = anyhow::Error;

    fn try_from(r: EventRow) -> anyhow::Result<Self> {
        let reason_code: ReasonCode =
            serde_json::from_value(serde_json::Value::String(r.reason_code.clone()))
                .with_context(|| format!("unknown reason code {}", r.reason_code))?;
        Ok(RecommendationStateEvent {
            id: r.id,
            recommendation_id: r.recommendation_id,
            from_status: r.from_status.as_deref().map(str::parse).transpose()?,
            to_status: r.to_status.parse()?,
            reason_code,
            reason_text: r.reason_text,
            occurred_at: r.occurred_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[derive(Clone)]
pub struct PgRecommendationStore {
    pool: sqlx::PgPool,
}

impl PgRecommendationStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

async fn lock_open_by_ticker(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ticker: &str,
) -> anyhow::Result<Option<Recommendation>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM recommendations \
         WHERE ticker = $1 AND status IN ('ACTIVE', 'WEAK_WARNING') FOR UPDATE"
    );
    let row: Option<RecommendationRow> = sqlx::query_as(&sql)
        .persistent(false)
        .bind(ticker)
        .fetch_optional(&mut **tx)
        .await
        .context("select open recommendation failed")?;
    row.map(Recommendation::try_from).transpose()
}

/// Write every mutable column, guarded by the status the change was computed from.
async fn update_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    rec: &Recommendation,
    expected: RecommendationStatus,
) -> Result<(), LifecycleError> {
    let res = sqlx::query(
        "UPDATE recommendations SET status = $3, status_changed_at = $4, broken_at = $5, \
         broken_price = $6, broken_return_pct = $7, archive_price = $8, archive_return_pct = $9, \
         archive_phase = $10, archive_reason = $11, replaced_by = $12, broken_on = $13 \
         WHERE id = $1 AND status = $2",
    )
    .persistent(false)
    .bind(rec.id)
    .bind(expected.as_str())
    .bind(rec.status.as_str())
    .bind(rec.status_changed_at)
    .bind(rec.broken_at)
    .bind(rec.broken_price)
    .bind(rec.broken_return_pct)
    .bind(rec.archive_price)
    .bind(rec.archive_return_pct)
    .bind(&rec.archive_phase)
    .bind(&rec.archive_reason)
    .bind(rec.replaced_by)
    .bind(rec.broken_on)
    .execute(&mut **tx)
    .await
    .context("update recommendations failed")?;

    if res.rows_affected() != 1 {
        return Err(LifecycleError::InvalidTransition {
            id: rec.id,
            from: expected,
            to: rec.status,
        });
    }
    Ok(())
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    rec: &Recommendation,
) -> Result<(), LifecycleError> {
    let res = sqlx::query(
        "INSERT INTO recommendations (id, ticker, anchor_date, anchor_close, status, strategy, stage, \
         score, score_label, created_at, status_changed_at, replaces) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .persistent(false)
    .bind(rec.id)
    .bind(&rec.ticker)
    .bind(rec.anchor_date)
    .bind(rec.anchor_close)
    .bind(rec.status.as_str())
    .bind(&rec.strategy)
    .bind(rec.stage)
    .bind(rec.score)
    .bind(&rec.score_label)
    .bind(rec.created_at)
    .bind(rec.status_changed_at)
    .bind(rec.replaces)
    .execute(&mut **tx)
    .await;

    match res {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(LifecycleError::OpenConflict {
            ticker: rec.ticker.clone(),
            existing: None,
        }),
        Err(e) => Err(anyhow::Error::new(e)
            .context("insert recommendations failed")
            .into()),
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ev: &RecommendationStateEvent,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO recommendation_state_events \
         (id, recommendation_id, from_status, to_status, reason_code, reason_text, occurred_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .persistent(false)
    .bind(ev.id)
    .bind(ev.recommendation_id)
    .bind(ev.from_status.map(|s| s.as_str()))
    .bind(ev.to_status.as_str())
    .bind(ev.reason_code.as_str())
    .bind(&ev.reason_text)
    .bind(ev.occurred_at)
    .execute(&mut **tx)
    .await
    .context("insert recommendation_state_events failed")?;
    Ok(())
}

#[async_trait::async_trait]
impl RecommendationStore for PgRecommendationStore {
    async fn create_or_replace(
        &self,
        new: &NewRecommendation,
        at: DateTime<Utc>,
    ) -> Result<CreateOutcome, LifecycleError> {
        new.validate()?;
        let ticker = new.ticker.trim();

        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let existing = lock_open_by_ticker(&mut tx, ticker).await?;
        if let Some(existing) = &existing {
            if existing.anchor_date >= new.anchor_date {
                tx.rollback().await.context("rollback failed")?;
                return Ok(CreateOutcome::Unchanged { id: existing.id });
            }
        }

        let id = Uuid::new_v4();
        let replaced_id = match existing {
            Some(mut old) => {
                let from = old.status;
                old.replaced_by = Some(id);
                let ev = old.apply(&TransitionRequest::replace(old.id, at))?;
                update_row(&mut tx, &old, from).await?;
                insert_event(&mut tx, &ev).await?;
                Some(old.id)
            }
            None => None,
        };

        let row = Recommendation::open(new, id, replaced_id, at);
        match insert_row(&mut tx, &row).await {
            Ok(()) => {}
            Err(LifecycleError::OpenConflict { ticker, .. }) => {
                // Another writer committed an open row for this ticker first.
                drop(tx);
                let existing = self.find_open_by_ticker(&ticker).await?.map(|r| r.id);
                return Err(LifecycleError::OpenConflict { ticker, existing });
            }
            Err(e) => return Err(e),
        }
        insert_event(&mut tx, &row.created_event(new.reason_code, new.reason_text.clone())).await?;

        tx.commit().await.context("commit transaction failed")?;

        Ok(match replaced_id {
            Some(replaced_id) => CreateOutcome::Replaced { id, replaced_id },
            None => CreateOutcome::Created { id },
        })
    }

    async fn transition(&self, req: &TransitionRequest) -> Result<Recommendation, LifecycleError> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let sql = format!("SELECT {SELECT_COLUMNS} FROM recommendations WHERE id = $1 FOR UPDATE");
        let row: Option<RecommendationRow> = sqlx::query_as(&sql)
            .persistent(false)
            .bind(req.id)
            .fetch_optional(&mut *tx)
            .await
            .context("select recommendation failed")?;
        let mut rec = match row {
            Some(r) => Recommendation::try_from(r)?,
            None => return Err(LifecycleError::NotFound { id: req.id }),
        };

        let from = rec.status;
        let ev = rec.apply(req)?;
        update_row(&mut tx, &rec, from).await?;
        insert_event(&mut tx, &ev).await?;

        tx.commit().await.context("commit transaction failed")?;
        Ok(rec)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Recommendation>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM recommendations WHERE id = $1");
        let row: Option<RecommendationRow> = sqlx::query_as(&sql)
            .persistent(false)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("select recommendation failed")?;
        row.map(Recommendation::try_from).transpose()
    }

    async fn find_open_by_ticker(&self, ticker: &str) -> anyhow::Result<Option<Recommendation>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM recommendations \
             WHERE ticker = $1 AND status IN ('ACTIVE', 'WEAK_WARNING')"
        );
        let row: Option<RecommendationRow> = sqlx::query_as(&sql)
            .persistent(false)
            .bind(ticker.trim())
            .fetch_optional(&self.pool)
            .await
            .context("select open recommendation failed")?;
        row.map(Recommendation::try_from).transpose()
    }

    async fn list_by_status(
        &self,
        statuses: &[RecommendationStatus],
    ) -> anyhow::Result<Vec<Recommendation>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM recommendations \
             WHERE status = ANY($1) ORDER BY anchor_date, ticker"
        );
        let rows: Vec<RecommendationRow> = sqlx::query_as(&sql)
            .persistent(false)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await
            .context("list recommendations by status failed")?;
        rows.into_iter().map(Recommendation::try_from).collect()
    }

    async fn list_by_anchor_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<Recommendation>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM recommendations \
             WHERE anchor_date BETWEEN $1 AND $2 ORDER BY anchor_date, ticker"
        );
        let rows: Vec<RecommendationRow> = sqlx::query_as(&sql)
            .persistent(false)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .context("list recommendations by anchor date failed")?;
        rows.into_iter().map(Recommendation::try_from).collect()
    }

    async fn events_for(&self, id: Uuid) -> anyhow::Result<Vec<RecommendationStateEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, recommendation_id, from_status, to_status, reason_code, reason_text, occurred_at \
             FROM recommendation_state_events WHERE recommendation_id = $1 ORDER BY occurred_at, id",
        )
        .persistent(false)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("select recommendation_state_events failed")?;
        rows.into_iter().map(RecommendationStateEvent::try_from).collect()
    }
}
