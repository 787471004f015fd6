//! Recommendation lifecycle: issuance from accepted candidates, daily review, and closure.
//!
//! All persistence goes through a [`RecommendationStore`]; the manager adds the retry on
//! uniqueness conflicts, the closure policy and the snapshot rules on top of it.

pub mod policy;

use crate::domain::error::LifecycleError;
use crate::domain::indicator::IndicatorSnapshot;
use crate::domain::recommendation::{
    return_pct, ClosureSnapshot, CreateOutcome, NewRecommendation, ReasonCode, Recommendation,
    RecommendationStateEvent, RecommendationStatus, TransitionRequest,
};
use crate::domain::regime::Regime;
use crate::domain::signal::CandidateSignal;
use crate::storage::RecommendationStore;
use crate::time::market_calendar::MarketCalendar;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub use policy::{Decision, LifecyclePolicy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateSummary {
    pub created: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewSummary {
    pub reviewed: usize,
    pub weakened: usize,
    pub broken: usize,
    pub archived: usize,
    /// Open recommendations without a usable quote for the as-of date.
    pub missing_quote: usize,
    pub failed: usize,
}

pub struct LifecycleManager {
    store: Arc<dyn RecommendationStore>,
    policy: LifecyclePolicy,
    calendar: MarketCalendar,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        policy: LifecyclePolicy,
        calendar: MarketCalendar,
    ) -> Self {
        Self {
            store,
            policy,
            calendar,
        }
    }

    /// Create (or replace the open row for) one ticker. A uniqueness conflict is retried once;
    /// the retry re-reads the open row and takes the replace path.
    pub async fn create_or_replace(
        &self,
        new: &NewRecommendation,
        at: DateTime<Utc>,
    ) -> Result<CreateOutcome, LifecycleError> {
        match self.store.create_or_replace(new, at).await {
            Err(LifecycleError::OpenConflict { ticker, existing }) => {
                tracing::warn!(
                    %ticker,
                    existing = ?existing,
                    "open recommendation conflict; retrying via replace path"
                );
                let retried = self.store.create_or_replace(new, at).await;
                if let Err(err @ LifecycleError::OpenConflict { .. }) = &retried {
                    tracing::error!(
                        ticker = %new.ticker,
                        recommendation_id = ?err.recommendation_id(),
                        error = %err,
                        "open recommendation conflict persisted after retry; candidate dropped"
                    );
                }
                retried
            }
            other => other,
        }
    }

    /// Persist accepted candidates. Individual failures are logged and counted, never fatal.
    pub async fn create_from_candidates(
        &self,
        signals: &[CandidateSignal],
        regime: Regime,
        at: DateTime<Utc>,
    ) -> CreateSummary {
        let mut summary = CreateSummary::default();

        for sig in signals {
            let Some(new) = new_from_signal(sig, regime) else {
                tracing::warn!(ticker = %sig.ticker, "candidate has no usable close; skipped");
                summary.failed += 1;
                continue;
            };

            match self.create_or_replace(&new, at).await {
                Ok(CreateOutcome::Created { id }) => {
                    tracing::info!(ticker = %new.ticker, %id, "recommendation created");
                    summary.created += 1;
                }
                Ok(CreateOutcome::Replaced { id, replaced_id }) => {
                    tracing::info!(ticker = %new.ticker, %id, %replaced_id, "recommendation replaced");
                    summary.replaced += 1;
                }
                Ok(CreateOutcome::Unchanged { id }) => {
                    tracing::debug!(ticker = %new.ticker, %id, "open recommendation already current");
                    summary.unchanged += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        ticker = %new.ticker,
                        recommendation_id = ?err.recommendation_id(),
                        error = %err,
                        "create recommendation failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Move one recommendation along the state table.
    ///
    /// `price` is required for BROKEN and ARCHIVED; the return is measured against the frozen
    /// anchor. `as_of_date` is the market date the price belongs to, which may lie in the past
    /// when a date is replayed. Archiving a BROKEN recommendation reuses its BROKEN price and return.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition_status(
        &self,
        id: Uuid,
        to: RecommendationStatus,
        reason_code: ReasonCode,
        reason_text: Option<String>,
        price: Option<f64>,
        as_of_date: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Recommendation, LifecycleError> {
        let current = self
            .store
            .get(id)
            .await?
            .ok_or(LifecycleError::NotFound { id })?;

        if !current.status.can_transition_to(to) {
            let err = LifecycleError::InvalidTransition {
                id,
                from: current.status,
                to,
            };
            tracing::warn!(recommendation_id = %id, error = %err, "transition rejected");
            return Err(err);
        }

        let snapshot = match to {
            RecommendationStatus::Broken | RecommendationStatus::Archived => {
                Some(closure_snapshot(&current, to, reason_code, price, as_of_date)?)
            }
            _ => None,
        };

        let req = TransitionRequest {
            id,
            to,
            reason_code,
            reason_text,
            snapshot,
            at,
        };
        let updated = self.store.transition(&req).await.inspect_err(|err| {
            tracing::warn!(recommendation_id = %id, error = %err, "transition failed");
        })?;

        tracing::info!(
            recommendation_id = %id,
            ticker = %updated.ticker,
            from = %current.status,
            to = %to,
            reason = %reason_code,
            "recommendation transitioned"
        );
        Ok(updated)
    }

    /// Apply the closure policy to every open recommendation using the as-of quotes.
    pub async fn review_open(
        &self,
        as_of_date: NaiveDate,
        quotes: &HashMap<String, IndicatorSnapshot>,
        at: DateTime<Utc>,
    ) -> anyhow::Result<ReviewSummary> {
        let open = self.store.list_by_status(&RecommendationStatus::OPEN).await?;
        let mut summary = ReviewSummary::default();

        for rec in open {
            summary.reviewed += 1;
            let Some(quote) = quotes.get(&rec.ticker).filter(|q| q.as_of_date == as_of_date) else {
                tracing::debug!(ticker = %rec.ticker, %as_of_date, "no quote; recommendation left untouched");
                summary.missing_quote += 1;
                continue;
            };

            let held = self.calendar.business_days_between(rec.anchor_date, as_of_date);
            let result = match self.policy.decide(&rec, quote, held) {
                Decision::Hold => continue,
                Decision::Weaken => self
                    .transition_status(
                        rec.id,
                        RecommendationStatus::WeakWarning,
                        ReasonCode::WeakMomentum,
                        None,
                        None,
                        as_of_date,
                        at,
                    )
                    .await
                    .map(|_| summary.weakened += 1),
                Decision::Expire { price } => self
                    .transition_status(
                        rec.id,
                        RecommendationStatus::Archived,
                        ReasonCode::TtlExpired,
                        Some(format!("held {held} business days")),
                        Some(price),
                        as_of_date,
                        at,
                    )
                    .await
                    .map(|_| summary.archived += 1),
                Decision::Break { reason, price } => {
                    match self
                        .transition_status(rec.id, RecommendationStatus::Broken, reason, None, Some(price), as_of_date, at)
                        .await
                    {
                        Ok(_) => {
                            summary.broken += 1;
                            if self.policy.broken_cooldown_days == 0 {
                                self.transition_status(
                                    rec.id,
                                    RecommendationStatus::Archived,
                                    ReasonCode::PostBrokenClose,
                                    None,
                                    None,
                                    as_of_date,
                                    at,
                                )
                                .await
                                .map(|_| summary.archived += 1)
                            } else {
                                Ok(())
                            }
                        }
                        Err(err) => Err(err),
                    }
                }
            };

            if result.is_err() {
                summary.failed += 1;
            }
        }

        tracing::info!(
            %as_of_date,
            reviewed = summary.reviewed,
            weakened = summary.weakened,
            broken = summary.broken,
            archived = summary.archived,
            missing_quote = summary.missing_quote,
            failed = summary.failed,
            "open recommendations reviewed"
        );
        Ok(summary)
    }

    /// Archive BROKEN recommendations whose cooldown has elapsed by `as_of_date`.
    ///
    /// The cooldown counts business days from the as-of date of the BROKEN snapshot, so replays
    /// of past dates close rows on the same schedule as live runs.
    pub async fn close_broken(&self, as_of_date: NaiveDate, at: DateTime<Utc>) -> anyhow::Result<usize> {
        let broken = self.store.list_by_status(&[RecommendationStatus::Broken]).await?;
        let mut closed = 0;

        for rec in broken {
            let broken_on = rec
                .broken_on
                .or_else(|| rec.broken_at.map(|t| self.calendar.market_date(t)))
                .unwrap_or(rec.anchor_date);
            if broken_on > as_of_date
                || self.calendar.business_days_between(broken_on, as_of_date) < self.policy.broken_cooldown_days
            {
                continue;
            }

            match self
                .transition_status(
                    rec.id,
                    RecommendationStatus::Archived,
                    ReasonCode::PostBrokenClose,
                    None,
                    None,
                    as_of_date,
                    at,
                )
                .await
            {
                Ok(_) => closed += 1,
                Err(err) => {
                    tracing::warn!(recommendation_id = %rec.id, error = %err, "post-broken close failed");
                }
            }
        }

        Ok(closed)
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<Recommendation>> {
        self.store.get(id).await
    }

    pub async fn find_open_by_ticker(&self, ticker: &str) -> anyhow::Result<Option<Recommendation>> {
        self.store.find_open_by_ticker(ticker).await
    }

    pub async fn list_by_status(&self, statuses: &[RecommendationStatus]) -> anyhow::Result<Vec<Recommendation>> {
        self.store.list_by_status(statuses).await
    }

    pub async fn list_by_anchor_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<Recommendation>> {
        self.store.list_by_anchor_date_range(from, to).await
    }

    pub async fn events_for(&self, id: Uuid) -> anyhow::Result<Vec<RecommendationStateEvent>> {
        self.store.events_for(id).await
    }
}

fn new_from_signal(sig: &CandidateSignal, regime: Regime) -> Option<NewRecommendation> {
    let close = sig.close.filter(|c| c.is_finite() && *c > 0.0)?;
    Some(NewRecommendation {
        ticker: sig.ticker.clone(),
        anchor_date: sig.as_of_date,
        anchor_close: close,
        strategy: sig.strategy.clone(),
        stage: i32::try_from(sig.stage).ok(),
        score: sig.score,
        score_label: sig.score_label.clone(),
        reason_code: ReasonCode::Created,
        reason_text: Some(format!("stage {} under {regime} regime", sig.stage)),
    })
}

fn closure_snapshot(
    rec: &Recommendation,
    to: RecommendationStatus,
    reason_code: ReasonCode,
    price: Option<f64>,
    as_of_date: NaiveDate,
) -> Result<ClosureSnapshot, LifecycleError> {
    // The BROKEN snapshot wins over any later price when a broken row is archived.
    if to == RecommendationStatus::Archived && rec.status == RecommendationStatus::Broken {
        if let (Some(price), Some(ret)) = (rec.broken_price, rec.broken_return_pct) {
            return Ok(ClosureSnapshot {
                as_of_date,
                price,
                return_pct: ret,
                phase: rec.status.as_str().to_string(),
                reason: reason_code.as_str().to_string(),
            });
        }
    }

    let price = price
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| LifecycleError::InvalidInput {
            reason: format!("{to} transition for {} requires a positive price", rec.id),
        })?;

    Ok(ClosureSnapshot {
        as_of_date,
        price,
        return_pct: return_pct(rec.anchor_close, price),
        phase: rec.status.as_str().to_string(),
        reason: reason_code.as_str().to_string(),
    })
}
