use crate::domain::error::LifecycleError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationStatus {
    Active,
    WeakWarning,
    Broken,
    Archived,
    Replaced,
}

impl RecommendationStatus {
    pub const ALL: [RecommendationStatus; 5] = [
        RecommendationStatus::Active,
        RecommendationStatus::WeakWarning,
        RecommendationStatus::Broken,
        RecommendationStatus::Archived,
        RecommendationStatus::Replaced,
    ];

    pub const OPEN: [RecommendationStatus; 2] =
        [RecommendationStatus::Active, RecommendationStatus::WeakWarning];

    pub fn as_str(self) -> &'static str {
        match self {
            RecommendationStatus::Active => "ACTIVE",
            RecommendationStatus::WeakWarning => "WEAK_WARNING",
            RecommendationStatus::Broken => "BROKEN",
            RecommendationStatus::Archived => "ARCHIVED",
            RecommendationStatus::Replaced => "REPLACED",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(
            self,
            RecommendationStatus::Active | RecommendationStatus::WeakWarning
        )
    }

    /// The complete transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, to: RecommendationStatus) -> bool {
        use RecommendationStatus::*;
        matches!(
            (self, to),
            (Active, WeakWarning)
                | (Active, Broken)
                | (Active, Replaced)
                | (Active, Archived)
                | (WeakWarning, Broken)
                | (WeakWarning, Replaced)
                | (WeakWarning, Archived)
                | (Broken, Archived)
        )
    }
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecommendationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown recommendation status: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Created,
    NewSignal,
    WeakMomentum,
    StopLoss,
    ThesisBreak,
    TtlExpired,
    PostBrokenClose,
    Manual,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Created => "CREATED",
            ReasonCode::NewSignal => "NEW_SIGNAL",
            ReasonCode::WeakMomentum => "WEAK_MOMENTUM",
            ReasonCode::StopLoss => "STOP_LOSS",
            ReasonCode::ThesisBreak => "THESIS_BREAK",
            ReasonCode::TtlExpired => "TTL_EXPIRED",
            ReasonCode::PostBrokenClose => "POST_BROKEN_CLOSE",
            ReasonCode::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable "instrument X is actionable" record. `anchor_date`/`anchor_close` are write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub ticker: String,
    pub anchor_date: NaiveDate,
    pub anchor_close: f64,
    pub status: RecommendationStatus,
    pub strategy: String,
    pub stage: Option<i32>,
    pub score: f64,
    pub score_label: String,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub broken_at: Option<DateTime<Utc>>,
    /// Market as-of date the BROKEN snapshot was taken for; the post-broken cooldown runs from it.
    pub broken_on: Option<NaiveDate>,
    pub broken_price: Option<f64>,
    pub broken_return_pct: Option<f64>,
    pub archive_price: Option<f64>,
    pub archive_return_pct: Option<f64>,
    pub archive_phase: Option<String>,
    pub archive_reason: Option<String>,
    pub replaces: Option<Uuid>,
    pub replaced_by: Option<Uuid>,
}

impl Recommendation {
    /// A fresh ACTIVE row for an accepted signal.
    pub fn open(new: &NewRecommendation, id: Uuid, replaces: Option<Uuid>, at: DateTime<Utc>) -> Self {
        Self {
            id,
            ticker: new.ticker.trim().to_string(),
            anchor_date: new.anchor_date,
            anchor_close: new.anchor_close,
            status: RecommendationStatus::Active,
            strategy: new.strategy.clone(),
            stage: new.stage,
            score: new.score,
            score_label: new.score_label.clone(),
            created_at: at,
            status_changed_at: at,
            broken_at: None,
            broken_on: None,
            broken_price: None,
            broken_return_pct: None,
            archive_price: None,
            archive_return_pct: None,
            archive_phase: None,
            archive_reason: None,
            replaces,
            replaced_by: None,
        }
    }

    /// Percent return of `price` against the frozen anchor close.
    pub fn return_pct_at(&self, price: f64) -> f64 {
        return_pct(self.anchor_close, price)
    }

    /// Event recording the creation of this row.
    pub fn created_event(&self, reason_code: ReasonCode, reason_text: Option<String>) -> RecommendationStateEvent {
        RecommendationStateEvent {
            id: Uuid::new_v4(),
            recommendation_id: self.id,
            from_status: None,
            to_status: self.status,
            reason_code,
            reason_text,
            occurred_at: self.created_at,
        }
    }

    /// Apply a transition in place and return the event that must be written with it.
    ///
    /// Closure snapshots are write-once: a BROKEN or ARCHIVED snapshot that is already set is
    /// never overwritten, and archiving a BROKEN row keeps the BROKEN price and return whatever
    /// the request carries. A REPLACED transition requires `replaced_by` to be set first.
    pub fn apply(&mut self, req: &TransitionRequest) -> Result<RecommendationStateEvent, LifecycleError> {
        let from = self.status;
        if !from.can_transition_to(req.to) {
            return Err(LifecycleError::InvalidTransition {
                id: self.id,
                from,
                to: req.to,
            });
        }

        match req.to {
            RecommendationStatus::Broken => {
                let snap = require_snapshot(self.id, req)?;
                if self.broken_at.is_none() {
                    self.broken_at = Some(req.at);
                    self.broken_on = Some(snap.as_of_date);
                    self.broken_price = Some(snap.price);
                    self.broken_return_pct = Some(snap.return_pct);
                }
            }
            RecommendationStatus::Archived => {
                let snap = require_snapshot(self.id, req)?;
                if self.archive_return_pct.is_none() {
                    match (from, self.broken_price, self.broken_return_pct) {
                        (RecommendationStatus::Broken, Some(price), Some(ret)) => {
                            self.archive_price = Some(price);
                            self.archive_return_pct = Some(ret);
                            self.archive_phase = Some(from.as_str().to_string());
                        }
                        _ => {
                            self.archive_price = Some(snap.price);
                            self.archive_return_pct = Some(snap.return_pct);
                            self.archive_phase = Some(snap.phase.clone());
                        }
                    }
                    self.archive_reason = Some(snap.reason.clone());
                }
            }
            RecommendationStatus::Replaced => {
                if self.replaced_by.is_none() {
                    return Err(LifecycleError::InvalidInput {
                        reason: format!("recommendation {} cannot be REPLACED without a successor", self.id),
                    });
                }
            }
            RecommendationStatus::Active | RecommendationStatus::WeakWarning => {}
        }

        self.status = req.to;
        self.status_changed_at = req.at;

        Ok(RecommendationStateEvent {
            id: Uuid::new_v4(),
            recommendation_id: self.id,
            from_status: Some(from),
            to_status: req.to,
            reason_code: req.reason_code,
            reason_text: req.reason_text.clone(),
            occurred_at: req.at,
        })
    }
}

fn require_snapshot(id: Uuid, req: &TransitionRequest) -> Result<&ClosureSnapshot, LifecycleError> {
    let snap = req.snapshot.as_ref().ok_or_else(|| LifecycleError::InvalidInput {
        reason: format!("{} transition for {id} requires a closure snapshot", req.to),
    })?;
    if !snap.price.is_finite() || !snap.return_pct.is_finite() {
        return Err(LifecycleError::InvalidInput {
            reason: format!("closure snapshot for {id} is not finite"),
        });
    }
    Ok(snap)
}

pub fn return_pct(anchor_close: f64, price: f64) -> f64 {
    if anchor_close <= 0.0 || !anchor_close.is_finite() || !price.is_finite() {
        return 0.0;
    }
    (price - anchor_close) / anchor_close * 100.0
}

/// Input for `create_or_replace`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecommendation {
    pub ticker: String,
    pub anchor_date: NaiveDate,
    pub anchor_close: f64,
    pub strategy: String,
    pub stage: Option<i32>,
    pub score: f64,
    pub score_label: String,
    pub reason_code: ReasonCode,
    pub reason_text: Option<String>,
}

impl NewRecommendation {
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.ticker.trim().is_empty() {
            return Err(LifecycleError::InvalidInput {
                reason: "ticker must be non-empty".to_string(),
            });
        }
        if !self.anchor_close.is_finite() || self.anchor_close <= 0.0 {
            return Err(LifecycleError::InvalidInput {
                reason: format!("anchor_close must be positive (got {})", self.anchor_close),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { id: Uuid },
    Replaced { id: Uuid, replaced_id: Uuid },
    /// An open recommendation for the same or a later anchor date already exists.
    Unchanged { id: Uuid },
}

impl CreateOutcome {
    pub fn id(&self) -> Uuid {
        match *self {
            CreateOutcome::Created { id }
            | CreateOutcome::Replaced { id, .. }
            | CreateOutcome::Unchanged { id } => id,
        }
    }
}

/// Price/return/phase frozen at the moment of a closing transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureSnapshot {
    pub as_of_date: NaiveDate,
    pub price: f64,
    pub return_pct: f64,
    pub phase: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub id: Uuid,
    pub to: RecommendationStatus,
    pub reason_code: ReasonCode,
    pub reason_text: Option<String>,
    pub snapshot: Option<ClosureSnapshot>,
    pub at: DateTime<Utc>,
}

impl TransitionRequest {
    /// Supersede an open row; the caller must have linked `replaced_by` already.
    pub fn replace(id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            id,
            to: RecommendationStatus::Replaced,
            reason_code: ReasonCode::NewSignal,
            reason_text: None,
            snapshot: None,
            at,
        }
    }
}

/// Append-only audit row; one per transition, including creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationStateEvent {
    pub id: Uuid,
    pub recommendation_id: Uuid,
    pub from_status: Option<RecommendationStatus>,
    pub to_status: RecommendationStatus,
    pub reason_code: ReasonCode,
    pub reason_text: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use RecommendationStatus::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for to in RecommendationStatus::ALL {
            assert!(!Archived.can_transition_to(to));
            assert!(!Replaced.can_transition_to(to));
        }
    }

    #[test]
    fn broken_only_moves_to_archived() {
        let allowed: Vec<_> = RecommendationStatus::ALL
            .into_iter()
            .filter(|to| Broken.can_transition_to(*to))
            .collect();
        assert_eq!(allowed, vec![Archived]);
    }

    #[test]
    fn weak_warning_cannot_recover_to_active() {
        assert!(!WeakWarning.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
        assert!(WeakWarning.can_transition_to(Broken));
    }

    #[test]
    fn open_statuses() {
        let open: Vec<_> = RecommendationStatus::ALL
            .into_iter()
            .filter(|s| s.is_open())
            .collect();
        assert_eq!(open, RecommendationStatus::OPEN.to_vec());
    }

    #[test]
    fn status_text_round_trip() {
        for s in RecommendationStatus::ALL {
            assert_eq!(s.as_str().parse::<RecommendationStatus>().unwrap(), s);
        }
        assert!("active".parse::<RecommendationStatus>().is_err());
    }

    fn sample() -> Recommendation {
        let new = NewRecommendation {
            ticker: " X ".to_string(),
            anchor_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            anchor_close: 100.0,
            strategy: "trend_momentum".to_string(),
            stage: Some(0),
            score: 11.0,
            score_label: "strong".to_string(),
            reason_code: ReasonCode::Created,
            reason_text: None,
        };
        Recommendation::open(&new, Uuid::new_v4(), None, Utc::now())
    }

    fn req(to: RecommendationStatus, price: Option<f64>) -> TransitionRequest {
        TransitionRequest {
            id: Uuid::nil(),
            to,
            reason_code: ReasonCode::Manual,
            reason_text: None,
            snapshot: price.map(|p| ClosureSnapshot {
                as_of_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
                price: p,
                return_pct: return_pct(100.0, p),
                phase: "TEST".to_string(),
                reason: "test".to_string(),
            }),
            at: Utc::now(),
        }
    }

    #[test]
    fn open_trims_ticker_and_starts_active() {
        let r = sample();
        assert_eq!(r.ticker, "X");
        assert_eq!(r.status, Active);
        let ev = r.created_event(ReasonCode::Created, None);
        assert_eq!(ev.from_status, None);
        assert_eq!(ev.to_status, Active);
    }

    #[test]
    fn apply_rejects_edges_outside_the_table() {
        let mut r = sample();
        r.apply(&req(Broken, Some(90.0))).unwrap();
        let err = r.apply(&req(WeakWarning, None)).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { from: Broken, to: WeakWarning, .. }));
        assert_eq!(r.status, Broken);
    }

    #[test]
    fn closing_transitions_require_a_snapshot() {
        let mut r = sample();
        assert!(matches!(
            r.apply(&req(Archived, None)),
            Err(LifecycleError::InvalidInput { .. })
        ));
        assert_eq!(r.status, Active);
    }

    #[test]
    fn replaced_requires_successor_link() {
        let mut r = sample();
        assert!(r.apply(&req(Replaced, None)).is_err());
        r.replaced_by = Some(Uuid::new_v4());
        let ev = r.apply(&req(Replaced, None)).unwrap();
        assert_eq!(ev.from_status, Some(Active));
        assert_eq!(ev.to_status, Replaced);
    }

    #[test]
    fn archive_snapshot_is_frozen() {
        let mut r = sample();
        r.apply(&req(Archived, Some(120.0))).unwrap();
        let frozen = r.archive_return_pct.unwrap();
        assert!((frozen - 20.0).abs() < 1e-9);

        // Even a forced re-application cannot move the frozen snapshot.
        r.status = Active;
        r.apply(&req(Archived, Some(50.0))).unwrap();
        assert_eq!(r.archive_return_pct, Some(frozen));
        assert_eq!(r.archive_price, Some(120.0));
    }

    #[test]
    fn archiving_a_broken_row_keeps_the_broken_snapshot() {
        let mut r = sample();
        r.apply(&req(Broken, Some(90.0))).unwrap();
        assert_eq!(r.broken_on, NaiveDate::from_ymd_opt(2025, 1, 10));

        // The request was priced before the row went BROKEN.
        r.apply(&req(Archived, Some(130.0))).unwrap();
        assert_eq!(r.archive_price, Some(90.0));
        assert_eq!(r.archive_return_pct, r.broken_return_pct);
        assert_eq!(r.archive_phase.as_deref(), Some("BROKEN"));
    }

    #[test]
    fn return_is_measured_against_anchor() {
        assert!((return_pct(100.0, 110.0) - 10.0).abs() < 1e-9);
        assert!((return_pct(100.0, 93.0) + 7.0).abs() < 1e-9);
        assert!((return_pct(100.0, 120.0) - 20.0).abs() < 1e-9);
        assert_eq!(return_pct(0.0, 93.0), 0.0);
    }
}
