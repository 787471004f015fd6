use crate::domain::recommendation::RecommendationStatus;
use uuid::Uuid;

/// Errors surfaced by the recommendation store and lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid transition for recommendation {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: RecommendationStatus,
        to: RecommendationStatus,
    },

    /// The partial unique index on open recommendations rejected a write.
    #[error("open recommendation conflict for ticker {ticker} (existing: {existing:?})")]
    OpenConflict {
        ticker: String,
        existing: Option<Uuid>,
    },

    #[error("recommendation {id} not found")]
    NotFound { id: Uuid },

    #[error("invalid recommendation input: {reason}")]
    InvalidInput { reason: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Recommendation the operator should inspect in the audit trail, if any.
    pub fn recommendation_id(&self) -> Option<Uuid> {
        match self {
            LifecycleError::InvalidTransition { id, .. } | LifecycleError::NotFound { id } => {
                Some(*id)
            }
            LifecycleError::OpenConflict { existing, .. } => *existing,
            LifecycleError::InvalidInput { .. } | LifecycleError::Storage(_) => None,
        }
    }
}

/// An upstream input was missing, flagged invalid, or failed after retries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{input} unavailable: {reason}")]
pub struct DataUnavailable {
    pub input: &'static str,
    pub reason: String,
}

impl DataUnavailable {
    pub fn new(input: &'static str, reason: impl Into<String>) -> Self {
        Self {
            input,
            reason: reason.into(),
        }
    }
}

/// One stage, or one instrument within a stage, could not be evaluated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stage {stage} evaluation failed{}: {detail}", ticker_suffix(.ticker))]
pub struct StageEvaluationFailure {
    pub stage: usize,
    pub ticker: Option<String>,
    pub detail: String,
}

fn ticker_suffix(ticker: &Option<String>) -> String {
    ticker
        .as_deref()
        .map(|t| format!(" for {t}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_carries_id() {
        let id = Uuid::new_v4();
        let err = LifecycleError::InvalidTransition {
            id,
            from: RecommendationStatus::Archived,
            to: RecommendationStatus::Active,
        };
        assert_eq!(err.recommendation_id(), Some(id));
        assert!(err.to_string().contains("ARCHIVED -> ACTIVE"));
    }

    #[test]
    fn stage_failure_message_names_ticker() {
        let err = StageEvaluationFailure {
            stage: 2,
            ticker: Some("KRX:000001".to_string()),
            detail: "panicked".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "stage 2 evaluation failed for KRX:000001: panicked"
        );
    }
}
