//! In-process stores with the same transactional and uniqueness semantics as the Postgres ones.
//! Used for dry runs and tests.

use crate::domain::error::LifecycleError;
use crate::domain::recommendation::{
    CreateOutcome, NewRecommendation, Recommendation, RecommendationStateEvent,
    RecommendationStatus, TransitionRequest,
};
use crate::domain::regime::RegimeSnapshot;
use crate::storage::{RecommendationStore, RegimeStore};
use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct State {
    rows: BTreeMap<Uuid, Recommendation>,
    events: Vec<RecommendationStateEvent>,
}

impl State {
    fn open_for(&self, ticker: &str) -> Option<&Recommendation> {
        self.rows
            .values()
            .find(|r| r.ticker == ticker && r.status.is_open())
    }

    /// Emulates the partial unique index on `ticker WHERE status IN (open)`.
    fn check_unique(&self, row: &Recommendation) -> Result<(), LifecycleError> {
        if !row.status.is_open() {
            return Ok(());
        }
        match self
            .rows
            .values()
            .find(|r| r.id != row.id && r.ticker == row.ticker && r.status.is_open())
        {
            Some(existing) => Err(LifecycleError::OpenConflict {
                ticker: row.ticker.clone(),
                existing: Some(existing.id),
            }),
            None => Ok(()),
        }
    }

    fn write(&mut self, row: Recommendation) -> Result<(), LifecycleError> {
        self.check_unique(&row)?;
        self.rows.insert(row.id, row);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecommendationStore {
    state: Mutex<State>,
    // Tickers for which the next create is beaten to the insert by another writer.
    pending_races: Mutex<HashMap<String, NewRecommendation>>,
}

impl MemoryRecommendationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from rows read elsewhere, such as the live rows a dry run reviews.
    pub fn seeded(rows: impl IntoIterator<Item = Recommendation>) -> Self {
        Self {
            state: Mutex::new(State {
                rows: rows.into_iter().map(|r| (r.id, r)).collect(),
                events: Vec::new(),
            }),
            pending_races: Mutex::default(),
        }
    }

    /// Make the next `create_or_replace` for `competitor.ticker` lose a race: another writer
    /// commits `competitor` between this writer's open-row check and its insert.
    pub fn race_next_create(&self, competitor: NewRecommendation) {
        if let Ok(mut races) = self.pending_races.lock() {
            races.insert(competitor.ticker.trim().to_string(), competitor);
        }
    }

    /// Snapshot of every row, for invariant checks.
    pub fn all(&self) -> Vec<Recommendation> {
        self.state
            .lock()
            .map(|s| s.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_events(&self) -> Vec<RecommendationStateEvent> {
        self.state
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory recommendation store poisoned"))
    }

    fn take_race(&self, ticker: &str) -> Option<NewRecommendation> {
        self.pending_races.lock().ok()?.remove(ticker)
    }
}

#[async_trait::async_trait]
impl RecommendationStore for MemoryRecommendationStore {
    async fn create_or_replace(
        &self,
        new: &NewRecommendation,
        at: DateTime<Utc>,
    ) -> Result<CreateOutcome, LifecycleError> {
        new.validate()?;
        let ticker = new.ticker.trim().to_string();
        let mut guard = self.lock()?;

        // Work on a copy; only a fully successful sequence is committed.
        let mut tx = guard.clone();
        let existing = tx.open_for(&ticker).cloned();

        if let Some(existing) = &existing {
            if existing.anchor_date >= new.anchor_date {
                return Ok(CreateOutcome::Unchanged { id: existing.id });
            }
        }

        if let Some(competitor) = self.take_race(&ticker) {
            // The other writer saw the same state we did and committed first.
            let mut theirs = tx.clone();
            let id = Uuid::new_v4();
            let row = Recommendation::open(&competitor, id, existing.as_ref().map(|e| e.id), at);
            if let Some(old) = &existing {
                let mut old = old.clone();
                old.replaced_by = Some(id);
                let ev = old.apply(&TransitionRequest::replace(old.id, at))?;
                theirs.events.push(ev);
                theirs.write(old)?;
            }
            theirs.events.push(row.created_event(competitor.reason_code, competitor.reason_text.clone()));
            theirs.write(row)?;
            *guard = theirs;
            let existing_id = guard.open_for(&ticker).map(|r| r.id);
            return Err(LifecycleError::OpenConflict {
                ticker,
                existing: existing_id,
            });
        }

        let id = Uuid::new_v4();
        let replaced_id = match existing {
            Some(mut old) => {
                old.replaced_by = Some(id);
                let ev = old.apply(&TransitionRequest::replace(old.id, at))?;
                let old_id = old.id;
                tx.events.push(ev);
                tx.write(old)?;
                Some(old_id)
            }
            None => None,
        };

        let row = Recommendation::open(new, id, replaced_id, at);
        tx.events
            .push(row.created_event(new.reason_code, new.reason_text.clone()));
        tx.write(row)?;

        *guard = tx;
        Ok(match replaced_id {
            Some(replaced_id) => CreateOutcome::Replaced { id, replaced_id },
            None => CreateOutcome::Created { id },
        })
    }

    async fn transition(&self, req: &TransitionRequest) -> Result<Recommendation, LifecycleError> {
        let mut guard = self.lock()?;
        let mut tx = guard.clone();

        let mut row = tx
            .rows
            .get(&req.id)
            .cloned()
            .ok_or(LifecycleError::NotFound { id: req.id })?;
        let ev = row.apply(req)?;
        tx.events.push(ev);
        tx.write(row.clone())?;

        *guard = tx;
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Recommendation>> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    async fn find_open_by_ticker(&self, ticker: &str) -> anyhow::Result<Option<Recommendation>> {
        Ok(self.lock()?.open_for(ticker.trim()).cloned())
    }

    async fn list_by_status(
        &self,
        statuses: &[RecommendationStatus],
    ) -> anyhow::Result<Vec<Recommendation>> {
        let mut out: Vec<_> = self
            .lock()?
            .rows
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.anchor_date.cmp(&b.anchor_date).then_with(|| a.ticker.cmp(&b.ticker)));
        Ok(out)
    }

    async fn list_by_anchor_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<Recommendation>> {
        let mut out: Vec<_> = self
            .lock()?
            .rows
            .values()
            .filter(|r| r.anchor_date >= from && r.anchor_date <= to)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.anchor_date.cmp(&b.anchor_date).then_with(|| a.ticker.cmp(&b.ticker)));
        Ok(out)
    }

    async fn events_for(&self, id: Uuid) -> anyhow::Result<Vec<RecommendationStateEvent>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.recommendation_id == id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRegimeStore {
    rows: Mutex<BTreeMap<(NaiveDate, String), RegimeSnapshot>>,
}

impl MemoryRegimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(snapshots: impl IntoIterator<Item = RegimeSnapshot>) -> Self {
        Self {
            rows: Mutex::new(
                snapshots
                    .into_iter()
                    .map(|s| ((s.as_of_date, s.version.clone()), s))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl RegimeStore for MemoryRegimeStore {
    async fn upsert(&self, snapshot: &RegimeSnapshot) -> anyhow::Result<()> {
        self.rows
            .lock()
            .map_err(|_| anyhow!("memory regime store poisoned"))?
            .insert(
                (snapshot.as_of_date, snapshot.version.clone()),
                snapshot.clone(),
            );
        Ok(())
    }

    async fn get(
        &self,
        as_of_date: NaiveDate,
        version: &str,
    ) -> anyhow::Result<Option<RegimeSnapshot>> {
        Ok(self
            .rows
            .lock()
            .map_err(|_| anyhow!("memory regime store poisoned"))?
            .get(&(as_of_date, version.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::{ClosureSnapshot, ReasonCode};

    fn new_rec(ticker: &str, day: u32, close: f64) -> NewRecommendation {
        NewRecommendation {
            ticker: ticker.to_string(),
            anchor_date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            anchor_close: close,
            strategy: "trend_momentum".to_string(),
            stage: Some(0),
            score: 10.5,
            score_label: "moderate".to_string(),
            reason_code: ReasonCode::Created,
            reason_text: None,
        }
    }

    #[tokio::test]
    async fn unique_index_rejects_a_second_open_row() {
        let store = MemoryRecommendationStore::new();
        store.create_or_replace(&new_rec("X", 1, 100.0), Utc::now()).await.unwrap();

        let mut state = store.lock().unwrap();
        let dup = Recommendation::open(&new_rec("X", 2, 101.0), Uuid::new_v4(), None, Utc::now());
        let err = state.write(dup).unwrap_err();
        assert!(matches!(err, LifecycleError::OpenConflict { .. }));
        assert_eq!(state.rows.len(), 1);
    }

    #[tokio::test]
    async fn failed_transition_leaves_no_partial_writes() {
        let store = MemoryRecommendationStore::new();
        let id = store
            .create_or_replace(&new_rec("X", 1, 100.0), Utc::now())
            .await
            .unwrap()
            .id();

        let err = store
            .transition(&TransitionRequest {
                id,
                to: RecommendationStatus::Archived,
                reason_code: ReasonCode::TtlExpired,
                reason_text: None,
                snapshot: None,
                at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidInput { .. }));
        assert_eq!(store.get(id).await.unwrap().unwrap().status, RecommendationStatus::Active);
        assert_eq!(store.events_for(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn race_commits_competitor_and_reports_conflict() {
        let store = MemoryRecommendationStore::new();
        store.race_next_create(new_rec("X", 3, 105.0));

        let err = store
            .create_or_replace(&new_rec("X", 3, 105.0), Utc::now())
            .await
            .unwrap_err();
        let LifecycleError::OpenConflict { existing, .. } = err else {
            panic!("expected conflict, got {err:?}");
        };
        let open = store.find_open_by_ticker("X").await.unwrap().unwrap();
        assert_eq!(existing, Some(open.id));
        assert_eq!(store.all().len(), 1);
    }

    #[tokio::test]
    async fn transition_unknown_id_is_not_found() {
        let store = MemoryRecommendationStore::new();
        let id = Uuid::new_v4();
        let err = store
            .transition(&TransitionRequest {
                id,
                to: RecommendationStatus::Broken,
                reason_code: ReasonCode::StopLoss,
                reason_text: None,
                snapshot: Some(ClosureSnapshot {
                    as_of_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
                    price: 90.0,
                    return_pct: -10.0,
                    phase: "ACTIVE".to_string(),
                    reason: "STOP_LOSS".to_string(),
                }),
                at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.recommendation_id(), Some(id));
    }

    #[tokio::test]
    async fn regime_upsert_overwrites_by_key() {
        use crate::domain::regime::{EvalMode, Regime};

        let store = MemoryRegimeStore::new();
        let mut snap = RegimeSnapshot {
            as_of_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            version: "v1".to_string(),
            mode: EvalMode::Live,
            local: Default::default(),
            external: Default::default(),
            preopen: Default::default(),
            final_regime: Regime::Neutral,
            final_score: 0.0,
            degraded: vec![],
            computed_at: Utc::now(),
        };
        store.upsert(&snap).await.unwrap();
        snap.final_regime = Regime::Bear;
        store.upsert(&snap).await.unwrap();

        assert_eq!(store.len(), 1);
        let got = store.get(snap.as_of_date, "v1").await.unwrap().unwrap();
        assert_eq!(got.final_regime, Regime::Bear);

        let seeded = MemoryRegimeStore::seeded([got.clone()]);
        assert_eq!(seeded.get(got.as_of_date, "v1").await.unwrap(), Some(got.clone()));
        assert_eq!(seeded.get(got.as_of_date, "v2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn seeded_rows_drive_replace_and_unchanged() {
        let live = Recommendation::open(&new_rec("X", 5, 100.0), Uuid::new_v4(), None, Utc::now());
        let store = MemoryRecommendationStore::seeded([live.clone()]);

        let same = store.create_or_replace(&new_rec("X", 5, 100.0), Utc::now()).await.unwrap();
        assert_eq!(same, CreateOutcome::Unchanged { id: live.id });

        let newer = store.create_or_replace(&new_rec("X", 9, 104.0), Utc::now()).await.unwrap();
        let CreateOutcome::Replaced { replaced_id, .. } = newer else {
            panic!("expected replace, got {newer:?}");
        };
        assert_eq!(replaced_id, live.id);
        assert_eq!(store.list_by_status(&RecommendationStatus::OPEN).await.unwrap().len(), 1);
    }
}
