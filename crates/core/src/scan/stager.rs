use crate::domain::error::StageEvaluationFailure;
use crate::domain::indicator::IndicatorSnapshot;
use crate::domain::preset::{ScanConfig, TargetRange, ThresholdSet};
use crate::domain::regime::Regime;
use crate::domain::signal::CandidateSignal;
use crate::ingest::provider::IndicatorProvider;
use crate::ingest::types::UniverseEntry;
use crate::scan::evaluator::SignalEvaluator;
use chrono::NaiveDate;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy)]
pub struct StagerOptions {
    /// Budget for fetching one instrument's snapshot; exceeding it counts as no match.
    pub instrument_timeout: Duration,
    pub fetch_concurrency: usize,
}

impl Default for StagerOptions {
    fn default() -> Self {
        Self {
            instrument_timeout: Duration::from_millis(2_000),
            fetch_concurrency: 8,
        }
    }
}

impl StagerOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            instrument_timeout: Duration::from_millis(crate::config::env_or(
                "SCAN_INSTRUMENT_TIMEOUT_MS",
                d.instrument_timeout.as_millis() as u64,
            )),
            fetch_concurrency: crate::config::env_or("SCAN_FETCH_CONCURRENCY", d.fetch_concurrency).max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub selected: Vec<CandidateSignal>,
    pub chosen_stage: Option<usize>,
    /// `None` when the regime disables scanning.
    pub target: Option<TargetRange>,
    /// Accepted-candidate count per evaluated stage, in order.
    pub stage_counts: Vec<usize>,
    /// Instruments that survived the hard filter and had a snapshot.
    pub eligible: usize,
    pub failures: usize,
}

impl StageOutcome {
    pub fn is_disabled(&self) -> bool {
        self.target.is_none()
    }

    fn disabled() -> Self {
        Self {
            selected: Vec::new(),
            chosen_stage: None,
            target: None,
            stage_counts: Vec::new(),
            eligible: 0,
            failures: 0,
        }
    }
}

/// Walks the configured stages from strictest to widest and stops at the first one whose
/// accepted count reaches the regime's target minimum.
pub struct FallbackStager {
    provider: Arc<dyn IndicatorProvider>,
    evaluator: Arc<dyn SignalEvaluator>,
    cfg: ScanConfig,
    opts: StagerOptions,
}

impl FallbackStager {
    pub fn new(
        provider: Arc<dyn IndicatorProvider>,
        evaluator: Arc<dyn SignalEvaluator>,
        cfg: ScanConfig,
        opts: StagerOptions,
    ) -> Self {
        Self {
            provider,
            evaluator,
            cfg,
            opts,
        }
    }

    pub async fn stage(
        &self,
        universe: &[UniverseEntry],
        as_of_date: NaiveDate,
        regime: Regime,
    ) -> StageOutcome {
        let Some(target) = *self.cfg.targets.get(regime) else {
            tracing::info!(%as_of_date, %regime, "scanning disabled for regime");
            return StageOutcome::disabled();
        };

        let pool = self.load_eligible(universe, as_of_date).await;
        let mut out = StageOutcome {
            selected: Vec::new(),
            chosen_stage: None,
            target: Some(target),
            stage_counts: Vec::with_capacity(self.cfg.stages.len()),
            eligible: pool.len(),
            failures: 0,
        };

        for stage in 0..self.cfg.stages.len() {
            let accepted = match self.evaluate_stage(stage, regime, &pool, &mut out.failures) {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%as_of_date, stage, error = %err, "stage skipped");
                    out.failures += 1;
                    Vec::new()
                }
            };
            out.stage_counts.push(accepted.len());

            tracing::debug!(%as_of_date, stage, accepted = accepted.len(), min = target.min, "stage evaluated");

            if accepted.len() >= target.min {
                out.selected = accepted.into_iter().take(target.max).collect();
                out.chosen_stage = Some(stage);
                return out;
            }
        }

        tracing::info!(%as_of_date, %regime, stages = out.stage_counts.len(), "cascade exhausted without reaching target");
        out
    }

    /// Ranked candidates that pass one stage.
    fn evaluate_stage(
        &self,
        stage: usize,
        regime: Regime,
        pool: &[IndicatorSnapshot],
        failures: &mut usize,
    ) -> Result<Vec<CandidateSignal>, StageEvaluationFailure> {
        let thresholds =
            ThresholdSet::resolve(&self.cfg, stage, regime).map_err(|e| StageEvaluationFailure {
                stage,
                ticker: None,
                detail: format!("{e:#}"),
            })?;

        let mut accepted = Vec::new();
        for snap in pool {
            let evaluated = catch_unwind(AssertUnwindSafe(|| self.evaluator.evaluate(snap, &thresholds)));
            match evaluated {
                Ok(sig) if sig.matched && sig.score >= thresholds.cutoff => accepted.push(sig),
                Ok(_) => {}
                Err(_) => {
                    let failure = StageEvaluationFailure {
                        stage,
                        ticker: Some(snap.ticker.clone()),
                        detail: "evaluator panicked".to_string(),
                    };
                    tracing::warn!(error = %failure, "instrument skipped");
                    *failures += 1;
                }
            }
        }

        accepted.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.ticker.cmp(&b.ticker)));
        Ok(accepted)
    }

    /// Hard-filter the universe and fetch each survivor's snapshot once, time-boxed per instrument.
    async fn load_eligible(&self, universe: &[UniverseEntry], as_of_date: NaiveDate) -> Vec<IndicatorSnapshot> {
        let filter = &self.cfg.hard_filter;
        let sem = Arc::new(Semaphore::new(self.opts.fetch_concurrency.max(1)));
        let mut set = JoinSet::new();

        for (idx, entry) in universe.iter().enumerate() {
            if filter.excludes_name(&entry.name) {
                continue;
            }
            let provider = self.provider.clone();
            let sem = sem.clone();
            let ticker = entry.ticker.trim().to_string();
            let budget = self.opts.instrument_timeout;
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let fetched =
                    tokio::time::timeout(budget, provider.get_indicator_snapshot(&ticker, as_of_date)).await;
                let snap = match fetched {
                    Ok(Ok(snap)) => snap,
                    Ok(Err(err)) => {
                        tracing::debug!(%ticker, error = %format!("{err:#}"), "indicator snapshot unavailable");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(%ticker, budget_ms = budget.as_millis() as u64, "indicator snapshot timed out");
                        None
                    }
                };
                (idx, snap)
            });
        }

        let mut fetched: Vec<(usize, IndicatorSnapshot)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Some(snap))) => fetched.push((idx, snap)),
                Ok((_, None)) => {}
                Err(err) => tracing::warn!(error = %err, "indicator fetch task failed"),
            }
        }
        fetched.sort_by_key(|(idx, _)| *idx);

        fetched
            .into_iter()
            .filter_map(|(idx, snap)| {
                let entry = &universe[idx];
                let passes = filter.passes(
                    &entry.name,
                    entry.close.or(snap.close),
                    entry.volume.or(snap.volume),
                    entry.trading_value.or(snap.trading_value),
                );
                (passes && snap.as_of_date == as_of_date).then_some(snap)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::preset::StageSpec;
    use crate::domain::signal::ConditionFlags;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    fn entry(ticker: &str) -> UniverseEntry {
        UniverseEntry {
            ticker: ticker.to_string(),
            name: format!("{ticker} Holdings"),
            close: Some(50_000.0),
            volume: Some(1_000_000.0),
            trading_value: Some(5.0e10),
        }
    }

    struct StaticProvider {
        hang: Vec<String>,
    }

    #[async_trait::async_trait]
    impl IndicatorProvider for StaticProvider {
        fn provider_name(&self) -> &'static str {
            "static"
        }

        async fn list_universe(&self, _d: NaiveDate) -> anyhow::Result<Vec<UniverseEntry>> {
            Ok(Vec::new())
        }

        async fn get_indicator_snapshot(
            &self,
            ticker: &str,
            as_of_date: NaiveDate,
        ) -> anyhow::Result<Option<IndicatorSnapshot>> {
            if self.hang.iter().any(|t| t == ticker) {
                std::future::pending::<()>().await;
            }
            Ok(Some(IndicatorSnapshot::empty(ticker, as_of_date)))
        }
    }

    /// Scores come from a per-stage table; counts calls per stage.
    struct TableEvaluator {
        scores: HashMap<(usize, String), f64>,
        calls: Vec<AtomicUsize>,
        panic_on: Option<String>,
    }

    impl TableEvaluator {
        fn new(stages: usize, table: &[(usize, &str, f64)]) -> Self {
            Self {
                scores: table
                    .iter()
                    .map(|(s, t, v)| ((*s, t.to_string()), *v))
                    .collect(),
                calls: (0..stages).map(|_| AtomicUsize::new(0)).collect(),
                panic_on: None,
            }
        }

        fn calls(&self, stage: usize) -> usize {
            self.calls[stage].load(Ordering::SeqCst)
        }
    }

    impl SignalEvaluator for TableEvaluator {
        fn evaluate(&self, s: &IndicatorSnapshot, t: &ThresholdSet) -> CandidateSignal {
            self.calls[t.stage].fetch_add(1, Ordering::SeqCst);
            if self.panic_on.as_deref() == Some(s.ticker.as_str()) {
                panic!("bad snapshot for {}", s.ticker);
            }
            let mut sig = CandidateSignal::no_match(s.ticker.clone(), s.as_of_date, t.stage);
            if let Some(score) = self.scores.get(&(t.stage, s.ticker.clone())) {
                sig.score = *score;
                sig.matched = true;
                sig.flags = ConditionFlags {
                    trend_cross: true,
                    ..Default::default()
                };
            }
            sig
        }
    }

    fn two_stage_config(min: usize, max: usize) -> ScanConfig {
        let mut cfg = ScanConfig::default();
        let base = cfg.stages.clone();
        cfg.stages = vec![
            StageSpec {
                preset: base[0].preset.clone(),
                cutoff: 10.0,
            },
            StageSpec {
                preset: base[1].preset.clone(),
                cutoff: 8.0,
            },
        ];
        cfg.targets.neutral = Some(TargetRange { min, max });
        cfg
    }

    fn stager(cfg: ScanConfig, evaluator: Arc<TableEvaluator>, hang: Vec<String>) -> FallbackStager {
        FallbackStager::new(
            Arc::new(StaticProvider { hang }),
            evaluator,
            cfg,
            StagerOptions {
                instrument_timeout: Duration::from_millis(50),
                fetch_concurrency: 4,
            },
        )
    }

    #[tokio::test]
    async fn falls_back_to_the_looser_stage_and_ranks_by_score() {
        let ev = Arc::new(TableEvaluator::new(
            2,
            &[(0, "A", 11.0), (0, "B", 9.0), (1, "A", 11.0), (1, "B", 9.0), (1, "C", 8.0)],
        ));
        let s = stager(two_stage_config(3, 15), ev.clone(), vec![]);
        let universe = vec![entry("C"), entry("A"), entry("B")];

        let out = s.stage(&universe, date(), Regime::Neutral).await;
        let tickers: Vec<_> = out.selected.iter().map(|c| c.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "B", "C"]);
        assert_eq!(out.chosen_stage, Some(1));
        assert_eq!(out.stage_counts, vec![1, 3]);
    }

    #[tokio::test]
    async fn stops_at_the_first_stage_that_meets_target() {
        let ev = Arc::new(TableEvaluator::new(2, &[(0, "A", 12.0), (0, "B", 11.0), (1, "C", 9.0)]));
        let s = stager(two_stage_config(2, 15), ev.clone(), vec![]);
        let universe = vec![entry("A"), entry("B"), entry("C")];

        let out = s.stage(&universe, date(), Regime::Neutral).await;
        assert_eq!(out.chosen_stage, Some(0));
        assert_eq!(ev.calls(0), 3);
        assert_eq!(ev.calls(1), 0);
    }

    #[tokio::test]
    async fn caps_at_target_max_with_ticker_tiebreak() {
        let ev = Arc::new(TableEvaluator::new(
            2,
            &[(0, "D", 11.0), (0, "B", 11.0), (0, "A", 12.0), (0, "C", 10.0)],
        ));
        let s = stager(two_stage_config(1, 3), ev, vec![]);
        let universe = vec![entry("A"), entry("B"), entry("C"), entry("D")];

        let out = s.stage(&universe, date(), Regime::Neutral).await;
        let tickers: Vec<_> = out.selected.iter().map(|c| c.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "B", "D"]);
    }

    #[tokio::test]
    async fn exhausted_cascade_is_an_empty_result() {
        let ev = Arc::new(TableEvaluator::new(2, &[(1, "A", 9.0)]));
        let s = stager(two_stage_config(5, 15), ev, vec![]);
        let out = s.stage(&[entry("A"), entry("B")], date(), Regime::Neutral).await;
        assert!(out.selected.is_empty());
        assert_eq!(out.chosen_stage, None);
        assert_eq!(out.stage_counts, vec![0, 1]);
        assert!(!out.is_disabled());
    }

    #[tokio::test]
    async fn crash_regime_disables_scanning_without_evaluating() {
        let ev = Arc::new(TableEvaluator::new(2, &[(0, "A", 12.0)]));
        let s = stager(two_stage_config(1, 15), ev.clone(), vec![]);
        let out = s.stage(&[entry("A")], date(), Regime::Crash).await;
        assert!(out.is_disabled());
        assert!(out.selected.is_empty());
        assert_eq!(ev.calls(0), 0);
    }

    #[tokio::test]
    async fn panicking_instrument_is_isolated() {
        let mut table = TableEvaluator::new(2, &[(0, "A", 12.0), (0, "C", 11.0)]);
        table.panic_on = Some("B".to_string());
        let s = stager(two_stage_config(2, 15), Arc::new(table), vec![]);

        let out = s.stage(&[entry("A"), entry("B"), entry("C")], date(), Regime::Neutral).await;
        assert_eq!(out.chosen_stage, Some(0));
        assert_eq!(out.selected.len(), 2);
        assert_eq!(out.failures, 1);
    }

    #[tokio::test]
    async fn slow_instrument_times_out_as_no_match() {
        let ev = Arc::new(TableEvaluator::new(2, &[(0, "A", 12.0), (0, "B", 12.0)]));
        let s = stager(two_stage_config(1, 15), ev.clone(), vec!["B".to_string()]);

        let out = s.stage(&[entry("A"), entry("B")], date(), Regime::Neutral).await;
        assert_eq!(out.eligible, 1);
        assert_eq!(out.selected.len(), 1);
        assert_eq!(out.selected[0].ticker, "A");
        assert_eq!(ev.calls(0), 1);
    }

    #[tokio::test]
    async fn hard_filter_is_not_relaxed_between_stages() {
        let ev = Arc::new(TableEvaluator::new(2, &[(0, "A", 12.0), (1, "A", 12.0), (1, "ETF1", 12.0), (1, "PENNY", 12.0)]));
        let s = stager(two_stage_config(2, 15), ev.clone(), vec![]);
        let mut etf = entry("ETF1");
        etf.name = "KODEX 200".to_string();
        let mut penny = entry("PENNY");
        penny.close = Some(500.0);

        let out = s.stage(&[entry("A"), etf, penny], date(), Regime::Neutral).await;
        assert_eq!(out.eligible, 1);
        assert_eq!(out.chosen_stage, None);
        assert_eq!(ev.calls(1), 1);
    }
}
