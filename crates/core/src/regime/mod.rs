//! Market regime composition.
//!
//! Three independently fetched inputs (local market statistics, the foreign market's prior
//! session, and pre-open futures/FX moves) are scored separately and composed into one
//! categorical regime. The composer never fails: every input that is missing, flagged invalid,
//! slow, or broken is replaced by its neutral default and recorded in `degraded`.

pub mod external;
pub mod local;
pub mod preopen;
pub mod service;

use crate::domain::error::DataUnavailable;
use crate::domain::regime::{
    EvalMode, ExternalScore, LocalScore, PreopenRisk, PreopenRiskLevel, Regime, RegimeSnapshot,
};
use crate::ingest::provider::RegimeInputProvider;
use crate::ingest::types::{ExternalMarketSnapshot, PreopenSnapshot};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

pub use external::compute_external_prior_score;
pub use local::score_local_stats;
pub use preopen::{compute_preopen_risk_score, PreopenBuckets};

const DEFAULT_INPUT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposerConfig {
    pub local_weight: f64,
    pub external_weight: f64,
    pub watch_penalty: f64,
    pub danger_penalty: f64,
    /// Composite score at or above which the regime is bull.
    pub bull_threshold: f64,
    pub neutral_threshold: f64,
    pub bear_threshold: f64,
    pub preopen_buckets: PreopenBuckets,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            local_weight: 0.6,
            external_weight: 0.4,
            watch_penalty: 0.15,
            danger_penalty: 0.35,
            bull_threshold: 0.25,
            neutral_threshold: -0.15,
            bear_threshold: -0.5,
            preopen_buckets: PreopenBuckets::default(),
        }
    }
}

/// Weighted combination of the three component scores, mapped through ordered thresholds.
///
/// Backtest mode ignores the pre-open penalty entirely.
pub fn compose_global_regime(
    local: &LocalScore,
    external: &ExternalScore,
    preopen: &PreopenRisk,
    mode: EvalMode,
    cfg: &ComposerConfig,
) -> (Regime, f64) {
    let penalty = match (mode, preopen.level) {
        (EvalMode::Backtest, _) | (_, PreopenRiskLevel::Calm) => 0.0,
        (EvalMode::Live, PreopenRiskLevel::Watch) => cfg.watch_penalty,
        (EvalMode::Live, PreopenRiskLevel::Danger) => cfg.danger_penalty,
    };

    let raw = cfg.local_weight * local::sanitize(local.total)
        + cfg.external_weight * local::sanitize(external.total)
        - penalty;
    let score = local::bounded(raw);

    let regime = if score >= cfg.bull_threshold {
        Regime::Bull
    } else if score >= cfg.neutral_threshold {
        Regime::Neutral
    } else if score >= cfg.bear_threshold {
        Regime::Bear
    } else {
        Regime::Crash
    };

    (regime, score)
}

pub struct RegimeComposer {
    inputs: Arc<dyn RegimeInputProvider>,
    cfg: ComposerConfig,
    input_timeout: Duration,
}

impl RegimeComposer {
    pub fn new(inputs: Arc<dyn RegimeInputProvider>, cfg: ComposerConfig) -> Self {
        Self {
            inputs,
            cfg,
            input_timeout: DEFAULT_INPUT_TIMEOUT,
        }
    }

    pub fn with_input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout = timeout;
        self
    }

    pub async fn compute_local_score(
        &self,
        as_of_date: NaiveDate,
    ) -> (LocalScore, Option<DataUnavailable>) {
        let fetched = tokio::time::timeout(
            self.input_timeout,
            self.inputs.get_local_market_stats(as_of_date),
        )
        .await;

        let stats = match flatten("local_market_stats", fetched) {
            Ok(stats) => stats,
            Err(err) => return (LocalScore::default(), Some(err)),
        };
        if !stats.valid {
            return (
                LocalScore::default(),
                Some(DataUnavailable::new("local_market_stats", "flagged invalid")),
            );
        }
        if stats.as_of_date != as_of_date {
            return (
                LocalScore::default(),
                Some(DataUnavailable::new(
                    "local_market_stats",
                    format!("stats dated {} for as-of {as_of_date}", stats.as_of_date),
                )),
            );
        }
        (score_local_stats(&stats), None)
    }

    pub async fn compute_external_score(
        &self,
        as_of_date: NaiveDate,
        mode: EvalMode,
    ) -> (ExternalScore, Option<DataUnavailable>) {
        let fetched = tokio::time::timeout(
            self.input_timeout,
            self.inputs.get_external_market_snapshot(as_of_date),
        )
        .await;

        let snapshot: ExternalMarketSnapshot = match flatten("external_market", fetched) {
            Ok(s) => s,
            Err(err) => return (ExternalScore::default(), Some(err)),
        };
        match compute_external_prior_score(&snapshot, as_of_date, mode) {
            Ok(score) => (score, None),
            Err(rejection) => (
                ExternalScore::default(),
                Some(DataUnavailable::new("external_market", rejection.as_str())),
            ),
        }
    }

    /// Backtest evaluation never fetches pre-open data: it would leak the future.
    pub async fn compute_preopen_risk(
        &self,
        as_of_date: NaiveDate,
        mode: EvalMode,
    ) -> (PreopenRisk, Option<DataUnavailable>) {
        if mode == EvalMode::Backtest {
            return (PreopenRisk::default(), None);
        }

        let fetched = tokio::time::timeout(
            self.input_timeout,
            self.inputs.get_preopen_snapshot(as_of_date),
        )
        .await;

        let snapshot: PreopenSnapshot = match flatten("preopen", fetched) {
            Ok(s) => s,
            Err(err) => return (PreopenRisk::default(), Some(err)),
        };
        if !snapshot.valid {
            return (
                PreopenRisk::default(),
                Some(DataUnavailable::new("preopen", "flagged invalid")),
            );
        }
        (
            compute_preopen_risk_score(&snapshot, &self.cfg.preopen_buckets),
            None,
        )
    }

    /// Compose the regime for `as_of_date`. Always returns a snapshot.
    pub async fn compose(
        &self,
        as_of_date: NaiveDate,
        version: &str,
        mode: EvalMode,
    ) -> RegimeSnapshot {
        let (local, local_err) = self.compute_local_score(as_of_date).await;
        let (external, external_err) = self.compute_external_score(as_of_date, mode).await;
        let (preopen, preopen_err) = self.compute_preopen_risk(as_of_date, mode).await;

        let mut degraded = Vec::new();
        for err in [local_err, external_err, preopen_err].into_iter().flatten() {
            tracing::warn!(%as_of_date, input = err.input, reason = %err.reason, "regime input degraded to neutral");
            degraded.push(err.input.to_string());
        }

        let (final_regime, final_score) =
            compose_global_regime(&local, &external, &preopen, mode, &self.cfg);

        tracing::info!(
            %as_of_date,
            version,
            mode = mode.as_str(),
            regime = %final_regime,
            score = final_score,
            local = local.total,
            external = external.total,
            preopen = preopen.level.as_str(),
            degraded = degraded.len(),
            "regime composed"
        );

        RegimeSnapshot {
            as_of_date,
            version: version.to_string(),
            mode,
            local,
            external,
            preopen,
            final_regime,
            final_score,
            degraded,
            computed_at: Utc::now(),
        }
    }
}

fn flatten<T>(
    input: &'static str,
    fetched: Result<anyhow::Result<T>, tokio::time::error::Elapsed>,
) -> Result<T, DataUnavailable> {
    match fetched {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(err)) => Err(DataUnavailable::new(input, format!("{err:#}"))),
        Err(_) => Err(DataUnavailable::new(input, "timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::LocalMarketStats;

    struct FixedInputs {
        local: anyhow::Result<LocalMarketStats>,
        external: ExternalMarketSnapshot,
        preopen: PreopenSnapshot,
    }

    #[async_trait::async_trait]
    impl RegimeInputProvider for FixedInputs {
        async fn get_local_market_stats(&self, _d: NaiveDate) -> anyhow::Result<LocalMarketStats> {
            match &self.local {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }

        async fn get_external_market_snapshot(
            &self,
            _d: NaiveDate,
        ) -> anyhow::Result<ExternalMarketSnapshot> {
            Ok(self.external.clone())
        }

        async fn get_preopen_snapshot(&self, _d: NaiveDate) -> anyhow::Result<PreopenSnapshot> {
            Ok(self.preopen.clone())
        }
    }

    struct HangingInputs;

    #[async_trait::async_trait]
    impl RegimeInputProvider for HangingInputs {
        async fn get_local_market_stats(&self, _d: NaiveDate) -> anyhow::Result<LocalMarketStats> {
            std::future::pending().await
        }

        async fn get_external_market_snapshot(
            &self,
            _d: NaiveDate,
        ) -> anyhow::Result<ExternalMarketSnapshot> {
            anyhow::bail!("connection refused")
        }

        async fn get_preopen_snapshot(&self, _d: NaiveDate) -> anyhow::Result<PreopenSnapshot> {
            std::future::pending().await
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    fn all_invalid() -> FixedInputs {
        FixedInputs {
            local: Ok(LocalMarketStats::invalid(date())),
            external: ExternalMarketSnapshot::invalid(),
            preopen: PreopenSnapshot::invalid(),
        }
    }

    #[tokio::test]
    async fn all_inputs_invalid_compose_to_neutral_zero() {
        let composer = RegimeComposer::new(Arc::new(all_invalid()), ComposerConfig::default());
        let snap = composer.compose(date(), "v1", EvalMode::Live).await;
        assert_eq!(snap.final_regime, Regime::Neutral);
        assert_eq!(snap.final_score, 0.0);
        assert_eq!(snap.degraded.len(), 3);
    }

    #[tokio::test]
    async fn failing_and_hanging_inputs_still_compose() {
        let composer = RegimeComposer::new(Arc::new(HangingInputs), ComposerConfig::default())
            .with_input_timeout(Duration::from_millis(20));
        let snap = composer.compose(date(), "v1", EvalMode::Live).await;
        assert_eq!(snap.final_regime, Regime::Neutral);
        assert_eq!(
            snap.degraded,
            vec!["local_market_stats", "external_market", "preopen"]
        );
    }

    #[tokio::test]
    async fn backtest_never_consumes_preopen() {
        let inputs = FixedInputs {
            preopen: PreopenSnapshot {
                valid: true,
                futures_change_pct: Some(-5.0),
                fx_change_pct: Some(3.0),
                observed_at: None,
            },
            ..all_invalid()
        };
        let composer = RegimeComposer::new(Arc::new(inputs), ComposerConfig::default());

        let live = composer.compose(date(), "v1", EvalMode::Live).await;
        assert_eq!(live.preopen.level, PreopenRiskLevel::Danger);
        assert!(live.final_score < 0.0);

        let backtest = composer.compose(date(), "v1", EvalMode::Backtest).await;
        assert_eq!(backtest.preopen, PreopenRisk::default());
        assert_eq!(backtest.final_score, 0.0);
    }

    #[tokio::test]
    async fn stale_local_stats_are_rejected() {
        let inputs = FixedInputs {
            local: Ok(LocalMarketStats {
                valid: true,
                index_closes: (0..80).map(|i| 100.0 + i as f64).collect(),
                ..LocalMarketStats::invalid(NaiveDate::from_ymd_opt(2025, 1, 9).unwrap())
            }),
            ..all_invalid()
        };
        let composer = RegimeComposer::new(Arc::new(inputs), ComposerConfig::default());
        let (score, err) = composer.compute_local_score(date()).await;
        assert_eq!(score, LocalScore::default());
        assert!(err.is_some());
    }

    #[test]
    fn thresholds_map_to_every_regime() {
        let cfg = ComposerConfig::default();
        let ext = ExternalScore::default();
        let calm = PreopenRisk::default();
        let local = |total: f64| LocalScore {
            total,
            ..Default::default()
        };

        let cases = [(1.0, Regime::Bull), (0.0, Regime::Neutral), (-0.5, Regime::Bear), (-1.0, Regime::Crash)];
        for (total, expected) in cases {
            let (r, _) = compose_global_regime(&local(total), &ext, &calm, EvalMode::Live, &cfg);
            assert_eq!(r, expected, "local total {total}");
        }
    }

    #[test]
    fn danger_preopen_penalizes_live_only() {
        let cfg = ComposerConfig::default();
        let danger = PreopenRisk {
            score: 0.9,
            level: PreopenRiskLevel::Danger,
        };
        let (live_regime, live_score) = compose_global_regime(
            &LocalScore::default(),
            &ExternalScore::default(),
            &danger,
            EvalMode::Live,
            &cfg,
        );
        assert!((live_score + cfg.danger_penalty).abs() < 1e-9);
        assert_eq!(live_regime, Regime::Bear);

        let (bt_regime, bt_score) = compose_global_regime(
            &LocalScore::default(),
            &ExternalScore::default(),
            &danger,
            EvalMode::Backtest,
            &cfg,
        );
        assert_eq!(bt_score, 0.0);
        assert_eq!(bt_regime, Regime::Neutral);
    }

    #[test]
    fn non_finite_components_never_escape() {
        let local = LocalScore {
            total: f64::NAN,
            ..Default::default()
        };
        let external = ExternalScore {
            total: f64::INFINITY,
            ..Default::default()
        };
        let (r, s) = compose_global_regime(
            &local,
            &external,
            &PreopenRisk::default(),
            EvalMode::Live,
            &ComposerConfig::default(),
        );
        assert_eq!(r, Regime::Neutral);
        assert_eq!(s, 0.0);
    }
}
