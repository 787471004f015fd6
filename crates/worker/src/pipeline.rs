use anyhow::Context;
use chrono::{NaiveDate, Utc};
use recoscan_core::config::Settings;
use recoscan_core::domain::indicator::IndicatorSnapshot;
use recoscan_core::domain::preset::ScanConfig;
use recoscan_core::domain::recommendation::{Recommendation, RecommendationStatus};
use recoscan_core::domain::regime::{EvalMode, Regime, RegimeSnapshot};
use recoscan_core::ingest::provider::{
    HttpJsonIndicatorProvider, HttpJsonRegimeInputs, IndicatorProvider,
};
use recoscan_core::lifecycle::{CreateSummary, LifecycleManager, LifecyclePolicy, ReviewSummary};
use recoscan_core::regime::service::RegimeService;
use recoscan_core::regime::{ComposerConfig, RegimeComposer};
use recoscan_core::scan::{FallbackStager, RuleEvaluator, StagerOptions};
use recoscan_core::storage::indicators::PgIndicatorProvider;
use recoscan_core::storage::memory::{MemoryRecommendationStore, MemoryRegimeStore};
use recoscan_core::storage::recommendations::PgRecommendationStore;
use recoscan_core::storage::regime::PgRegimeStore;
use recoscan_core::storage::{RecommendationStore, RegimeStore};
use recoscan_core::time::market_calendar::MarketCalendar;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Selected,
    Empty,
    Disabled,
    Failed,
    /// Another run held the as-of date lock; nothing was read or written.
    Skipped,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Selected => "selected",
            Outcome::Empty => "empty",
            Outcome::Disabled => "disabled",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub regime: Regime,
    pub regime_score: f64,
    pub degraded: Vec<String>,
    pub universe: usize,
    pub eligible: usize,
    pub chosen_stage: Option<usize>,
    pub selected: usize,
    pub create: CreateSummary,
    pub review: ReviewSummary,
    pub closed_broken: usize,
    pub outcome: Outcome,
}

pub struct Pipeline {
    regime: RegimeService,
    indicators: Arc<dyn IndicatorProvider>,
    stager: FallbackStager,
    lifecycle: LifecycleManager,
    quote_timeout: Duration,
}

impl Pipeline {
    /// Wire providers and stores. A dry run keeps every write in memory, starting from the live
    /// rows it would read when a database is configured.
    pub async fn build(
        settings: &Settings,
        pool: Option<&sqlx::PgPool>,
        calendar: MarketCalendar,
        as_of_date: NaiveDate,
        dry_run: bool,
    ) -> anyhow::Result<Self> {
        let scan_cfg = ScanConfig::load(settings.scan_config_path.as_deref())?;

        let inputs = Arc::new(HttpJsonRegimeInputs::from_settings(settings)?);
        let composer = RegimeComposer::new(inputs, ComposerConfig::default());

        let indicators: Arc<dyn IndicatorProvider> = if settings.indicator_provider_base_url.is_some() {
            Arc::new(HttpJsonIndicatorProvider::from_settings(settings)?)
        } else {
            let pool = pool.context("DATABASE_URL or INDICATOR_PROVIDER_BASE_URL is required")?;
            Arc::new(PgIndicatorProvider::new(pool.clone()))
        };

        let regime_store: Arc<dyn RegimeStore>;
        let rec_store: Arc<dyn RecommendationStore>;
        if dry_run {
            let (regimes, recs) = match pool {
                Some(pool) => dry_run_seed(pool, as_of_date, &settings.regime_version).await?,
                None => (Vec::new(), Vec::new()),
            };
            tracing::info!(%as_of_date, regimes = regimes.len(), recommendations = recs.len(), "dry run stores seeded");
            regime_store = Arc::new(MemoryRegimeStore::seeded(regimes));
            rec_store = Arc::new(MemoryRecommendationStore::seeded(recs));
        } else {
            let pool = pool.context("DATABASE_URL is required unless --dry-run")?;
            regime_store = Arc::new(PgRegimeStore::new(pool.clone()));
            rec_store = Arc::new(PgRecommendationStore::new(pool.clone()));
        }

        let opts = StagerOptions::from_env();
        let evaluator = Arc::new(RuleEvaluator::new(scan_cfg.score_bands.clone()));

        Ok(Self {
            regime: RegimeService::new(composer, regime_store, settings.regime_version.clone()),
            indicators: indicators.clone(),
            stager: FallbackStager::new(indicators, evaluator, scan_cfg, opts),
            lifecycle: LifecycleManager::new(rec_store, LifecyclePolicy::from_env(), calendar),
            quote_timeout: opts.instrument_timeout,
        })
    }

    /// Regime, then the review of existing recommendations, then the scan and issuance.
    pub async fn run(
        &self,
        as_of_date: NaiveDate,
        mode: EvalMode,
        force_regime: bool,
    ) -> anyhow::Result<RunReport> {
        let regime = self.regime.resolve(as_of_date, mode, force_regime).await?;

        let quotes = self.open_quotes(as_of_date).await?;
        let review = self
            .lifecycle
            .review_open(as_of_date, &quotes, Utc::now())
            .await
            .context("review open recommendations failed")?;
        let closed_broken = self
            .lifecycle
            .close_broken(as_of_date, Utc::now())
            .await
            .context("close broken recommendations failed")?;

        let universe = self
            .indicators
            .list_universe(as_of_date)
            .await
            .with_context(|| format!("list universe failed (provider={})", self.indicators.provider_name()))?;

        let staged = self.stager.stage(&universe, as_of_date, regime.final_regime).await;
        let create = self
            .lifecycle
            .create_from_candidates(&staged.selected, regime.final_regime, Utc::now())
            .await;

        let outcome = if staged.is_disabled() {
            Outcome::Disabled
        } else if staged.selected.is_empty() {
            Outcome::Empty
        } else {
            Outcome::Selected
        };

        Ok(RunReport {
            regime: regime.final_regime,
            regime_score: regime.final_score,
            degraded: regime.degraded,
            universe: universe.len(),
            eligible: staged.eligible,
            chosen_stage: staged.chosen_stage,
            selected: staged.selected.len(),
            create,
            review,
            closed_broken,
            outcome,
        })
    }

    /// As-of snapshots for every open ticker; a slow or missing one is simply absent.
    async fn open_quotes(&self, as_of_date: NaiveDate) -> anyhow::Result<HashMap<String, IndicatorSnapshot>> {
        let open = self
            .lifecycle
            .list_by_status(&RecommendationStatus::OPEN)
            .await
            .context("list open recommendations failed")?;

        let mut quotes = HashMap::with_capacity(open.len());
        for rec in open {
            let fetched = tokio::time::timeout(
                self.quote_timeout,
                self.indicators.get_indicator_snapshot(&rec.ticker, as_of_date),
            )
            .await;
            match fetched {
                Ok(Ok(Some(snap))) => {
                    quotes.insert(rec.ticker, snap);
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(ticker = %rec.ticker, error = %format!("{err:#}"), "quote unavailable");
                }
                Err(_) => {
                    tracing::warn!(ticker = %rec.ticker, "quote fetch timed out");
                }
            }
        }
        Ok(quotes)
    }
}

/// Live rows a dry run needs to review and replace against: the stored regime for the date and
/// every open or BROKEN recommendation.
async fn dry_run_seed(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    version: &str,
) -> anyhow::Result<(Vec<RegimeSnapshot>, Vec<Recommendation>)> {
    let regime = PgRegimeStore::new(pool.clone())
        .get(as_of_date, version)
        .await
        .context("read stored regime for dry run failed")?;
    let recs = PgRecommendationStore::new(pool.clone())
        .list_by_status(&[
            RecommendationStatus::Active,
            RecommendationStatus::WeakWarning,
            RecommendationStatus::Broken,
        ])
        .await
        .context("read live recommendations for dry run failed")?;
    Ok((regime.into_iter().collect(), recs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels_are_distinct() {
        let all = [
            Outcome::Selected,
            Outcome::Empty,
            Outcome::Disabled,
            Outcome::Failed,
            Outcome::Skipped,
        ];
        let labels: std::collections::HashSet<_> = all.iter().map(|o| o.as_str()).collect();
        assert_eq!(labels.len(), all.len());
        assert_eq!(Outcome::Skipped.as_str(), "skipped");
    }
}
