use anyhow::Context;
use clap::Parser;
use recoscan_core::config::Settings;
use recoscan_core::domain::regime::EvalMode;
use recoscan_core::ingest::types::IndicatorFile;
use recoscan_core::storage::lock::ScanLock;
use recoscan_core::storage::scan_runs::{record_scan_run, ScanRunRecord};
use recoscan_core::time::market_calendar::MarketCalendar;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod pipeline;

use pipeline::{Outcome, Pipeline, RunReport};

#[derive(Debug, Parser)]
#[command(name = "recoscan_worker")]
struct Args {
    /// Market as-of date (YYYY-MM-DD). Defaults to the latest session past its close cutoff.
    #[arg(long)]
    as_of_date: Option<String>,

    /// `live` or `backtest`. Backtest never reads same-day pre-open data.
    #[arg(long, default_value = "live")]
    mode: String,

    /// Run every read and computation but keep all writes in memory.
    #[arg(long)]
    dry_run: bool,

    /// Recompute the regime even if a snapshot for the date and version exists.
    #[arg(long)]
    force_regime: bool,

    /// Skip the per-date advisory lock (manual backfills).
    #[arg(long)]
    no_lock: bool,

    /// Load a day of indicator snapshots from a JSON file before scanning.
    #[arg(long)]
    indicators_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let mode: EvalMode = args.mode.parse()?;

    let calendar = MarketCalendar::from_env()?;
    let as_of_date = calendar.resolve_as_of_date(args.as_of_date.as_deref(), chrono::Utc::now())?;
    if !calendar.is_business_day(as_of_date) {
        tracing::warn!(%as_of_date, "as-of date is not a business day");
    }

    let pool = match settings.database_url.as_deref() {
        Some(db_url) => Some(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(db_url)
                .await
                .context("connect DATABASE_URL failed")?,
        ),
        None if args.dry_run => None,
        None => {
            settings.require_database_url()?;
            None
        }
    };

    if let (Some(pool), false) = (pool.as_ref(), args.dry_run) {
        recoscan_core::storage::migrate(pool).await?;
    }

    let lock = match (pool.as_ref(), args.dry_run || args.no_lock) {
        (Some(pool), false) => {
            match ScanLock::try_acquire(pool, as_of_date, &settings.regime_version).await? {
                Some(lock) => Some(lock),
                None => {
                    tracing::warn!(
                        %as_of_date,
                        mode = mode.as_str(),
                        dry_run = false,
                        outcome = Outcome::Skipped.as_str(),
                        "scan run finished; as-of date lock held by another run"
                    );
                    let now = chrono::Utc::now();
                    let record = ScanRunRecord {
                        outcome: Outcome::Skipped.as_str().to_string(),
                        error: Some("as-of date lock not acquired".to_string()),
                        started_at: now,
                        finished_at: now,
                        ..run_record(&settings, as_of_date, mode, None, None)
                    };
                    if let Err(err) = record_scan_run(pool, &record).await {
                        tracing::warn!(%as_of_date, error = %format!("{err:#}"), "record scan run failed");
                    }
                    return Ok(());
                }
            }
        }
        _ => None,
    };

    let started_at = chrono::Utc::now();
    let result = run(&args, &settings, pool.as_ref(), calendar, as_of_date, mode).await;
    let finished_at = chrono::Utc::now();
    let elapsed_ms = (finished_at - started_at).num_milliseconds();

    let record = match &result {
        Ok(report) => {
            log_summary(as_of_date, mode, args.dry_run, elapsed_ms, report);
            run_record(&settings, as_of_date, mode, Some(report), None)
        }
        Err(err) => {
            sentry_anyhow::capture_anyhow(err);
            tracing::error!(
                %as_of_date,
                mode = mode.as_str(),
                dry_run = args.dry_run,
                elapsed_ms,
                outcome = Outcome::Failed.as_str(),
                error = %format!("{err:#}"),
                "scan run finished"
            );
            run_record(&settings, as_of_date, mode, None, Some(format!("{err:#}")))
        }
    };

    if let (Some(pool), false) = (pool.as_ref(), args.dry_run) {
        let record = ScanRunRecord {
            started_at,
            finished_at,
            ..record
        };
        if let Err(err) = record_scan_run(pool, &record).await {
            tracing::warn!(%as_of_date, error = %format!("{err:#}"), "record scan run failed");
        }
    }

    if let Some(lock) = lock {
        if let Err(err) = lock.release().await {
            tracing::warn!(%as_of_date, error = %format!("{err:#}"), "lock release failed");
        }
    }

    result.map(|_| ())
}

async fn run(
    args: &Args,
    settings: &Settings,
    pool: Option<&sqlx::PgPool>,
    calendar: MarketCalendar,
    as_of_date: chrono::NaiveDate,
    mode: EvalMode,
) -> anyhow::Result<RunReport> {
    if let Some(path) = &args.indicators_file {
        load_indicators_file(path, pool, as_of_date, args.dry_run).await?;
    }

    let pipeline = Pipeline::build(settings, pool, calendar, as_of_date, args.dry_run).await?;
    pipeline.run(as_of_date, mode, args.force_regime).await
}

async fn load_indicators_file(
    path: &std::path::Path,
    pool: Option<&sqlx::PgPool>,
    as_of_date: chrono::NaiveDate,
    dry_run: bool,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read indicators file {}", path.display()))?;
    let file: IndicatorFile = serde_json::from_str(&text)
        .with_context(|| format!("indicators file {} is not valid JSON", path.display()))?;
    anyhow::ensure!(
        file.as_of_date == as_of_date,
        "indicators file is dated {} but the run is for {as_of_date}",
        file.as_of_date
    );

    if dry_run {
        tracing::info!(%as_of_date, items = file.items.len(), dry_run = true, "indicators file parsed; not loaded");
        return Ok(());
    }

    let pool = pool.context("DATABASE_URL is required to load an indicators file")?;
    let affected =
        recoscan_core::storage::indicators::upsert_indicator_snapshots(pool, as_of_date, &file.items).await?;
    tracing::info!(%as_of_date, items = file.items.len(), affected, "indicator snapshots loaded");
    Ok(())
}

fn log_summary(as_of_date: chrono::NaiveDate, mode: EvalMode, dry_run: bool, elapsed_ms: i64, r: &RunReport) {
    tracing::info!(
        %as_of_date,
        mode = mode.as_str(),
        dry_run,
        elapsed_ms,
        outcome = r.outcome.as_str(),
        regime = %r.regime,
        regime_score = r.regime_score,
        degraded = ?r.degraded,
        universe = r.universe,
        eligible = r.eligible,
        chosen_stage = ?r.chosen_stage,
        selected = r.selected,
        created = r.create.created,
        replaced = r.create.replaced,
        unchanged = r.create.unchanged,
        create_failed = r.create.failed,
        weakened = r.review.weakened,
        broken = r.review.broken,
        archived = r.review.archived + r.closed_broken,
        "scan run finished"
    );
}

fn run_record(
    settings: &Settings,
    as_of_date: chrono::NaiveDate,
    mode: EvalMode,
    report: Option<&RunReport>,
    error: Option<String>,
) -> ScanRunRecord {
    let now = chrono::Utc::now();
    let count = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
    ScanRunRecord {
        as_of_date,
        version: settings.regime_version.clone(),
        mode: mode.as_str().to_string(),
        regime: report.map(|r| r.regime.as_str().to_string()),
        chosen_stage: report.and_then(|r| r.chosen_stage).and_then(|s| i32::try_from(s).ok()),
        selected: report.map_or(0, |r| count(r.selected)),
        created: report.map_or(0, |r| count(r.create.created)),
        replaced: report.map_or(0, |r| count(r.create.replaced)),
        failed: report.map_or(0, |r| count(r.create.failed + r.review.failed)),
        outcome: report.map_or(Outcome::Failed, |r| r.outcome).as_str().to_string(),
        error,
        started_at: now,
        finished_at: now,
    }
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
