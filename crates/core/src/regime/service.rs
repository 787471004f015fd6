use crate::domain::regime::{EvalMode, RegimeSnapshot};
use crate::regime::RegimeComposer;
use crate::storage::RegimeStore;
use anyhow::Context;
use chrono::NaiveDate;
use std::sync::Arc;

/// Composes a regime at most once per (date, version) and persists it.
pub struct RegimeService {
    composer: RegimeComposer,
    store: Arc<dyn RegimeStore>,
    version: String,
}

impl RegimeService {
    pub fn new(composer: RegimeComposer, store: Arc<dyn RegimeStore>, version: impl Into<String>) -> Self {
        Self {
            composer,
            store,
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Stored snapshot for the date, or a freshly composed and persisted one.
    ///
    /// `force` recomputes even when a snapshot exists. A stored snapshot computed under a
    /// different evaluation mode is also recomputed.
    pub async fn resolve(
        &self,
        as_of_date: NaiveDate,
        mode: EvalMode,
        force: bool,
    ) -> anyhow::Result<RegimeSnapshot> {
        if !force {
            match self.store.get(as_of_date, &self.version).await {
                Ok(Some(stored)) if stored.mode == mode => {
                    tracing::info!(
                        %as_of_date,
                        version = %self.version,
                        regime = %stored.final_regime,
                        "reusing stored regime snapshot"
                    );
                    return Ok(stored);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%as_of_date, error = %format!("{err:#}"), "regime store read failed; recomputing");
                }
            }
        }

        let snapshot = self.composer.compose(as_of_date, &self.version, mode).await;
        self.store
            .upsert(&snapshot)
            .await
            .with_context(|| format!("persist regime snapshot failed (as_of_date={as_of_date})"))?;
        Ok(snapshot)
    }
}
