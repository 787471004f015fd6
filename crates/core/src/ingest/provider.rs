use crate::config::{env_or, Settings};
use crate::domain::indicator::IndicatorSnapshot;
use crate::ingest::types::{
    ExternalMarketSnapshot, LocalMarketStats, PreopenSnapshot, UniverseEntry, UniverseResponse,
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRIES: u32 = 3;

/// Supplier of precomputed indicator fields. Core never derives these from raw prices.
#[async_trait::async_trait]
pub trait IndicatorProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn list_universe(&self, as_of_date: NaiveDate) -> Result<Vec<UniverseEntry>>;

    async fn get_indicator_snapshot(
        &self,
        ticker: &str,
        as_of_date: NaiveDate,
    ) -> Result<Option<IndicatorSnapshot>>;
}

/// Supplier of the three regime inputs. Each may come back with `valid == false`.
#[async_trait::async_trait]
pub trait RegimeInputProvider: Send + Sync {
    async fn get_local_market_stats(&self, as_of_date: NaiveDate) -> Result<LocalMarketStats>;

    async fn get_external_market_snapshot(
        &self,
        as_of_date: NaiveDate,
    ) -> Result<ExternalMarketSnapshot>;

    async fn get_preopen_snapshot(&self, as_of_date: NaiveDate) -> Result<PreopenSnapshot>;
}

/// Small JSON-over-HTTP client with a bounded timeout and exponential-backoff retries.
#[derive(Debug, Clone)]
pub struct HttpJsonClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retries: u32,
}

impl HttpJsonClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let timeout_secs = env_or("MARKET_DATA_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);
        let retries = env_or("MARKET_DATA_RETRIES", DEFAULT_RETRIES).max(1);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build market data http client")?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key,
            retries,
        })
    }

    fn url(&self, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }

    /// GET `path` and decode the body. HTTP 404 maps to `Ok(None)`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.get_once::<T>(path, query).await {
                Ok(out) => return Ok(out),
                Err(FetchError::Fatal(err)) => return Err(err),
                Err(FetchError::Retryable(err)) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(attempt, ?backoff, path, error = %err, "market data fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<Option<T>, FetchError> {
        let headers = self.headers().map_err(FetchError::Fatal)?;
        let res = self
            .http
            .get(self.url(path))
            .headers(headers)
            .query(query)
            .send()
            .await
            .context("market data request failed")
            .map_err(FetchError::Retryable)?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let text = res
            .text()
            .await
            .context("failed to read market data response")
            .map_err(FetchError::Retryable)?;

        if !status.is_success() {
            let err = anyhow::anyhow!("market data HTTP {status} for {path}: {text}");
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            return Err(if retryable {
                FetchError::Retryable(err)
            } else {
                FetchError::Fatal(err)
            });
        }

        serde_json::from_str::<T>(&text)
            .with_context(|| format!("failed to decode market data response for {path}: {text}"))
            .map(Some)
            .map_err(FetchError::Fatal)
    }
}

enum FetchError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct HttpJsonRegimeInputs {
    client: HttpJsonClient,
}

impl HttpJsonRegimeInputs {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_market_data_base_url()?;
        let client = HttpJsonClient::new(base_url, settings.market_data_api_key.clone())?;
        Ok(Self { client })
    }

    fn date_query(as_of_date: NaiveDate) -> [(&'static str, String); 1] {
        [("as_of_date", as_of_date.to_string())]
    }
}

#[async_trait::async_trait]
impl RegimeInputProvider for HttpJsonRegimeInputs {
    async fn get_local_market_stats(&self, as_of_date: NaiveDate) -> Result<LocalMarketStats> {
        let out = self
            .client
            .get_json::<LocalMarketStats>("/v1/market/local", &Self::date_query(as_of_date))
            .await?;
        Ok(out.unwrap_or_else(|| LocalMarketStats::invalid(as_of_date)))
    }

    async fn get_external_market_snapshot(
        &self,
        as_of_date: NaiveDate,
    ) -> Result<ExternalMarketSnapshot> {
        let out = self
            .client
            .get_json::<ExternalMarketSnapshot>(
                "/v1/market/external",
                &Self::date_query(as_of_date),
            )
            .await?;
        Ok(out.unwrap_or_else(ExternalMarketSnapshot::invalid))
    }

    async fn get_preopen_snapshot(&self, as_of_date: NaiveDate) -> Result<PreopenSnapshot> {
        let out = self
            .client
            .get_json::<PreopenSnapshot>("/v1/market/preopen", &Self::date_query(as_of_date))
            .await?;
        Ok(out.unwrap_or_else(PreopenSnapshot::invalid))
    }
}

#[derive(Debug, Clone)]
pub struct HttpJsonIndicatorProvider {
    client: HttpJsonClient,
}

impl HttpJsonIndicatorProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_indicator_provider_base_url()?;
        let client = HttpJsonClient::new(base_url, settings.market_data_api_key.clone())?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl IndicatorProvider for HttpJsonIndicatorProvider {
    fn provider_name(&self) -> &'static str {
        "indicator_http_json"
    }

    async fn list_universe(&self, as_of_date: NaiveDate) -> Result<Vec<UniverseEntry>> {
        let resp = self
            .client
            .get_json::<UniverseResponse>(
                "/v1/universe",
                &[("as_of_date", as_of_date.to_string())],
            )
            .await?
            .with_context(|| format!("no universe published for {as_of_date}"))?;

        anyhow::ensure!(
            resp.as_of_date == as_of_date,
            "provider as_of_date mismatch: expected {as_of_date}, got {}",
            resp.as_of_date
        );
        Ok(resp.items)
    }

    async fn get_indicator_snapshot(
        &self,
        ticker: &str,
        as_of_date: NaiveDate,
    ) -> Result<Option<IndicatorSnapshot>> {
        let snap = self
            .client
            .get_json::<IndicatorSnapshot>(
                "/v1/indicators",
                &[
                    ("ticker", ticker.to_string()),
                    ("as_of_date", as_of_date.to_string()),
                ],
            )
            .await?;

        // A snapshot for a different date would leak or stale the evaluation; treat as absent.
        Ok(snap.filter(|s| s.as_of_date == as_of_date && s.ticker == ticker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_joins_base_and_path() {
        let c = HttpJsonClient::new("https://example.test/api/", None).unwrap();
        assert_eq!(c.url("v1/market/local"), "https://example.test/api/v1/market/local");
        assert_eq!(c.url("/v1/universe"), "https://example.test/api/v1/universe");
    }

    #[test]
    fn parses_invalid_regime_inputs_with_missing_fields() {
        let local: LocalMarketStats =
            serde_json::from_value(json!({"valid": false, "as_of_date": "2025-01-10"})).unwrap();
        assert!(!local.valid);
        assert!(local.index_closes.is_empty());

        let pre: PreopenSnapshot = serde_json::from_value(json!({"valid": false})).unwrap();
        assert_eq!(pre, PreopenSnapshot::invalid());
    }

    #[test]
    fn parses_indicator_snapshot_with_partial_fields() {
        let snap: IndicatorSnapshot = serde_json::from_value(json!({
            "ticker": "KRX:005930",
            "as_of_date": "2025-01-10",
            "close": 55000.0,
            "rsi": 61.5
        }))
        .unwrap();
        assert_eq!(snap.close, Some(55000.0));
        assert_eq!(snap.ma_slow, None);
    }
}
