use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fallback EUR per USD when the exchange-rate API is unreachable and no
/// cached rate exists.
pub const EUR_PER_USD_FALLBACK: f64 = 0.93;

/// Exchange-rate API endpoint (free tier).
const EXCHANGE_RATE_API_URL: &str = "https://api.exchangerate-api.com/v4/latest/USD";
const EXCHANGE_RATE_TIMEOUT_SECS: u64 = 10;

const PRICE_TTL_HOURS: i64 = 24;
const RATE_TTL_HOURS: i64 = 12;

/// Embedded USD price snapshot covering the models this system calls.
const PRICING_DATA: &str = include_str!("pricing_data.json");

/// Default USD pricing for unknown chat models.
const DEFAULT_INPUT_USD_PER_MILLION: f64 = 10.0;
const DEFAULT_OUTPUT_USD_PER_MILLION: f64 = 30.0;
/// Default USD pricing for unknown embedding models.
const DEFAULT_EMBEDDING_USD_PER_MILLION: f64 = 0.02;

/// Model pricing in EUR per million tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPrices {
    pub input_per_million: Option<f64>,
    pub output_per_million: Option<f64>,
    pub embedding_per_million: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPrices {
    prices: ModelPrices,
    fetched_at: DateTime<Utc>,
}

/// On-disk price book: EUR records per model plus the cached exchange rate.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PriceBook {
    eur_per_usd: Option<f64>,
    rate_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    models: HashMap<String, StoredPrices>,
}

/// Source of the USD→EUR exchange rate. Trait so tests inject fixed rates.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn eur_per_usd(&self) -> Result<f64>;
}

/// Fetches the live rate from the exchange-rate API.
pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(EXCHANGE_RATE_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url: EXCHANGE_RATE_API_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_url(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

impl Default for HttpRateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn eur_per_usd(&self) -> Result<f64> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("exchange rate request failed")?
            .error_for_status()
            .context("exchange rate API returned an error status")?;
        let body: serde_json::Value = resp
            .json()
            .await
            .context("exchange rate response was not JSON")?;
        let rate = body["rates"]["EUR"]
            .as_f64()
            .context("EUR rate not found in response")?;
        info!("fetched exchange rate: 1 USD = {:.4} EUR", rate);
        Ok(rate)
    }
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    pattern: String,
    input_mtok: Option<f64>,
    output_mtok: Option<f64>,
    embedding_mtok: Option<f64>,
}

/// Price oracle: EUR per-million-token prices per model, with TTL'd
/// refresh, stale-cache fallback and hard-coded last resort.
///
/// The refresh path is serialized behind one async mutex so concurrent
/// callers never open more than one outbound rate fetch.
pub struct PriceOracle {
    path: PathBuf,
    rate_source: Box<dyn RateSource>,
    usd_sheet: Vec<(String, ModelPrices)>,
    book: tokio::sync::Mutex<PriceBook>,
}

impl PriceOracle {
    pub fn new(path: impl AsRef<Path>, rate_source: Box<dyn RateSource>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let book = Self::load_book(&path);
        let usd_sheet = Self::parse_sheet()?;
        Ok(Self {
            path,
            rate_source,
            usd_sheet,
            book: tokio::sync::Mutex::new(book),
        })
    }

    fn load_book(path: &Path) -> PriceBook {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(book) => book,
                Err(e) => {
                    warn!("price book at {} unreadable, starting fresh: {}", path.display(), e);
                    PriceBook::default()
                }
            },
            Err(_) => PriceBook::default(),
        }
    }

    fn parse_sheet() -> Result<Vec<(String, ModelPrices)>> {
        let entries: Vec<SheetEntry> =
            serde_json::from_str(PRICING_DATA).context("embedded pricing data should parse")?;
        Ok(entries
            .into_iter()
            .map(|e| {
                (
                    e.pattern,
                    ModelPrices {
                        input_per_million: e.input_mtok,
                        output_per_million: e.output_mtok,
                        embedding_per_million: e.embedding_mtok,
                    },
                )
            })
            .collect())
    }

    /// USD sheet prices for a model: longest-prefix wins via file order
    /// (more specific patterns listed first).
    fn usd_prices(&self, model: &str) -> ModelPrices {
        for (pattern, prices) in &self.usd_sheet {
            if model.starts_with(pattern.as_str()) {
                return prices.clone();
            }
        }
        warn!("no sheet pricing for model '{}', using defaults", model);
        if model.contains("embedding") {
            ModelPrices {
                embedding_per_million: Some(DEFAULT_EMBEDDING_USD_PER_MILLION),
                ..ModelPrices::default()
            }
        } else {
            ModelPrices {
                input_per_million: Some(DEFAULT_INPUT_USD_PER_MILLION),
                output_per_million: Some(DEFAULT_OUTPUT_USD_PER_MILLION),
                embedding_per_million: None,
            }
        }
    }

    /// Current EUR prices for a model.
    ///
    /// Fresh record (younger than 24 h) → returned as-is. Otherwise the
    /// record is rebuilt from the USD sheet and the exchange rate
    /// (cached 12 h, stale-or-fallback on fetch failure) and re-stamped,
    /// so a failing rate API cannot cause a fetch storm.
    pub async fn prices(&self, model: &str) -> Result<ModelPrices> {
        let mut book = self.book.lock().await;
        let now = Utc::now();

        if let Some(stored) = book.models.get(model) {
            let age = now - stored.fetched_at;
            if age.num_hours() < PRICE_TTL_HOURS {
                debug!(
                    "using cached prices for {} (age {}h)",
                    model,
                    age.num_hours()
                );
                return Ok(stored.prices.clone());
            }
        }

        let rate = self.current_rate(&mut book, now).await;
        let usd = self.usd_prices(model);
        let prices = ModelPrices {
            input_per_million: usd.input_per_million.map(|p| usd_to_eur(p, rate)),
            output_per_million: usd.output_per_million.map(|p| usd_to_eur(p, rate)),
            embedding_per_million: usd.embedding_per_million.map(|p| usd_to_eur(p, rate)),
        };
        book.models.insert(
            model.to_string(),
            StoredPrices {
                prices: prices.clone(),
                fetched_at: now,
            },
        );
        self.save_book(&book);
        Ok(prices)
    }

    async fn current_rate(&self, book: &mut PriceBook, now: DateTime<Utc>) -> f64 {
        if let (Some(rate), Some(fetched_at)) = (book.eur_per_usd, book.rate_fetched_at) {
            if (now - fetched_at).num_hours() < RATE_TTL_HOURS {
                return rate;
            }
        }

        match self.rate_source.eur_per_usd().await {
            Ok(rate) => {
                book.eur_per_usd = Some(rate);
                book.rate_fetched_at = Some(now);
                rate
            }
            Err(e) => {
                // Re-stamp even on failure so the next call does not retry
                // the network immediately.
                book.rate_fetched_at = Some(now);
                match book.eur_per_usd {
                    Some(stale) => {
                        warn!("rate fetch failed ({}), using stale rate {:.4}", e, stale);
                        stale
                    }
                    None => {
                        warn!(
                            "rate fetch failed ({}), using fallback rate {:.4}",
                            e, EUR_PER_USD_FALLBACK
                        );
                        book.eur_per_usd = Some(EUR_PER_USD_FALLBACK);
                        EUR_PER_USD_FALLBACK
                    }
                }
            }
        }
    }

    fn save_book(&self, book: &PriceBook) {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!("failed to create price book directory: {}", e);
            return;
        }
        match serde_json::to_string_pretty(book) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!("failed to persist price book to {}: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("failed to serialize price book: {}", e),
        }
    }
}

fn usd_to_eur(amount_usd: f64, eur_per_usd: f64) -> f64 {
    (amount_usd * eur_per_usd * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests;
