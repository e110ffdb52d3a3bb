use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

struct FixedRateSource {
    rate: f64,
    calls: std::sync::Arc<AtomicUsize>,
}

impl FixedRateSource {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            calls: std::sync::Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl RateSource for FixedRateSource {
    async fn eur_per_usd(&self) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.rate)
    }
}

struct FailingRateSource;

#[async_trait]
impl RateSource for FailingRateSource {
    async fn eur_per_usd(&self) -> Result<f64> {
        anyhow::bail!("simulated network failure")
    }
}

fn book_path(tmp: &tempfile::TempDir) -> std::path::PathBuf {
    tmp.path().join("prices.json")
}

#[tokio::test]
async fn converts_sheet_prices_with_fetched_rate() {
    let tmp = tempfile::TempDir::new().unwrap();
    let oracle = PriceOracle::new(book_path(&tmp), Box::new(FixedRateSource::new(0.90))).unwrap();

    let prices = oracle.prices("gpt-4o-mini").await.unwrap();
    assert!((prices.input_per_million.unwrap() - 0.15 * 0.90).abs() < 1e-9);
    assert!((prices.output_per_million.unwrap() - 0.60 * 0.90).abs() < 1e-9);
    assert!(prices.embedding_per_million.is_none());

    let embed = oracle.prices("text-embedding-3-small").await.unwrap();
    assert!((embed.embedding_per_million.unwrap() - 0.02 * 0.90).abs() < 1e-9);
    assert!(embed.input_per_million.is_none());
}

#[tokio::test]
async fn fresh_record_skips_refresh() {
    let tmp = tempfile::TempDir::new().unwrap();
    let source = FixedRateSource::new(0.93);
    let calls = source.calls.clone();
    let oracle = PriceOracle::new(book_path(&tmp), Box::new(source)).unwrap();

    oracle.prices("gpt-4o-mini").await.unwrap();
    oracle.prices("gpt-4o-mini").await.unwrap();
    oracle.prices("gpt-4o-mini").await.unwrap();

    // Rate fetched once; later calls are served from the fresh record.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_failure_falls_back_to_hardcoded_rate() {
    let tmp = tempfile::TempDir::new().unwrap();
    let oracle = PriceOracle::new(book_path(&tmp), Box::new(FailingRateSource)).unwrap();

    let prices = oracle.prices("gpt-4o-mini").await.unwrap();
    assert!((prices.input_per_million.unwrap() - 0.15 * EUR_PER_USD_FALLBACK).abs() < 1e-9);
    assert!((prices.output_per_million.unwrap() - 0.60 * EUR_PER_USD_FALLBACK).abs() < 1e-9);
}

#[tokio::test]
async fn records_survive_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = book_path(&tmp);

    {
        let oracle = PriceOracle::new(&path, Box::new(FixedRateSource::new(0.88))).unwrap();
        oracle.prices("gpt-4o-mini").await.unwrap();
    }

    // A new oracle with a dead rate source still serves the persisted record.
    let oracle = PriceOracle::new(&path, Box::new(FailingRateSource)).unwrap();
    let prices = oracle.prices("gpt-4o-mini").await.unwrap();
    assert!((prices.input_per_million.unwrap() - 0.15 * 0.88).abs() < 1e-9);
}

#[tokio::test]
async fn unknown_chat_model_uses_default_usd_prices() {
    let tmp = tempfile::TempDir::new().unwrap();
    let oracle = PriceOracle::new(book_path(&tmp), Box::new(FixedRateSource::new(1.0))).unwrap();

    let prices = oracle.prices("some-future-model").await.unwrap();
    assert!((prices.input_per_million.unwrap() - DEFAULT_INPUT_USD_PER_MILLION).abs() < 1e-9);
    assert!((prices.output_per_million.unwrap() - DEFAULT_OUTPUT_USD_PER_MILLION).abs() < 1e-9);
}

#[tokio::test]
async fn mini_pattern_wins_over_base_model_prefix() {
    let tmp = tempfile::TempDir::new().unwrap();
    let oracle = PriceOracle::new(book_path(&tmp), Box::new(FixedRateSource::new(1.0))).unwrap();

    // "gpt-4o-mini-2024-07-18" must hit the mini entry, not the gpt-4o one.
    let prices = oracle.prices("gpt-4o-mini-2024-07-18").await.unwrap();
    assert!((prices.input_per_million.unwrap() - 0.15).abs() < 1e-9);
}

#[test]
fn embedded_pricing_data_parses() {
    let sheet = PriceOracle::parse_sheet().expect("embedded pricing data should parse");
    assert!(!sheet.is_empty());
}

#[tokio::test]
async fn http_rate_source_parses_api_shape() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "base": "USD",
            "rates": {"EUR": 0.9123, "GBP": 0.79}
        })))
        .mount(&server)
        .await;

    let source = HttpRateSource::with_url(server.uri());
    let rate = source.eur_per_usd().await.unwrap();
    assert!((rate - 0.9123).abs() < 1e-9);
}
