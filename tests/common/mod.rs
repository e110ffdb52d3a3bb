// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use fundmatch::budget::doc_tracker::DocumentBudgetTracker;
use fundmatch::cache::ResponseCache;
use fundmatch::client::ManagedClient;
use fundmatch::pricing::{PriceOracle, RateSource};
use fundmatch::providers::{
    CompletionRequest, CompletionResponse, EmbeddingResponse, ModelEndpoint,
};
use fundmatch::store::{
    AllowedSize, Company, CompanySize, Incentive, IncentiveProfile, InMemoryStore,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Rate source pinned to the documented fallback rate.
pub struct FixedRate(pub f64);

#[async_trait]
impl RateSource for FixedRate {
    async fn eur_per_usd(&self) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCompletion {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub structured: bool,
}

/// Scripted model endpoint: queued responses, recorded calls, sensible
/// defaults when the queue runs dry.
#[derive(Default)]
pub struct MockEndpoint {
    completions: Mutex<VecDeque<anyhow::Result<CompletionResponse>>>,
    embeddings: Mutex<VecDeque<anyhow::Result<EmbeddingResponse>>>,
    pub completion_calls: Mutex<Vec<RecordedCompletion>>,
    pub embed_calls: Mutex<Vec<String>>,
}

impl MockEndpoint {
    pub fn queue_completion_text(&self, text: &str) {
        self.completions
            .lock()
            .unwrap()
            .push_back(Ok(CompletionResponse {
                text: text.to_string(),
                input_tokens: 200,
                output_tokens: 100,
            }));
    }

    pub fn queue_completion(&self, response: anyhow::Result<CompletionResponse>) {
        self.completions.lock().unwrap().push_back(response);
    }

    pub fn queue_embedding(&self, vector: Vec<f32>, tokens: u64) {
        self.embeddings
            .lock()
            .unwrap()
            .push_back(Ok(EmbeddingResponse { vector, tokens }));
    }

    pub fn completion_call_count(&self) -> usize {
        self.completion_calls.lock().unwrap().len()
    }

    pub fn embed_call_count(&self) -> usize {
        self.embed_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelEndpoint for MockEndpoint {
    async fn complete(&self, req: CompletionRequest<'_>) -> anyhow::Result<CompletionResponse> {
        self.completion_calls
            .lock()
            .unwrap()
            .push(RecordedCompletion {
                model: req.model.to_string(),
                prompt: req
                    .messages
                    .iter()
                    .map(|m| m.content.clone())
                    .collect::<Vec<_>>()
                    .join("\n"),
                max_tokens: req.max_tokens,
                temperature: req.temperature,
                structured: req.response_format.is_some(),
            });
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(CompletionResponse {
                    text: "resposta simulada".to_string(),
                    input_tokens: 200,
                    output_tokens: 100,
                })
            })
    }

    async fn embed(&self, _model: &str, text: &str) -> anyhow::Result<EmbeddingResponse> {
        self.embed_calls.lock().unwrap().push(text.to_string());
        self.embeddings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(EmbeddingResponse {
                    vector: vec![0.1; 8],
                    tokens: 7,
                })
            })
    }
}

pub struct TestHarness {
    pub tmp: TempDir,
    pub endpoint: Arc<MockEndpoint>,
    pub client: Arc<ManagedClient>,
    pub store: Arc<InMemoryStore>,
}

pub fn harness() -> TestHarness {
    harness_with_budgets(0.30, 0.30)
}

pub fn harness_with_budgets(request_budget: f64, doc_cap: f64) -> TestHarness {
    let tmp = TempDir::new().expect("create temp dir");
    let endpoint = Arc::new(MockEndpoint::default());
    let oracle = PriceOracle::new(tmp.path().join("prices.json"), Box::new(FixedRate(0.93)))
        .expect("price oracle");
    let cache = ResponseCache::new(tmp.path().join("cache.db")).expect("response cache");
    let client = Arc::new(ManagedClient::new(
        endpoint.clone(),
        oracle,
        cache,
        DocumentBudgetTracker::new(doc_cap),
        request_budget,
    ));
    TestHarness {
        tmp,
        endpoint,
        client,
        store: Arc::new(InMemoryStore::new()),
    }
}

/// Unit vector along one axis, for crafting known similarities.
pub fn axis(dim: usize, index: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[index] = 1.0;
    v
}

pub fn incentive_fixture(id: &str, title: &str) -> Incentive {
    Incentive {
        incentive_id: id.to_string(),
        title: title.to_string(),
        description: Some("Apoio ao investimento empresarial.".to_string()),
        profile: None,
        document_urls: vec![],
        source_link: "https://fundos.example.pt".to_string(),
        publication_date: None,
        start_date: None,
        end_date: None,
        total_budget: None,
    }
}

pub fn strict_incentive(id: &str) -> Incentive {
    let mut incentive = incentive_fixture(id, "Apoio à construção de edifícios");
    incentive.profile = Some(IncentiveProfile {
        sector_codes: vec!["41".into(), "42".into(), "43".into()],
        company_sizes: vec![AllowedSize::Sme],
        geographic_scope: Some("Lisboa, Porto".into()),
        investment_objectives: vec!["modernização".into()],
        specific_purposes: vec![],
        eligibility_criteria: vec![],
    });
    incentive
}

pub fn company_fixture(
    id: &str,
    name: &str,
    size: CompanySize,
    sectors: &[&str],
    district: Option<&str>,
) -> Company {
    Company {
        company_id: id.to_string(),
        name: name.to_string(),
        sector_codes: sectors.iter().map(|s| (*s).to_string()).collect(),
        size,
        district: district.map(str::to_string),
        county: None,
        parish: None,
        website: None,
        raw: None,
    }
}
