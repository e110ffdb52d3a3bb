use crate::embedding::cosine_similarity;
use crate::errors::{FundmatchError, FundmatchResult};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Embedding width produced by the reference embedding model.
pub const EMBEDDING_DIM: usize = 1536;

/// Company size classes as recorded in the corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompanySize {
    Micro,
    Sme,
    Large,
    #[default]
    Unknown,
}

/// Size classes an incentive may declare as eligible. `NotApplicable`
/// disables the size rule entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllowedSize {
    Micro,
    Sme,
    Large,
    NotApplicable,
}

impl AllowedSize {
    pub fn admits(self, size: CompanySize) -> bool {
        matches!(
            (self, size),
            (AllowedSize::Micro, CompanySize::Micro)
                | (AllowedSize::Sme, CompanySize::Sme)
                | (AllowedSize::Large, CompanySize::Large)
        )
    }
}

/// Structured attributes extracted for an incentive. All fields optional;
/// a closed record, not an open map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncentiveProfile {
    #[serde(default)]
    pub sector_codes: Vec<String>,
    #[serde(default)]
    pub company_sizes: Vec<AllowedSize>,
    #[serde(default)]
    pub geographic_scope: Option<String>,
    #[serde(default)]
    pub investment_objectives: Vec<String>,
    #[serde(default)]
    pub specific_purposes: Vec<String>,
    #[serde(default)]
    pub eligibility_criteria: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incentive {
    pub incentive_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub profile: Option<IncentiveProfile>,
    #[serde(default)]
    pub document_urls: Vec<String>,
    pub source_link: String,
    #[serde(default)]
    pub publication_date: Option<NaiveDate>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub total_budget: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub company_id: String,
    pub name: String,
    /// 4–5 digit sector codes, zero-padded strings.
    #[serde(default)]
    pub sector_codes: Vec<String>,
    #[serde(default)]
    pub size: CompanySize,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub parish: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    /// Opaque source attributes; `raw["description"]` feeds lexical scoring.
    #[serde(default)]
    pub raw: Option<Value>,
}

impl Company {
    /// Free-text description carried in the raw attributes, if any.
    pub fn raw_description(&self) -> Option<&str> {
        self.raw
            .as_ref()
            .and_then(|raw| raw.get("description"))
            .and_then(Value::as_str)
    }
}

/// Read-only retrieval backend: entity lookups plus nearest-neighbour
/// search over the pre-computed embeddings.
///
/// `nearest_*` return similarity as `1 − cosine_distance ∈ [0,1]`, ordered
/// by similarity descending with ties broken by entity id ascending, so
/// retrieval is deterministic for a fixed store.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn get_incentive(&self, id: &str) -> FundmatchResult<Option<Incentive>>;

    async fn get_company(&self, id: &str) -> FundmatchResult<Option<Company>>;

    /// The stored embedding for an incentive, `None` when not yet computed.
    async fn incentive_embedding(&self, id: &str) -> FundmatchResult<Option<Vec<f32>>>;

    async fn nearest_companies(
        &self,
        query: &[f32],
        k: usize,
    ) -> FundmatchResult<Vec<(Company, f32)>>;

    async fn nearest_incentives(
        &self,
        query: &[f32],
        k: usize,
    ) -> FundmatchResult<Vec<(Incentive, f32)>>;
}

/// In-memory store backing tests and small corpora. Vectors are
/// re-normalized inside the cosine, and negative similarities clamp to 0
/// so scores stay inside [0,1].
#[derive(Default)]
pub struct InMemoryStore {
    incentives: RwLock<HashMap<String, (Incentive, Option<Vec<f32>>)>>,
    companies: RwLock<HashMap<String, (Company, Option<Vec<f32>>)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_incentive(&self, incentive: Incentive, embedding: Option<Vec<f32>>) {
        if let Ok(mut map) = self.incentives.write() {
            map.insert(incentive.incentive_id.clone(), (incentive, embedding));
        }
    }

    pub fn insert_company(&self, company: Company, embedding: Option<Vec<f32>>) {
        if let Ok(mut map) = self.companies.write() {
            map.insert(company.company_id.clone(), (company, embedding));
        }
    }
}

fn rank_nearest<T>(
    entries: impl Iterator<Item = (String, T, Option<Vec<f32>>)>,
    query: &[f32],
    k: usize,
) -> Vec<(T, f32)> {
    let mut scored: Vec<(String, T, f32)> = entries
        .filter_map(|(id, entity, embedding)| {
            embedding.map(|vec| {
                let similarity = cosine_similarity(query, &vec).max(0.0);
                (id, entity, similarity)
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    scored
        .into_iter()
        .take(k)
        .map(|(_, entity, similarity)| (entity, similarity))
        .collect()
}

#[async_trait]
impl MatchStore for InMemoryStore {
    async fn get_incentive(&self, id: &str) -> FundmatchResult<Option<Incentive>> {
        let map = self
            .incentives
            .read()
            .map_err(|e| FundmatchError::StoreUnavailable(e.to_string()))?;
        Ok(map.get(id).map(|(incentive, _)| incentive.clone()))
    }

    async fn get_company(&self, id: &str) -> FundmatchResult<Option<Company>> {
        let map = self
            .companies
            .read()
            .map_err(|e| FundmatchError::StoreUnavailable(e.to_string()))?;
        Ok(map.get(id).map(|(company, _)| company.clone()))
    }

    async fn incentive_embedding(&self, id: &str) -> FundmatchResult<Option<Vec<f32>>> {
        let map = self
            .incentives
            .read()
            .map_err(|e| FundmatchError::StoreUnavailable(e.to_string()))?;
        Ok(map.get(id).and_then(|(_, embedding)| embedding.clone()))
    }

    async fn nearest_companies(
        &self,
        query: &[f32],
        k: usize,
    ) -> FundmatchResult<Vec<(Company, f32)>> {
        let map = self
            .companies
            .read()
            .map_err(|e| FundmatchError::StoreUnavailable(e.to_string()))?;
        Ok(rank_nearest(
            map.iter()
                .map(|(id, (company, emb))| (id.clone(), company.clone(), emb.clone())),
            query,
            k,
        ))
    }

    async fn nearest_incentives(
        &self,
        query: &[f32],
        k: usize,
    ) -> FundmatchResult<Vec<(Incentive, f32)>> {
        let map = self
            .incentives
            .read()
            .map_err(|e| FundmatchError::StoreUnavailable(e.to_string()))?;
        Ok(rank_nearest(
            map.iter()
                .map(|(id, (incentive, emb))| (id.clone(), incentive.clone(), emb.clone())),
            query,
            k,
        ))
    }
}
