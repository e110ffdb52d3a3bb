use crate::client::{ChatRequest, ManagedClient};
use crate::errors::FundmatchError;
use crate::providers::ChatMessage;
use crate::store::{Company, Incentive};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// At most this many candidates are sent for model re-ranking.
pub(crate) const MAX_RERANK_CANDIDATES: usize = 20;
/// Mid-scale score given to candidates the model did not rank.
pub(crate) const MISSING_SCORE: f64 = 0.5;

const MAX_PROMPT_SECTORS: usize = 3;
const MAX_PROMPT_CRITERIA: usize = 3;

const SYSTEM_PROMPT: &str =
    "És um especialista em matching de incentivos públicos com empresas.";

/// Closed re-rank response schema, validated on parse.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RankingResponse {
    rankings: Vec<RankingEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RankingEntry {
    company_index: i64,
    score: f64,
    #[serde(default)]
    reason: String,
}

enum AttemptError {
    /// Response arrived but was malformed; worth one repair re-prompt.
    Invalid(String),
    /// Transport/budget failure; degrade immediately.
    Failed(String),
}

impl AttemptError {
    fn detail(&self) -> &str {
        match self {
            AttemptError::Invalid(detail) | AttemptError::Failed(detail) => detail,
        }
    }
}

/// Model-based re-ranking of matching candidates.
///
/// Failures never propagate: a malformed response gets exactly one repair
/// re-prompt with the validation error appended, and anything else degrades
/// to the empty mapping so fusion proceeds without the model component.
pub(crate) struct Reranker {
    client: Arc<ManagedClient>,
    model: String,
}

impl Reranker {
    pub(crate) fn new(client: Arc<ManagedClient>, model: String) -> Self {
        Self { client, model }
    }

    /// Returns `company_id -> (score in [0,1], reason)`.
    pub(crate) async fn rerank(
        &self,
        incentive: &Incentive,
        companies: &[Company],
    ) -> HashMap<String, (f64, String)> {
        if companies.is_empty() {
            return HashMap::new();
        }
        let companies = &companies[..companies.len().min(MAX_RERANK_CANDIDATES)];
        let prompt = build_prompt(incentive, companies);
        let doc_tag = format!("rerank_{}", incentive.incentive_id);

        match self.attempt(&prompt, &doc_tag, None, companies.len()).await {
            Ok(scores) => {
                info!(
                    "re-ranked {} candidates for {}",
                    companies.len(),
                    incentive.incentive_id
                );
                index_to_ids(scores, companies)
            }
            Err(AttemptError::Invalid(detail)) => {
                warn!("re-rank response invalid ({}), repairing once", detail);
                match self
                    .attempt(&prompt, &doc_tag, Some(&detail), companies.len())
                    .await
                {
                    Ok(scores) => index_to_ids(scores, companies),
                    Err(e) => {
                        warn!("re-rank degraded after repair: {}", e.detail());
                        HashMap::new()
                    }
                }
            }
            Err(e) => {
                warn!("re-rank degraded: {}", e.detail());
                HashMap::new()
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        doc_tag: &str,
        validation_error: Option<&str>,
        candidate_count: usize,
    ) -> Result<HashMap<usize, (f64, String)>, AttemptError> {
        let mut messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];
        if let Some(error) = validation_error {
            messages.push(ChatMessage::user(format!(
                "A resposta anterior era inválida ({}). Responde novamente apenas com JSON válido no formato pedido.",
                error
            )));
        }

        let request = ChatRequest {
            messages,
            model: self.model.clone(),
            temperature: 0.0,
            max_tokens: None,
            structured: true,
            doc_tag: Some(doc_tag.to_string()),
        };

        match self.client.chat(request).await {
            Ok(result) => {
                let body = result
                    .structured
                    .ok_or_else(|| AttemptError::Invalid("missing structured body".into()))?;
                parse_rankings(&body, candidate_count).map_err(AttemptError::Invalid)
            }
            Err(FundmatchError::ParseFailure { message, .. }) => {
                Err(AttemptError::Invalid(message))
            }
            Err(e) => Err(AttemptError::Failed(e.to_string())),
        }
    }
}

/// Validate a re-rank body against the closed schema: every index in
/// `1..=n` at most once, scores in `0..=10`. Scores map to [0,1].
fn parse_rankings(
    body: &Value,
    candidate_count: usize,
) -> Result<HashMap<usize, (f64, String)>, String> {
    let response: RankingResponse =
        serde_json::from_value(body.clone()).map_err(|e| e.to_string())?;

    let mut scores = HashMap::new();
    for entry in response.rankings {
        if entry.company_index < 1 || entry.company_index > candidate_count as i64 {
            return Err(format!(
                "company_index {} fora do intervalo 1..={}",
                entry.company_index, candidate_count
            ));
        }
        if !(0.0..=10.0).contains(&entry.score) {
            return Err(format!("score {} fora do intervalo 0..=10", entry.score));
        }
        let index = (entry.company_index - 1) as usize;
        if scores
            .insert(index, (entry.score / 10.0, entry.reason))
            .is_some()
        {
            return Err(format!("company_index {} duplicado", entry.company_index));
        }
    }
    Ok(scores)
}

fn index_to_ids(
    scores: HashMap<usize, (f64, String)>,
    companies: &[Company],
) -> HashMap<String, (f64, String)> {
    scores
        .into_iter()
        .filter_map(|(index, value)| {
            companies
                .get(index)
                .map(|company| (company.company_id.clone(), value))
        })
        .collect()
}

fn build_prompt(incentive: &Incentive, companies: &[Company]) -> String {
    let mut incentive_block = format!(
        "Incentivo: {}\nDescrição: {}",
        incentive.title,
        incentive.description.as_deref().unwrap_or("N/A")
    );
    if let Some(profile) = &incentive.profile {
        if !profile.investment_objectives.is_empty() {
            incentive_block.push_str(&format!(
                "\nObjetivos: {}",
                profile.investment_objectives.join(", ")
            ));
        }
        if !profile.eligibility_criteria.is_empty() {
            let criteria: Vec<&str> = profile
                .eligibility_criteria
                .iter()
                .take(MAX_PROMPT_CRITERIA)
                .map(String::as_str)
                .collect();
            incentive_block.push_str(&format!("\nCritérios: {}", criteria.join(", ")));
        }
    }

    let companies_block: Vec<String> = companies
        .iter()
        .enumerate()
        .map(|(i, company)| {
            let mut line = format!("{}. {}", i + 1, company.name);
            if !company.sector_codes.is_empty() {
                let codes: Vec<&str> = company
                    .sector_codes
                    .iter()
                    .take(MAX_PROMPT_SECTORS)
                    .map(String::as_str)
                    .collect();
                line.push_str(&format!(" (CAE: {})", codes.join(", ")));
            }
            if let Some(district) = &company.district {
                line.push_str(&format!(" - {}", district));
            }
            line
        })
        .collect();

    format!(
        "Avalia a adequação destas empresas ao seguinte incentivo.\n\n{}\n\nEmpresas:\n{}\n\n\
         Para cada empresa, atribui:\n\
         1. Score de 0-10 (0=inadequada, 10=perfeita)\n\
         2. Breve explicação (2-3 palavras)\n\n\
         Responde em JSON:\n\
         {{\"rankings\": [{{\"company_index\": 1, \"score\": 8, \"reason\": \"Área relevante, localização adequada\"}}]}}",
        incentive_block,
        companies_block.join("\n")
    )
}
