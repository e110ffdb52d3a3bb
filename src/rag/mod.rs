use crate::client::{ChatRequest, ManagedClient};
use crate::config::{DEFAULT_CHAT_MODEL, DEFAULT_EMBED_MODEL};
use crate::errors::FundmatchResult;
use crate::providers::ChatMessage;
use crate::store::{Company, Incentive, MatchStore};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Canonical refusal sentence returned when no grounding exists. Callers
/// branch on it, so the wording is load-bearing.
pub const REFUSAL_PHRASE: &str =
    "Não tenho informação suficiente para responder a esta pergunta.";

const MAX_CONTENT_CHARS: usize = 500;
const ANSWER_MAX_TOKENS: u32 = 800;
const CONFIDENCE_BOOST: f64 = 1.2;

/// A cited source: identity, similarity and metadata — never full text.
#[derive(Debug, Clone)]
pub struct RagSource {
    pub kind: &'static str,
    pub id: String,
    pub title: String,
    pub similarity: f64,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub text: String,
    pub sources: Vec<RagSource>,
    pub confidence: f64,
    pub eur_cost: f64,
}

struct RetrievedDoc {
    kind: &'static str,
    id: String,
    title: String,
    content: String,
    metadata: Value,
    similarity: f64,
}

/// Grounded question answering over the incentive and company corpora.
pub struct RagEngine {
    store: Arc<dyn MatchStore>,
    client: Arc<ManagedClient>,
    chat_model: String,
    embed_model: String,
}

impl RagEngine {
    pub fn new(store: Arc<dyn MatchStore>, client: Arc<ManagedClient>) -> Self {
        Self::with_models(
            store,
            client,
            DEFAULT_CHAT_MODEL.to_string(),
            DEFAULT_EMBED_MODEL.to_string(),
        )
    }

    pub fn with_models(
        store: Arc<dyn MatchStore>,
        client: Arc<ManagedClient>,
        chat_model: String,
        embed_model: String,
    ) -> Self {
        Self {
            store,
            client,
            chat_model,
            embed_model,
        }
    }

    /// Answer a question from retrieved context only.
    ///
    /// Zero retrieval results degrade to the refusal phrase with confidence
    /// 0; the only cost incurred is the question embedding. `eur_cost` is
    /// the real summed cost of this query's embedding and completion calls.
    pub async fn answer(&self, question: &str, max_docs: usize) -> FundmatchResult<RagAnswer> {
        let doc_tag = format!("rag_{}", short_hash(question));
        let embedded = self
            .client
            .embed(question, &self.embed_model, Some(&doc_tag))
            .await?;
        let mut eur_cost = embedded.eur_cost;

        let documents = match self.retrieve(&embedded.vector, max_docs).await {
            Ok(documents) => documents,
            Err(e) => {
                warn!("retrieval failed, degrading to refusal: {}", e);
                Vec::new()
            }
        };

        if documents.is_empty() {
            info!("no grounding retrieved for question, returning refusal");
            return Ok(RagAnswer {
                text: REFUSAL_PHRASE.to_string(),
                sources: Vec::new(),
                confidence: 0.0,
                eur_cost,
            });
        }

        let prompt = build_prompt(question, &documents);
        let completion = self
            .client
            .chat(ChatRequest {
                messages: vec![ChatMessage::user(prompt)],
                model: self.chat_model.clone(),
                temperature: 0.0,
                max_tokens: Some(ANSWER_MAX_TOKENS),
                structured: false,
                doc_tag: Some(doc_tag),
            })
            .await?;
        eur_cost += completion.eur_cost;

        let mean_similarity =
            documents.iter().map(|d| d.similarity).sum::<f64>() / documents.len() as f64;
        let confidence = (CONFIDENCE_BOOST * mean_similarity).min(1.0);

        let sources = documents
            .into_iter()
            .map(|d| RagSource {
                kind: d.kind,
                id: d.id,
                title: d.title,
                similarity: d.similarity,
                metadata: d.metadata,
            })
            .collect();

        info!(
            "rag answer generated: confidence {:.2}, cost €{:.6}",
            confidence, eur_cost
        );
        Ok(RagAnswer {
            text: completion.text.trim().to_string(),
            sources,
            confidence,
            eur_cost,
        })
    }

    /// Dense retrieval over both corpora, merged by similarity descending
    /// with deterministic tie-breaks, capped at `max_docs` overall.
    async fn retrieve(
        &self,
        query: &[f32],
        max_docs: usize,
    ) -> FundmatchResult<Vec<RetrievedDoc>> {
        let incentives = self.store.nearest_incentives(query, max_docs).await?;
        let companies = self.store.nearest_companies(query, max_docs).await?;

        let mut documents: Vec<RetrievedDoc> = incentives
            .into_iter()
            .map(|(incentive, similarity)| incentive_doc(&incentive, similarity))
            .chain(
                companies
                    .into_iter()
                    .map(|(company, similarity)| company_doc(&company, similarity)),
            )
            .collect();

        documents.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.kind, &a.id).cmp(&(b.kind, &b.id)))
        });
        documents.truncate(max_docs);
        Ok(documents)
    }
}

fn incentive_doc(incentive: &Incentive, similarity: f32) -> RetrievedDoc {
    RetrievedDoc {
        kind: "incentive",
        id: incentive.incentive_id.clone(),
        title: incentive.title.clone(),
        content: format!(
            "{}\n{}",
            incentive.title,
            incentive.description.as_deref().unwrap_or("")
        ),
        metadata: json!({
            "publication_date": incentive.publication_date,
            "start_date": incentive.start_date,
            "end_date": incentive.end_date,
            "total_budget": incentive.total_budget,
            "source_link": incentive.source_link,
            "profile": incentive.profile,
        }),
        similarity: f64::from(similarity),
    }
}

fn company_doc(company: &Company, similarity: f32) -> RetrievedDoc {
    RetrievedDoc {
        kind: "company",
        id: company.company_id.clone(),
        title: company.name.clone(),
        content: format!(
            "{}\n{}",
            company.name,
            company.raw_description().unwrap_or("")
        ),
        metadata: json!({
            "sector_codes": company.sector_codes,
            "size": company.size,
            "district": company.district,
            "raw": company.raw,
        }),
        similarity: f64::from(similarity),
    }
}

fn build_prompt(question: &str, documents: &[RetrievedDoc]) -> String {
    let context: Vec<String> = documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "DOCUMENTO {} ({}):\nTítulo: {}\nConteúdo: {}\nMetadados: {}",
                i + 1,
                doc.kind.to_uppercase(),
                doc.title,
                truncate_chars(&doc.content, MAX_CONTENT_CHARS),
                doc.metadata
            )
        })
        .collect();

    format!(
        "Tu és um assistente especializado em incentivos públicos portugueses e empresas.\n\n\
         CONTEXTO RETRIEVED:\n{}\n\n\
         PERGUNTA DO UTILIZADOR:\n{}\n\n\
         INSTRUÇÕES:\n\
         1. Responde à pergunta baseando-te APENAS no contexto fornecido\n\
         2. Se não tiveres informação suficiente, diz \"{}\"\n\
         3. Inclui citações específicas dos documentos quando relevante\n\
         4. Sê preciso e útil\n\
         5. Responde em português\n\n\
         RESPOSTA:",
        context.join("\n\n"),
        question,
        REFUSAL_PHRASE.trim_end_matches('.')
    )
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push_str("...");
        truncated
    }
}

fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}
