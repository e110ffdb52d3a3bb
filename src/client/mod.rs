use crate::budget::doc_tracker::DocumentBudgetTracker;
use crate::budget::{DEFAULT_HARD_CAP_OUT, plan_output_tokens, projected_cost, shrink_context};
use crate::cache::{CostOp, CostStats, DailySummaryRow, ResponseCache};
use crate::config::Config;
use crate::errors::{FundmatchError, FundmatchResult};
use crate::pricing::{HttpRateSource, PriceOracle};
use crate::providers::openai::OpenAiEndpoint;
use crate::providers::{
    ChatMessage, CompletionRequest, ModelEndpoint, ResponseFormat,
};
use crate::tokenizer::TokenCounter;
use anyhow::Context;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Token target for the last user message when a request is shrunk to fit.
const SHRINK_TARGET_TOKENS: usize = 1000;

/// One chat request against the managed client.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    /// When absent, the planner derives the value from the request budget.
    pub max_tokens: Option<u32>,
    /// Request a JSON object body; the parsed value lands in
    /// [`ChatResult::structured`].
    pub structured: bool,
    /// Groups this call under a cumulative document budget.
    pub doc_tag: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            structured: false,
            doc_tag: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResult {
    pub text: String,
    pub structured: Option<Value>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub eur_cost: f64,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct EmbedResult {
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub tokens: u64,
    pub eur_cost: f64,
    pub from_cache: bool,
}

/// Single entrypoint for model calls: response cache in front, price-aware
/// budget planning, per-document ceilings, and cost accounting behind.
///
/// All collaborators are construction-time injected; the client holds no
/// ambient state, so tests pass fakes for the endpoint and rate source.
pub struct ManagedClient {
    endpoint: Arc<dyn ModelEndpoint>,
    oracle: PriceOracle,
    tokenizer: TokenCounter,
    cache: ResponseCache,
    doc_budget: DocumentBudgetTracker,
    request_budget_eur: f64,
}

impl ManagedClient {
    pub fn new(
        endpoint: Arc<dyn ModelEndpoint>,
        oracle: PriceOracle,
        cache: ResponseCache,
        doc_budget: DocumentBudgetTracker,
        request_budget_eur: f64,
    ) -> Self {
        Self {
            endpoint,
            oracle,
            tokenizer: TokenCounter::new(),
            cache,
            doc_budget,
            request_budget_eur,
        }
    }

    /// Wire up the production collaborators from configuration.
    pub fn from_config(config: &Config) -> FundmatchResult<Self> {
        let endpoint = Arc::new(OpenAiEndpoint::new(
            config.api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
        ));
        let oracle = PriceOracle::new(&config.price_cache_path, Box::new(HttpRateSource::new()))?;
        let cache = ResponseCache::new(&config.cache_path)?;
        let doc_budget = DocumentBudgetTracker::new(config.document_budget_eur);
        Ok(Self::new(
            endpoint,
            oracle,
            cache,
            doc_budget,
            config.request_budget_eur,
        ))
    }

    pub fn request_budget_eur(&self) -> f64 {
        self.request_budget_eur
    }

    pub fn document_budget(&self) -> &DocumentBudgetTracker {
        &self.doc_budget
    }

    /// Ledger statistics for a date (`YYYY-MM-DD`), defaulting to today.
    pub fn stats(&self, date: Option<&str>) -> FundmatchResult<CostStats> {
        Ok(self.cache.stats(date)?)
    }

    /// Per-day per-model ledger aggregates since `since_date`.
    pub fn daily_summary(&self, since_date: &str) -> FundmatchResult<Vec<DailySummaryRow>> {
        Ok(self.cache.daily_summary(since_date)?)
    }

    /// Chat completion with caching, budget enforcement and accounting.
    pub async fn chat(&self, req: ChatRequest) -> FundmatchResult<ChatResult> {
        let ChatRequest {
            mut messages,
            model,
            temperature,
            max_tokens,
            structured,
            doc_tag,
        } = req;

        let params = json!({
            "temperature": temperature,
            "max_tokens": max_tokens,
            "structured": structured,
        });
        // Cache key for this request; stays the pre-shrink prompt so an
        // identical repeat hits even when the context gets shrunk below.
        let prompt = flatten_messages(&messages);

        if let Some(hit) = self.cache.get_completion(&prompt, &model, &params)? {
            self.cache.record_cost(
                &model,
                CostOp::Chat,
                hit.input_tokens,
                hit.output_tokens,
                0.0,
                true,
            )?;
            info!(
                "chat cache hit for {} — saved €{:.6}",
                model, hit.original_cost_eur
            );
            return Ok(ChatResult {
                text: hit.text,
                structured: hit.structured,
                input_tokens: hit.input_tokens,
                output_tokens: hit.output_tokens,
                eur_cost: 0.0,
                from_cache: true,
            });
        }

        let prices = self.oracle.prices(&model).await?;
        let price_in = prices
            .input_per_million
            .with_context(|| format!("no input pricing for model {}", model))?;
        let price_out = prices
            .output_per_million
            .with_context(|| format!("no output pricing for model {}", model))?;

        let mut input_tokens = self.tokenizer.count(&model, &prompt)? as u64;

        let planned_out = match max_tokens {
            None => {
                let (mut planned, mut fits) = plan_output_tokens(
                    input_tokens,
                    price_in,
                    price_out,
                    self.request_budget_eur,
                    DEFAULT_HARD_CAP_OUT,
                );
                if !fits {
                    // Context too large for the cap: shrink the last user
                    // message once and re-plan.
                    if let Some(idx) = messages.iter().rposition(|m| m.role == "user") {
                        warn!(
                            "request over budget at {} input tokens, shrinking last user message",
                            input_tokens
                        );
                        let counter = |text: &str| {
                            self.tokenizer
                                .count(&model, text)
                                .unwrap_or(text.len() / 4)
                        };
                        let shrunk =
                            shrink_context(&messages[idx].content, SHRINK_TARGET_TOKENS, &counter);
                        messages[idx].content = shrunk;
                        let shrunk_prompt = flatten_messages(&messages);
                        input_tokens = self.tokenizer.count(&model, &shrunk_prompt)? as u64;
                        (planned, fits) = plan_output_tokens(
                            input_tokens,
                            price_in,
                            price_out,
                            self.request_budget_eur,
                            DEFAULT_HARD_CAP_OUT,
                        );
                    }
                }
                if !fits {
                    return Err(FundmatchError::BudgetExceeded {
                        model,
                        input_tokens,
                        budget_eur: self.request_budget_eur,
                    });
                }
                planned
            }
            Some(requested) => {
                let projected =
                    projected_cost(input_tokens, u64::from(requested), price_in, price_out);
                if projected > self.request_budget_eur {
                    return Err(FundmatchError::BudgetExceeded {
                        model,
                        input_tokens,
                        budget_eur: self.request_budget_eur,
                    });
                }
                requested
            }
        };

        let projected = projected_cost(input_tokens, u64::from(planned_out), price_in, price_out);
        if let Some(tag) = &doc_tag
            && !self.doc_budget.can_spend(tag, projected)
        {
            return Err(FundmatchError::DocumentBudgetExceeded {
                tag: tag.clone(),
                spent_eur: self.doc_budget.spent_for(tag),
                estimate_eur: projected,
                cap_eur: self.doc_budget.cap_eur(),
            });
        }

        info!(
            "chat request: model={} input_tokens={} max_tokens={} projected=€{:.6}",
            model, input_tokens, planned_out, projected
        );
        let response = self
            .endpoint
            .complete(CompletionRequest {
                model: &model,
                messages: &messages,
                temperature,
                max_tokens: planned_out,
                response_format: if structured {
                    Some(ResponseFormat::JsonObject)
                } else {
                    None
                },
            })
            .await
            .map_err(|e| FundmatchError::UpstreamFailure {
                model: model.clone(),
                input_tokens,
                message: e.to_string(),
            })?;

        // Parse before any accounting: a malformed structured body must
        // leave no cache entry and no ledger row.
        let structured_value = if structured {
            Some(serde_json::from_str::<Value>(&response.text).map_err(|e| {
                FundmatchError::ParseFailure {
                    model: model.clone(),
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    message: e.to_string(),
                }
            })?)
        } else {
            None
        };

        let actual_cost = projected_cost(
            response.input_tokens,
            response.output_tokens,
            price_in,
            price_out,
        );
        self.cache.put_completion(
            &prompt,
            &model,
            &params,
            &response.text,
            structured_value.as_ref(),
            response.input_tokens,
            response.output_tokens,
            actual_cost,
        )?;
        self.cache.record_cost(
            &model,
            CostOp::Chat,
            response.input_tokens,
            response.output_tokens,
            actual_cost,
            false,
        )?;
        if let Some(tag) = &doc_tag {
            self.doc_budget.record(tag, actual_cost);
        }
        info!(
            "chat response: model={} {} in + {} out = €{:.6}",
            model, response.input_tokens, response.output_tokens, actual_cost
        );

        Ok(ChatResult {
            text: response.text,
            structured: structured_value,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            eur_cost: actual_cost,
            from_cache: false,
        })
    }

    /// Embedding with caching and budget enforcement. No shrinking here —
    /// callers batch or split text upstream.
    pub async fn embed(
        &self,
        text: &str,
        model: &str,
        doc_tag: Option<&str>,
    ) -> FundmatchResult<EmbedResult> {
        if let Some(hit) = self.cache.get_embedding(text, model)? {
            self.cache
                .record_cost(model, CostOp::Embed, hit.tokens, 0, 0.0, true)?;
            info!(
                "embedding cache hit for {} — saved €{:.6}",
                model, hit.original_cost_eur
            );
            return Ok(EmbedResult {
                dimension: hit.vector.len(),
                vector: hit.vector,
                tokens: hit.tokens,
                eur_cost: 0.0,
                from_cache: true,
            });
        }

        let prices = self.oracle.prices(model).await?;
        let price_embed = prices
            .embedding_per_million
            .with_context(|| format!("no embedding pricing for model {}", model))?;

        let tokens = self.tokenizer.count(model, text)? as u64;
        let estimated = tokens as f64 / 1e6 * price_embed;
        if estimated > self.request_budget_eur {
            return Err(FundmatchError::BudgetExceeded {
                model: model.to_string(),
                input_tokens: tokens,
                budget_eur: self.request_budget_eur,
            });
        }
        if let Some(tag) = doc_tag
            && !self.doc_budget.can_spend(tag, estimated)
        {
            return Err(FundmatchError::DocumentBudgetExceeded {
                tag: tag.to_string(),
                spent_eur: self.doc_budget.spent_for(tag),
                estimate_eur: estimated,
                cap_eur: self.doc_budget.cap_eur(),
            });
        }

        let response = self.endpoint.embed(model, text).await.map_err(|e| {
            FundmatchError::UpstreamFailure {
                model: model.to_string(),
                input_tokens: tokens,
                message: e.to_string(),
            }
        })?;

        let actual_cost = response.tokens as f64 / 1e6 * price_embed;
        self.cache
            .put_embedding(text, model, &response.vector, response.tokens, actual_cost)?;
        self.cache
            .record_cost(model, CostOp::Embed, response.tokens, 0, actual_cost, false)?;
        if let Some(tag) = doc_tag {
            self.doc_budget.record(tag, actual_cost);
        }
        info!(
            "embedding created: model={} tokens={} dim={} €{:.6}",
            model,
            response.tokens,
            response.vector.len(),
            actual_cost
        );

        Ok(EmbedResult {
            dimension: response.vector.len(),
            vector: response.vector,
            tokens: response.tokens,
            eur_cost: actual_cost,
            from_cache: false,
        })
    }
}

/// Canonical prompt string used for token counting and cache keys.
fn flatten_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
