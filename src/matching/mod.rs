use crate::client::ManagedClient;
use crate::config::DEFAULT_CHAT_MODEL;
use crate::errors::{FundmatchError, FundmatchResult};
use crate::store::{Company, MatchStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub mod filters;
pub mod lexical;
mod rerank;

pub use filters::PenaltyConfig;

use filters::deterministic_penalty;
use lexical::lexical_score;
use rerank::{MAX_RERANK_CANDIDATES, MISSING_SCORE, Reranker};

/// Fusion weights over the component scores. Defaults sum to 1; when the
/// model component is unavailable the remaining weights are renormalized.
#[derive(Debug, Clone)]
pub struct MatchWeights {
    pub vector: f64,
    pub lexical: f64,
    pub llm: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            vector: 0.50,
            lexical: 0.20,
            llm: 0.30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub weights: MatchWeights,
    pub penalties: PenaltyConfig,
    pub chat_model: String,
    pub top_k: usize,
    pub candidate_pool: usize,
    pub use_llm: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            weights: MatchWeights::default(),
            penalties: PenaltyConfig::default(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            top_k: 5,
            candidate_pool: 100,
            use_llm: true,
        }
    }
}

/// Per-candidate component breakdown. `llm` is `None` when fusion ran
/// without the model component.
#[derive(Debug, Clone)]
pub struct ComponentScores {
    pub vector: f64,
    pub lexical: f64,
    pub llm: Option<f64>,
    pub penalty: f64,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub company_id: String,
    pub company_name: String,
    pub score: f64,
    pub explanation: String,
    pub penalties_applied: BTreeMap<&'static str, f64>,
    pub components: ComponentScores,
}

struct ScoredCandidate {
    company: Company,
    vector: f64,
    lexical: f64,
    penalty: f64,
    fired: BTreeMap<&'static str, f64>,
}

/// Hybrid match pipeline: vector candidate pool, deterministic penalties,
/// lexical scoring, optional model re-ranking, weighted fusion.
pub struct MatchEngine {
    store: Arc<dyn MatchStore>,
    client: Arc<ManagedClient>,
    config: MatchConfig,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn MatchStore>, client: Arc<ManagedClient>, config: MatchConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Rank companies for an incentive with the configured defaults.
    pub async fn find_matches(&self, incentive_id: &str) -> FundmatchResult<Vec<MatchResult>> {
        self.find_matches_with(
            incentive_id,
            self.config.top_k,
            self.config.candidate_pool,
            self.config.use_llm,
        )
        .await
    }

    /// Rank companies for an incentive with explicit pipeline parameters.
    pub async fn find_matches_with(
        &self,
        incentive_id: &str,
        top_k: usize,
        candidate_pool: usize,
        use_llm: bool,
    ) -> FundmatchResult<Vec<MatchResult>> {
        let incentive = self
            .store
            .get_incentive(incentive_id)
            .await?
            .ok_or_else(|| FundmatchError::NotFound {
                kind: "incentive",
                id: incentive_id.to_string(),
            })?;
        let embedding = self
            .store
            .incentive_embedding(incentive_id)
            .await?
            .ok_or_else(|| FundmatchError::NotFound {
                kind: "incentive embedding",
                id: incentive_id.to_string(),
            })?;

        let candidates = self
            .store
            .nearest_companies(&embedding, candidate_pool)
            .await?;
        info!(
            "retrieved {} candidates for incentive {}",
            candidates.len(),
            incentive_id
        );

        let weights = &self.config.weights;
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|(company, similarity)| {
                let (penalty, fired) =
                    deterministic_penalty(&incentive, &company, &self.config.penalties);
                let lexical = lexical_score(&incentive, &company);
                ScoredCandidate {
                    company,
                    vector: f64::from(similarity),
                    lexical,
                    penalty,
                    fired,
                }
            })
            .collect();

        // Preliminary fusion (vector + lexical) selects who gets re-ranked.
        let prelim =
            |c: &ScoredCandidate| (weights.vector * c.vector + weights.lexical * c.lexical) * c.penalty;
        scored.sort_by(|a, b| {
            prelim(b)
                .partial_cmp(&prelim(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.company.company_id.cmp(&b.company.company_id))
        });

        let llm_scores = if use_llm {
            let top: Vec<Company> = scored
                .iter()
                .take(MAX_RERANK_CANDIDATES)
                .map(|c| c.company.clone())
                .collect();
            Reranker::new(self.client.clone(), self.config.chat_model.clone())
                .rerank(&incentive, &top)
                .await
        } else {
            std::collections::HashMap::new()
        };

        // An empty re-rank drops the model component; renormalize so the
        // active weights still sum to 1.
        let llm_active = use_llm && !llm_scores.is_empty();
        let passive_denominator = weights.vector + weights.lexical;

        // Final fusion covers the re-ranked window only: the mid-scale
        // default applies to indices missing from the model's response,
        // never to candidates that were not sent at all.
        if llm_active {
            scored.truncate(MAX_RERANK_CANDIDATES);
        }

        let mut results: Vec<MatchResult> = scored
            .into_iter()
            .map(|candidate| {
                let (llm, reason) = if llm_active {
                    llm_scores
                        .get(&candidate.company.company_id)
                        .cloned()
                        .unwrap_or((MISSING_SCORE, String::new()))
                } else {
                    (0.0, String::new())
                };

                let score = if llm_active {
                    (weights.vector * candidate.vector
                        + weights.lexical * candidate.lexical
                        + weights.llm * llm)
                        * candidate.penalty
                } else {
                    ((weights.vector * candidate.vector + weights.lexical * candidate.lexical)
                        / passive_denominator)
                        * candidate.penalty
                };

                let explanation = build_explanation(&reason, &candidate.fired);
                MatchResult {
                    company_id: candidate.company.company_id,
                    company_name: candidate.company.name,
                    score,
                    explanation,
                    penalties_applied: candidate.fired,
                    components: ComponentScores {
                        vector: candidate.vector,
                        lexical: candidate.lexical,
                        llm: if llm_active { Some(llm) } else { None },
                        penalty: candidate.penalty,
                    },
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.company_id.cmp(&b.company_id))
        });
        results.truncate(top_k);

        info!(
            "matching complete for {}: {} results, top score {:.4}",
            incentive_id,
            results.len(),
            results.first().map_or(0.0, |r| r.score)
        );
        Ok(results)
    }
}

fn build_explanation(reason: &str, fired: &BTreeMap<&'static str, f64>) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !reason.is_empty() {
        parts.push(reason.to_string());
    }
    if !fired.is_empty() {
        let summary = fired
            .iter()
            .map(|(rule, factor)| format!("{}: {:.0}%", rule, factor * 100.0))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("Penalizações: {}", summary));
    }
    if parts.is_empty() {
        "Match baseado em similaridade".to_string()
    } else {
        parts.join(". ")
    }
}
