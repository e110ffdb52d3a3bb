use crate::budget::DEFAULT_REQUEST_BUDGET_EUR;
use crate::budget::doc_tracker::DEFAULT_DOCUMENT_BUDGET_EUR;
use crate::providers::openai::DEFAULT_REQUEST_TIMEOUT_SECS;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";
const DEFAULT_CACHE_PATH: &str = ".cache/fundmatch_cache.db";
const DEFAULT_PRICE_CACHE_PATH: &str = ".cache/prices.json";

/// Runtime configuration for the core. Read-only after construction.
#[derive(Clone)]
pub struct Config {
    /// Upstream API credential.
    pub api_key: String,
    /// Per-request spending cap.
    pub request_budget_eur: f64,
    /// Per-document-tag cumulative spending cap.
    pub document_budget_eur: f64,
    /// Response cache database path.
    pub cache_path: PathBuf,
    /// Price book file path.
    pub price_cache_path: PathBuf,
    /// Chat model for re-ranking and answer generation.
    pub chat_model: String,
    /// Embedding model for query vectors.
    pub embed_model: String,
    /// Deadline for model endpoint calls, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            request_budget_eur: DEFAULT_REQUEST_BUDGET_EUR,
            document_budget_eur: DEFAULT_DOCUMENT_BUDGET_EUR,
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            price_cache_path: PathBuf::from(DEFAULT_PRICE_CACHE_PATH),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Build a configuration from `FUNDMATCH_*` environment variables,
    /// falling back to defaults for anything unset. The credential also
    /// honours `OPENAI_API_KEY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("FUNDMATCH_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .unwrap_or_default(),
            request_budget_eur: env_f64("FUNDMATCH_REQUEST_BUDGET_EUR", defaults.request_budget_eur),
            document_budget_eur: env_f64(
                "FUNDMATCH_DOCUMENT_BUDGET_EUR",
                defaults.document_budget_eur,
            ),
            cache_path: env_path("FUNDMATCH_CACHE_PATH", defaults.cache_path),
            price_cache_path: env_path("FUNDMATCH_PRICE_CACHE_PATH", defaults.price_cache_path),
            chat_model: env_string("FUNDMATCH_CHAT_MODEL", defaults.chat_model),
            embed_model: env_string("FUNDMATCH_EMBED_MODEL", defaults.embed_model),
            request_timeout_secs: env_u64(
                "FUNDMATCH_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("request_budget_eur", &self.request_budget_eur)
            .field("document_budget_eur", &self.document_budget_eur)
            .field("cache_path", &self.cache_path)
            .field("price_cache_path", &self.price_cache_path)
            .field("chat_model", &self.chat_model)
            .field("embed_model", &self.embed_model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    std::env::var(name).map(PathBuf::from).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid value for {}: '{}', using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid value for {}: '{}', using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
