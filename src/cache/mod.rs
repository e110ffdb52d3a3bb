use crate::embedding::{deserialize_embedding, serialize_embedding};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

/// Operation kind recorded in the cost ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostOp {
    Chat,
    Embed,
}

impl CostOp {
    fn as_str(self) -> &'static str {
        match self {
            CostOp::Chat => "chat",
            CostOp::Embed => "embed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedCompletion {
    pub text: String,
    pub structured: Option<Value>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub original_cost_eur: f64,
}

#[derive(Debug, Clone)]
pub struct CachedEmbedding {
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub tokens: u64,
    pub original_cost_eur: f64,
}

#[derive(Debug, Clone)]
pub struct ModelCostRow {
    pub model: String,
    pub cost_eur: f64,
    pub calls: i64,
}

#[derive(Debug, Clone)]
pub struct CostStats {
    pub date: String,
    pub total_cost_eur: f64,
    pub by_model: Vec<ModelCostRow>,
    pub cache_hits: i64,
    pub cache_misses: i64,
    pub actual_cost_eur: f64,
}

#[derive(Debug, Clone)]
pub struct DailySummaryRow {
    pub date: String,
    pub model: String,
    pub cost_eur: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub calls: i64,
}

/// Content-addressed persistent cache for completions and embeddings, plus
/// the append-only cost ledger.
///
/// Writes are single atomic `INSERT OR REPLACE` statements, so a crash
/// mid-write cannot leave a partial row behind.
pub struct ResponseCache {
    conn: std::sync::Mutex<Connection>,
}

impl ResponseCache {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create cache parent directory: {}",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open cache at: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;

        let cache = Self {
            conn: std::sync::Mutex::new(conn),
        };
        cache.ensure_schema().with_context(|| {
            format!("Failed to initialize cache schema at: {}", db_path.display())
        })?;
        info!("response cache ready at {}", db_path.display());
        Ok(cache)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS llm_cache (
                cache_key TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                response_text TEXT NOT NULL,
                response_json TEXT,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost_eur REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_accessed TEXT NOT NULL DEFAULT (datetime('now')),
                access_count INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS embedding_cache (
                cache_key TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                tokens INTEGER NOT NULL,
                cost_eur REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_accessed TEXT NOT NULL DEFAULT (datetime('now')),
                access_count INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cost_ledger (
                id INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                date TEXT NOT NULL,
                model TEXT NOT NULL,
                operation TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_eur REAL NOT NULL,
                from_cache INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_ledger_date ON cost_ledger(date);
             CREATE INDEX IF NOT EXISTS idx_ledger_model ON cost_ledger(model);",
        )?;

        Ok(())
    }

    /// Cache key for a completion: `sha256(model :: prompt :: canonical-params)`.
    fn completion_key(model: &str, prompt: &str, params_json: &Value) -> String {
        let canonical = canonical_json(params_json);
        hash_text(&format!("{}::{}::{}", model, prompt, canonical))
    }

    /// Cache key for an embedding: `sha256(model :: text)`.
    fn embedding_key(model: &str, text: &str) -> String {
        hash_text(&format!("{}::{}", model, text))
    }

    /// Look up a cached completion. On hit, bumps the access stats.
    pub fn get_completion(
        &self,
        prompt: &str,
        model: &str,
        params_json: &Value,
    ) -> Result<Option<CachedCompletion>> {
        let key = Self::completion_key(model, prompt, params_json);
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;

        let row = conn
            .query_row(
                "SELECT response_text, response_json, input_tokens, output_tokens, cost_eur
                 FROM llm_cache WHERE cache_key = ?",
                [&key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((text, structured_json, input_tokens, output_tokens, cost_eur)) = row else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE llm_cache
             SET last_accessed = datetime('now'), access_count = access_count + 1
             WHERE cache_key = ?",
            [&key],
        )?;
        debug!(
            "completion cache hit ({}), saved €{:.6}",
            &key[..8],
            cost_eur
        );

        let structured = match structured_json {
            Some(json) => Some(serde_json::from_str(&json).context("cached structured JSON")?),
            None => None,
        };
        Ok(Some(CachedCompletion {
            text,
            structured,
            input_tokens: input_tokens as u64,
            output_tokens: output_tokens as u64,
            original_cost_eur: cost_eur,
        }))
    }

    /// Insert-or-replace a completion, keyed by the same hash as the lookup.
    #[allow(clippy::too_many_arguments)]
    pub fn put_completion(
        &self,
        prompt: &str,
        model: &str,
        params_json: &Value,
        response_text: &str,
        structured: Option<&Value>,
        input_tokens: u64,
        output_tokens: u64,
        cost_eur: f64,
    ) -> Result<()> {
        let key = Self::completion_key(model, prompt, params_json);
        let structured_json = structured.map(std::string::ToString::to_string);
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        conn.execute(
            "INSERT OR REPLACE INTO llm_cache
             (cache_key, model, response_text, response_json, input_tokens, output_tokens, cost_eur)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                key,
                model,
                response_text,
                structured_json,
                input_tokens as i64,
                output_tokens as i64,
                cost_eur,
            ],
        )?;
        debug!("completion cached ({}), €{:.6}", &key[..8], cost_eur);
        Ok(())
    }

    /// Look up a cached embedding. On hit, bumps the access stats.
    pub fn get_embedding(&self, text: &str, model: &str) -> Result<Option<CachedEmbedding>> {
        let key = Self::embedding_key(model, text);
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;

        let row = conn
            .query_row(
                "SELECT embedding, dimension, tokens, cost_eur
                 FROM embedding_cache WHERE cache_key = ?",
                [&key],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((blob, dimension, tokens, cost_eur)) = row else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE embedding_cache
             SET last_accessed = datetime('now'), access_count = access_count + 1
             WHERE cache_key = ?",
            [&key],
        )?;
        debug!("embedding cache hit ({}), saved €{:.6}", &key[..8], cost_eur);

        Ok(Some(CachedEmbedding {
            vector: deserialize_embedding(&blob)?,
            dimension: dimension as usize,
            tokens: tokens as u64,
            original_cost_eur: cost_eur,
        }))
    }

    pub fn put_embedding(
        &self,
        text: &str,
        model: &str,
        vector: &[f32],
        tokens: u64,
        cost_eur: f64,
    ) -> Result<()> {
        let key = Self::embedding_key(model, text);
        let blob = serialize_embedding(vector);
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        conn.execute(
            "INSERT OR REPLACE INTO embedding_cache
             (cache_key, model, embedding, dimension, tokens, cost_eur)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                key,
                model,
                blob,
                vector.len() as i64,
                tokens as i64,
                cost_eur,
            ],
        )?;
        Ok(())
    }

    /// Append a row to the cost ledger.
    pub fn record_cost(
        &self,
        model: &str,
        op: CostOp,
        input_tokens: u64,
        output_tokens: u64,
        cost_eur: f64,
        from_cache: bool,
    ) -> Result<()> {
        let date = Utc::now().date_naive().to_string();
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        conn.execute(
            "INSERT INTO cost_ledger
             (date, model, operation, input_tokens, output_tokens, cost_eur, from_cache)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                date,
                model,
                op.as_str(),
                input_tokens as i64,
                output_tokens as i64,
                cost_eur,
                i64::from(from_cache),
            ],
        )?;
        Ok(())
    }

    /// Cost statistics for a date (`YYYY-MM-DD`), defaulting to today.
    pub fn stats(&self, date: Option<&str>) -> Result<CostStats> {
        let date = date
            .map(std::string::ToString::to_string)
            .unwrap_or_else(|| Utc::now().date_naive().to_string());
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;

        let total_cost_eur: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_eur), 0.0) FROM cost_ledger WHERE date = ?",
            [&date],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT model, SUM(cost_eur), COUNT(*)
             FROM cost_ledger WHERE date = ?
             GROUP BY model ORDER BY SUM(cost_eur) DESC",
        )?;
        let by_model = stmt
            .query_map([&date], |row| {
                Ok(ModelCostRow {
                    model: row.get(0)?,
                    cost_eur: row.get(1)?,
                    calls: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let (cache_hits, cache_misses, actual_cost_eur): (i64, i64, f64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN from_cache = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN from_cache = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN from_cache = 0 THEN cost_eur ELSE 0.0 END), 0.0)
             FROM cost_ledger WHERE date = ?",
            [&date],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(CostStats {
            date,
            total_cost_eur,
            by_model,
            cache_hits,
            cache_misses,
            actual_cost_eur,
        })
    }

    /// Per-day per-model ledger aggregates since `since_date` (`YYYY-MM-DD`).
    pub fn daily_summary(&self, since_date: &str) -> Result<Vec<DailySummaryRow>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        let mut stmt = conn.prepare(
            "SELECT date, model,
                    SUM(cost_eur), SUM(input_tokens), SUM(output_tokens), COUNT(*)
             FROM cost_ledger
             WHERE date >= ?
             GROUP BY date, model
             ORDER BY date DESC, SUM(cost_eur) DESC",
        )?;
        let rows = stmt
            .query_map([since_date], |row| {
                Ok(DailySummaryRow {
                    date: row.get(0)?,
                    model: row.get(1)?,
                    cost_eur: row.get(2)?,
                    input_tokens: row.get(3)?,
                    output_tokens: row.get(4)?,
                    calls: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Access counter for a completion entry (diagnostics).
    pub fn completion_access_count(
        &self,
        prompt: &str,
        model: &str,
        params_json: &Value,
    ) -> Result<i64> {
        let key = Self::completion_key(model, prompt, params_json);
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        let count = conn
            .query_row(
                "SELECT access_count FROM llm_cache WHERE cache_key = ?",
                [&key],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }
}

fn hash_text(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Render a JSON value with object keys sorted at every level, so logically
/// identical parameter sets hash identically.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<String, Value> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[cfg(test)]
mod tests;
