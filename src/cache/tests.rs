use super::*;
use serde_json::json;

fn temp_cache() -> (tempfile::TempDir, ResponseCache) {
    let tmp = tempfile::TempDir::new().expect("create temp dir");
    let cache = ResponseCache::new(tmp.path().join("cache.db")).expect("open cache");
    (tmp, cache)
}

#[test]
fn completion_roundtrip() {
    let (_tmp, cache) = temp_cache();
    let params = json!({"temperature": 0.0, "max_tokens": 100, "structured": false});

    assert!(
        cache
            .get_completion("prompt", "gpt-4o-mini", &params)
            .unwrap()
            .is_none()
    );

    cache
        .put_completion(
            "prompt",
            "gpt-4o-mini",
            &params,
            "resposta",
            None,
            42,
            7,
            0.0012,
        )
        .unwrap();

    let hit = cache
        .get_completion("prompt", "gpt-4o-mini", &params)
        .unwrap()
        .expect("cached completion");
    assert_eq!(hit.text, "resposta");
    assert_eq!(hit.input_tokens, 42);
    assert_eq!(hit.output_tokens, 7);
    assert!((hit.original_cost_eur - 0.0012).abs() < 1e-9);
    assert!(hit.structured.is_none());
}

#[test]
fn structured_payload_survives_roundtrip() {
    let (_tmp, cache) = temp_cache();
    let params = json!({"structured": true});
    let structured = json!({"rankings": [{"company_index": 1, "score": 8, "reason": "ok"}]});

    cache
        .put_completion(
            "p",
            "gpt-4o-mini",
            &params,
            "{...}",
            Some(&structured),
            10,
            20,
            0.001,
        )
        .unwrap();

    let hit = cache
        .get_completion("p", "gpt-4o-mini", &params)
        .unwrap()
        .unwrap();
    assert_eq!(hit.structured.unwrap(), structured);
}

#[test]
fn key_distinguishes_model_prompt_and_params() {
    let (_tmp, cache) = temp_cache();
    let params = json!({"temperature": 0.0});
    cache
        .put_completion("p", "gpt-4o-mini", &params, "a", None, 1, 1, 0.0)
        .unwrap();

    assert!(
        cache
            .get_completion("p", "gpt-4o", &params)
            .unwrap()
            .is_none()
    );
    assert!(
        cache
            .get_completion("other", "gpt-4o-mini", &params)
            .unwrap()
            .is_none()
    );
    assert!(
        cache
            .get_completion("p", "gpt-4o-mini", &json!({"temperature": 0.5}))
            .unwrap()
            .is_none()
    );
}

#[test]
fn param_key_order_does_not_matter() {
    let (_tmp, cache) = temp_cache();
    let a = json!({"temperature": 0.0, "max_tokens": 5});
    let b = json!({"max_tokens": 5, "temperature": 0.0});
    cache
        .put_completion("p", "m", &a, "x", None, 1, 1, 0.0)
        .unwrap();
    assert!(cache.get_completion("p", "m", &b).unwrap().is_some());
}

#[test]
fn hit_bumps_access_count() {
    let (_tmp, cache) = temp_cache();
    let params = json!({});
    cache
        .put_completion("p", "m", &params, "x", None, 1, 1, 0.0)
        .unwrap();
    assert_eq!(cache.completion_access_count("p", "m", &params).unwrap(), 1);

    cache.get_completion("p", "m", &params).unwrap();
    cache.get_completion("p", "m", &params).unwrap();
    assert_eq!(cache.completion_access_count("p", "m", &params).unwrap(), 3);
}

#[test]
fn put_is_idempotent() {
    let (_tmp, cache) = temp_cache();
    let params = json!({});
    cache
        .put_completion("p", "m", &params, "first", None, 1, 1, 0.1)
        .unwrap();
    cache
        .put_completion("p", "m", &params, "second", None, 2, 2, 0.2)
        .unwrap();
    let hit = cache.get_completion("p", "m", &params).unwrap().unwrap();
    assert_eq!(hit.text, "second");
}

#[test]
fn embedding_roundtrip() {
    let (_tmp, cache) = temp_cache();
    let vector: Vec<f32> = (0..1536).map(|i| i as f32 / 1536.0).collect();

    assert!(
        cache
            .get_embedding("texto", "text-embedding-3-small")
            .unwrap()
            .is_none()
    );
    cache
        .put_embedding("texto", "text-embedding-3-small", &vector, 7, 0.00001)
        .unwrap();

    let hit = cache
        .get_embedding("texto", "text-embedding-3-small")
        .unwrap()
        .expect("cached embedding");
    assert_eq!(hit.vector, vector);
    assert_eq!(hit.dimension, 1536);
    assert_eq!(hit.tokens, 7);
}

#[test]
fn ledger_stats_split_hits_and_misses() {
    let (_tmp, cache) = temp_cache();
    cache
        .record_cost("gpt-4o-mini", CostOp::Chat, 100, 50, 0.002, false)
        .unwrap();
    cache
        .record_cost("gpt-4o-mini", CostOp::Chat, 100, 50, 0.0, true)
        .unwrap();
    cache
        .record_cost("text-embedding-3-small", CostOp::Embed, 7, 0, 0.0001, false)
        .unwrap();

    let stats = cache.stats(None).unwrap();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
    assert!((stats.total_cost_eur - 0.0021).abs() < 1e-9);
    assert!((stats.actual_cost_eur - 0.0021).abs() < 1e-9);
    assert_eq!(stats.by_model.len(), 2);
    assert_eq!(stats.by_model[0].model, "gpt-4o-mini");
}

#[test]
fn stats_for_other_date_are_empty() {
    let (_tmp, cache) = temp_cache();
    cache
        .record_cost("gpt-4o-mini", CostOp::Chat, 1, 1, 0.5, false)
        .unwrap();
    let stats = cache.stats(Some("2001-01-01")).unwrap();
    assert_eq!(stats.cache_misses, 0);
    assert_eq!(stats.total_cost_eur, 0.0);
}

#[test]
fn daily_summary_groups_by_date_and_model() {
    let (_tmp, cache) = temp_cache();
    cache
        .record_cost("gpt-4o-mini", CostOp::Chat, 10, 5, 0.01, false)
        .unwrap();
    cache
        .record_cost("gpt-4o-mini", CostOp::Chat, 20, 10, 0.02, false)
        .unwrap();

    let rows = cache.daily_summary("2000-01-01").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].model, "gpt-4o-mini");
    assert_eq!(rows[0].calls, 2);
    assert_eq!(rows[0].input_tokens, 30);
    assert_eq!(rows[0].output_tokens, 15);
    assert!((rows[0].cost_eur - 0.03).abs() < 1e-9);
}

#[test]
fn cache_persists_across_reopen() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("cache.db");
    let params = json!({});
    {
        let cache = ResponseCache::new(&path).unwrap();
        cache
            .put_completion("p", "m", &params, "durable", None, 1, 1, 0.0)
            .unwrap();
    }
    let cache = ResponseCache::new(&path).unwrap();
    let hit = cache.get_completion("p", "m", &params).unwrap().unwrap();
    assert_eq!(hit.text, "durable");
}

#[test]
fn canonical_json_sorts_nested_keys() {
    let a = canonical_json(&json!({"b": {"y": 1, "x": 2}, "a": [1, 2]}));
    let b = canonical_json(&json!({"a": [1, 2], "b": {"x": 2, "y": 1}}));
    assert_eq!(a, b);
}
