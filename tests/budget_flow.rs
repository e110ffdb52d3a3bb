mod common;

use common::{harness, harness_with_budgets};
use fundmatch::client::ChatRequest;
use fundmatch::errors::FundmatchError;
use fundmatch::providers::ChatMessage;

// EUR per token with the 0.93 test rate and the gpt-4o-mini price sheet.
const IN_EUR: f64 = 0.15 * 0.93 / 1e6;
const OUT_EUR: f64 = 0.60 * 0.93 / 1e6;

#[tokio::test]
async fn small_request_proceeds_and_second_call_hits_the_cache() {
    let h = harness();
    let prompt = "incentivo às empresas ".repeat(60); // ≈200 tokens
    let mut req = ChatRequest::new(vec![ChatMessage::user(&prompt)], "gpt-4o-mini");
    req.max_tokens = Some(100);

    let first = h.client.chat(req.clone()).await.unwrap();
    assert!(!first.from_cache);
    let expected_cost = 200.0 * IN_EUR + 100.0 * OUT_EUR;
    assert!((first.eur_cost - expected_cost).abs() < 1e-9);
    assert!(first.eur_cost < 0.30);

    let second = h.client.chat(req).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.eur_cost, 0.0);
    assert_eq!(second.text, first.text);
    assert_eq!(h.endpoint.completion_call_count(), 1);

    let stats = h.client.stats(None).unwrap();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert!((stats.total_cost_eur - first.eur_cost).abs() < 1e-9);
}

#[tokio::test]
async fn giant_request_under_tiny_cap_never_reaches_upstream() {
    let h = harness_with_budgets(0.001, 0.30);
    let giant = "palavra incentivo empresa ".repeat(40_000); // ~1M chars
    let mut req = ChatRequest::new(vec![ChatMessage::user(&giant)], "gpt-4o-mini");
    req.max_tokens = Some(800);

    let err = h.client.chat(req).await.unwrap_err();
    assert!(matches!(err, FundmatchError::BudgetExceeded { .. }));

    // No upstream call, no cache entry, no uncached ledger row.
    assert_eq!(h.endpoint.completion_call_count(), 0);
    let stats = h.client.stats(None).unwrap();
    assert_eq!(stats.cache_misses, 0);
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.total_cost_eur, 0.0);
}

#[tokio::test]
async fn daily_summary_aggregates_the_ledger() {
    let h = harness();
    let mut req = ChatRequest::new(
        vec![ChatMessage::user("resumo de custos")],
        "gpt-4o-mini",
    );
    req.max_tokens = Some(50);
    h.client.chat(req).await.unwrap();
    h.client
        .embed("texto para vetor", "text-embedding-3-small", None)
        .await
        .unwrap();

    let rows = h.client.daily_summary("2000-01-01").unwrap();
    assert_eq!(rows.len(), 2);
    let models: Vec<&str> = rows.iter().map(|r| r.model.as_str()).collect();
    assert!(models.contains(&"gpt-4o-mini"));
    assert!(models.contains(&"text-embedding-3-small"));
}

#[tokio::test]
async fn document_cap_holds_across_mixed_operations() {
    let h = harness_with_budgets(0.30, 0.000_2);

    // Embedding spend lands on the tag first.
    h.client
        .embed("primeiro texto", "text-embedding-3-small", Some("doc-x"))
        .await
        .unwrap();

    // A chat projected over the remaining tag budget is refused.
    let mut req = ChatRequest::new(vec![ChatMessage::user("pergunta")], "gpt-4o-mini");
    req.max_tokens = Some(800); // ≈ €0.00045 projected output alone
    req.doc_tag = Some("doc-x".to_string());
    let err = h.client.chat(req).await.unwrap_err();
    assert!(matches!(err, FundmatchError::DocumentBudgetExceeded { .. }));

    // The tag total never exceeds its cap.
    assert!(h.client.document_budget().spent_for("doc-x") <= 0.000_2);
}
