use crate::utils::regex::RegexPatterns;
use tracing::{debug, warn};

pub mod doc_tracker;

/// Default per-request spending cap.
pub const DEFAULT_REQUEST_BUDGET_EUR: f64 = 0.30;
/// Hard cap on planned output tokens regardless of remaining budget.
pub const DEFAULT_HARD_CAP_OUT: u32 = 800;
/// Marker inserted where the middle of an over-budget context was removed.
pub const ELISION_MARKER: &str = "[...contexto reduzido...]";

/// Fraction of the shrink budget kept from the head of the text.
const SHRINK_HEAD_RATIO: f64 = 0.7;

/// Calculate the maximum output tokens that fit within `budget_eur` given
/// the input already costs `input_tokens / 1e6 * price_in_per_million`.
///
/// Returns `(max_output_tokens, fits)`. `fits` is false when the input
/// alone consumes the budget or no output token can be afforded.
pub fn plan_output_tokens(
    input_tokens: u64,
    price_in_per_million: f64,
    price_out_per_million: f64,
    budget_eur: f64,
    hard_cap_out: u32,
) -> (u32, bool) {
    let cost_in = input_tokens as f64 / 1e6 * price_in_per_million;
    let remain = budget_eur - cost_in;

    if remain <= 0.0 {
        warn!(
            "input alone exceeds budget: €{:.4} > €{:.4}",
            cost_in, budget_eur
        );
        return (0, false);
    }

    let affordable = (remain / price_out_per_million * 1e6).floor() as u64;
    let planned = affordable.min(u64::from(hard_cap_out)) as u32;

    debug!(
        "budget plan: {} in + {} out under €{:.4}",
        input_tokens, planned, budget_eur
    );
    (planned, planned > 0)
}

/// Projected EUR cost of a request with known input and output token counts.
pub fn projected_cost(
    input_tokens: u64,
    output_tokens: u64,
    price_in_per_million: f64,
    price_out_per_million: f64,
) -> f64 {
    input_tokens as f64 / 1e6 * price_in_per_million
        + output_tokens as f64 / 1e6 * price_out_per_million
}

/// Shrink `text` so that `count(result) <= max_tokens`.
///
/// Whitespace is normalized first; if the text already fits it is returned
/// as-is. Otherwise 70% of the token budget is kept from the head and 30%
/// from the tail, joined by [`ELISION_MARKER`]. The char-per-token estimate
/// can overshoot, so the kept window is reduced until the count fits.
pub fn shrink_context(text: &str, max_tokens: usize, count: &dyn Fn(&str) -> usize) -> String {
    let cleaned = normalize_whitespace(text);
    let current = count(&cleaned);
    if current <= max_tokens {
        return cleaned;
    }

    let head_tokens = (max_tokens as f64 * SHRINK_HEAD_RATIO) as usize;
    let tail_tokens = max_tokens - head_tokens;
    let chars_per_token = cleaned.len() as f64 / current.max(1) as f64;

    let mut head_chars = (head_tokens as f64 * chars_per_token) as usize;
    let mut tail_chars = (tail_tokens as f64 * chars_per_token) as usize;

    loop {
        let head_end = floor_char_boundary(&cleaned, head_chars.min(cleaned.len()));
        let tail_start =
            floor_char_boundary(&cleaned, cleaned.len().saturating_sub(tail_chars));
        let result = format!(
            "{}\n\n{}\n\n{}",
            &cleaned[..head_end],
            ELISION_MARKER,
            &cleaned[tail_start..]
        );

        if count(&result) <= max_tokens {
            debug!("shrank context: {} -> <= {} tokens", current, max_tokens);
            return result;
        }
        if head_chars == 0 && tail_chars == 0 {
            // Nothing left to trim; the marker alone is the floor.
            return format!("\n\n{}\n\n", ELISION_MARKER);
        }
        // Overshot the token estimate; trim the window and retry.
        head_chars = head_chars * 9 / 10;
        tail_chars = tail_chars * 9 / 10;
    }
}

fn normalize_whitespace(text: &str) -> String {
    let pass = RegexPatterns::space_before_newline().replace_all(text, "\n");
    RegexPatterns::space_runs()
        .replace_all(&pass, " ")
        .into_owned()
}

/// Find the largest byte index <= `index` that is a valid char boundary.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
