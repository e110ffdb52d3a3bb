use crate::store::{Company, Incentive};
use crate::utils::regex::RegexPatterns;
use std::collections::{HashMap, HashSet};

const K1: f64 = 1.2;
const B: f64 = 0.75;
const AVG_DOC_LEN: f64 = 50.0;
// Corpus IDF deliberately flat: stable scores over a changing corpus.
const FLAT_IDF: f64 = 1.0;
const SIGMOID_SCALE: f64 = 5.0;
const MAX_ELIGIBILITY_TERMS: usize = 3;

/// Short common terms of the corpus language, dropped before scoring.
const STOP_WORDS: &[&str] = &[
    "de", "da", "do", "em", "para", "com", "por", "que", "e", "a", "o", "as", "os", "um", "uma",
    "uns", "umas",
];

/// Lower-case, de-punctuate, split on whitespace, drop stop-words and
/// tokens shorter than 3 characters.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let no_punct = RegexPatterns::punctuation().replace_all(&lowered, " ");
    no_punct
        .split_whitespace()
        .filter(|token| token.chars().count() > 2 && !STOP_WORDS.contains(token))
        .map(std::string::ToString::to_string)
        .collect()
}

fn query_terms(incentive: &Incentive) -> HashSet<String> {
    let mut parts: Vec<String> = vec![incentive.title.clone()];
    if let Some(description) = &incentive.description {
        parts.push(description.clone());
    }
    if let Some(profile) = &incentive.profile {
        parts.extend(profile.investment_objectives.iter().cloned());
        parts.extend(profile.specific_purposes.iter().cloned());
        parts.extend(profile.sector_codes.iter().cloned());
        parts.extend(
            profile
                .eligibility_criteria
                .iter()
                .take(MAX_ELIGIBILITY_TERMS)
                .cloned(),
        );
    }
    tokenize(&parts.join(" ")).into_iter().collect()
}

fn document_terms(company: &Company) -> Vec<String> {
    let mut parts: Vec<String> = vec![company.name.clone()];
    parts.extend(company.sector_codes.iter().cloned());
    if let Some(description) = company.raw_description() {
        parts.push(description.to_string());
    }
    if let Some(district) = &company.district {
        parts.push(district.clone());
    }
    tokenize(&parts.join(" "))
}

/// BM25-style lexical score between an incentive's query bag and a
/// company's document bag, bounded to (0,1) via a sigmoid.
///
/// Term frequencies come from the document; IDF is flat; the raw sum is
/// normalized by the query size before the sigmoid. An incentive that
/// yields no query terms scores 0.0.
pub fn lexical_score(incentive: &Incentive, company: &Company) -> f64 {
    let query = query_terms(incentive);
    if query.is_empty() {
        return 0.0;
    }

    let doc = document_terms(company);
    let dl = doc.len() as f64;
    let mut tf: HashMap<&str, f64> = HashMap::new();
    for token in &doc {
        *tf.entry(token.as_str()).or_insert(0.0) += 1.0;
    }

    let mut score = 0.0;
    for term in &query {
        if let Some(&freq) = tf.get(term.as_str()) {
            score += freq * FLAT_IDF / (freq + K1 * (1.0 - B + B * dl / AVG_DOC_LEN));
        }
    }

    let normalized = score / query.len() as f64;
    sigmoid(SIGMOID_SCALE * normalized)
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
