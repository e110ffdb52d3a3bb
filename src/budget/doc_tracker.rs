use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Default cumulative cap per document tag.
pub const DEFAULT_DOCUMENT_BUDGET_EUR: f64 = 0.30;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBudgetStats {
    pub documents_tracked: usize,
    pub total_eur: f64,
    pub average_eur: f64,
    pub cap_eur: f64,
}

/// Tracks cumulative EUR spend per document tag and enforces a ceiling.
///
/// Callers check [`can_spend`](Self::can_spend) before issuing a request and
/// [`record`](Self::record) the actual cost after. The tracker itself never
/// blocks or schedules.
pub struct DocumentBudgetTracker {
    cap_eur: f64,
    spent: Mutex<HashMap<String, f64>>,
}

impl DocumentBudgetTracker {
    pub fn new(cap_eur: f64) -> Self {
        Self {
            cap_eur,
            spent: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap_eur(&self) -> f64 {
        self.cap_eur
    }

    /// True iff the tag's current spend plus `estimate_eur` stays within
    /// the cap.
    pub fn can_spend(&self, tag: &str, estimate_eur: f64) -> bool {
        let current = self.spent_for(tag);
        let total = current + estimate_eur;
        if total > self.cap_eur {
            warn!(
                "document budget refused for '{}': €{:.4} spent + €{:.4} estimated > cap €{:.4}",
                tag, current, estimate_eur, self.cap_eur
            );
            return false;
        }
        true
    }

    /// Add the actual cost of a completed call to the tag's total.
    pub fn record(&self, tag: &str, actual_eur: f64) {
        let Ok(mut spent) = self.spent.lock() else {
            warn!("document budget mutex poisoned — spend not recorded");
            return;
        };
        let total = spent.entry(tag.to_string()).or_insert(0.0);
        *total += actual_eur;
        info!(
            "document cost recorded for '{}': +€{:.4} (total €{:.4}, remaining €{:.4})",
            tag,
            actual_eur,
            *total,
            self.cap_eur - *total
        );
    }

    pub fn spent_for(&self, tag: &str) -> f64 {
        self.spent
            .lock()
            .map(|s| s.get(tag).copied().unwrap_or(0.0))
            .unwrap_or(0.0)
    }

    pub fn remaining(&self, tag: &str) -> f64 {
        self.cap_eur - self.spent_for(tag)
    }

    /// Forget a tag entirely, restoring its full budget.
    pub fn reset(&self, tag: &str) {
        if let Ok(mut spent) = self.spent.lock()
            && spent.remove(tag).is_some()
        {
            info!("document budget reset for '{}'", tag);
        }
    }

    pub fn stats(&self) -> DocumentBudgetStats {
        let Ok(spent) = self.spent.lock() else {
            return DocumentBudgetStats {
                documents_tracked: 0,
                total_eur: 0.0,
                average_eur: 0.0,
                cap_eur: self.cap_eur,
            };
        };
        let documents_tracked = spent.len();
        let total_eur: f64 = spent.values().sum();
        DocumentBudgetStats {
            documents_tracked,
            total_eur,
            average_eur: if documents_tracked > 0 {
                total_eur / documents_tracked as f64
            } else {
                0.0
            },
            cap_eur: self.cap_eur,
        }
    }
}

impl Default for DocumentBudgetTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DOCUMENT_BUDGET_EUR)
    }
}
