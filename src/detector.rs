// 🔎 Lexical Detector - Is this debit part of an installment plan?
// Pure functions over the description text: provider patterns first,
// then generic installment wording.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::Transaction;
use crate::rules::{ProviderMatch, ProviderRuleSet};

/// Provider recorded when only generic installment wording matched
pub const GENERIC_PROVIDER: &str = "Generic";

/// Merchant hint when nothing usable is left after stripping
pub const UNKNOWN_MERCHANT: &str = "UNKNOWN";

static INSTALLMENT_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(installments?|instalments?|payment\s+plan|pay\s+in\s+\d+|pay\s+later|bnpl|split\s+pay(ment)?s?)\b",
    )
    .expect("installment keyword pattern is valid")
});

static MERCHANT_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\s+at\s+|@|\*)").expect("merchant separator pattern is valid")
});

/// Tokens that describe the payment rather than the merchant
const NOISE_TOKENS: [&str; 13] = [
    "PAYMENT", "PMT", "PYMT", "INSTALLMENT", "INSTALLMENTS", "PURCHASE", "ONLINE", "DEBIT",
    "ACH", "POS", "WWW", "COM", "OF",
];

/// True if the text carries generic BNPL wording
pub fn has_installment_keyword(text: &str) -> bool {
    INSTALLMENT_KEYWORDS.is_match(text)
}

// ============================================================================
// DETECTION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Provider whose pattern matched, if any
    pub provider_match: Option<ProviderMatch>,

    /// Generic installment wording found
    pub installment_keyword: bool,
}

impl Detection {
    pub fn is_candidate(&self) -> bool {
        self.provider_match.is_some() || self.installment_keyword
    }

    pub fn provider_name(&self) -> &str {
        self.provider_match
            .as_ref()
            .map(|m| m.provider.as_str())
            .unwrap_or(GENERIC_PROVIDER)
    }
}

/// A transaction classified as BNPL-related, with its grouping attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub txn: Transaction,
    pub provider: String,
    pub merchant_hint: String,
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct LexicalDetector {
    rules: ProviderRuleSet,
    max_hint_len: usize,
}

impl LexicalDetector {
    pub fn new(rules: ProviderRuleSet, max_hint_len: usize) -> Self {
        LexicalDetector {
            rules,
            max_hint_len,
        }
    }

    pub fn rules(&self) -> &ProviderRuleSet {
        &self.rules
    }

    /// Classify one description (plus optional merchant field)
    pub fn detect(&self, description: &str, merchant: Option<&str>) -> Detection {
        let provider_match = self.rules.classify(description);

        let installment_keyword = has_installment_keyword(description)
            || merchant.map(has_installment_keyword).unwrap_or(false);

        // A provider named only in the merchant field still counts
        let provider_match = provider_match.or_else(|| {
            merchant
                .and_then(|m| self.rules.classify(m))
                .map(|m| ProviderMatch {
                    start: 0,
                    end: 0,
                    ..m
                })
        });

        Detection {
            provider_match,
            installment_keyword,
        }
    }

    /// Candidate for clustering, or None if the transaction is not BNPL-like.
    /// Only outflows can be installments.
    pub fn candidate(&self, txn: &Transaction) -> Option<Candidate> {
        if !txn.is_outflow() {
            return None;
        }

        let detection = self.detect(&txn.description, txn.merchant.as_deref());
        if !detection.is_candidate() {
            return None;
        }

        let merchant_hint = self.merchant_hint(txn, detection.provider_match.as_ref());

        Some(Candidate {
            txn: txn.clone(),
            provider: detection.provider_name().to_string(),
            merchant_hint,
        })
    }

    pub fn candidates(&self, transactions: &[Transaction]) -> Vec<Candidate> {
        transactions.iter().filter_map(|t| self.candidate(t)).collect()
    }

    /// Weak merchant heuristic: text after an "at" / "@" / "*" separator,
    /// else the merchant field, else the description minus the provider
    pub fn merchant_hint(&self, txn: &Transaction, provider: Option<&ProviderMatch>) -> String {
        let description = txn.description.as_str();

        if let Some(sep) = MERCHANT_SEPARATOR.find(description) {
            let after = normalize_hint(&description[sep.end()..], self.max_hint_len);
            if after != UNKNOWN_MERCHANT {
                return after;
            }
        }

        if let Some(merchant) = txn.merchant.as_deref() {
            let from_field = self.strip_provider(merchant);
            let normalized = normalize_hint(&from_field, self.max_hint_len);
            if normalized != UNKNOWN_MERCHANT {
                return normalized;
            }
        }

        let remainder = match provider {
            Some(m) if m.end > m.start => {
                format!("{} {}", &description[..m.start], &description[m.end..])
            }
            _ => self.strip_provider(description),
        };
        normalize_hint(&remainder, self.max_hint_len)
    }

    fn strip_provider(&self, text: &str) -> String {
        match self.rules.classify(text) {
            Some(m) => format!("{} {}", &text[..m.start], &text[m.end..]),
            None => text.to_string(),
        }
    }
}

impl Default for LexicalDetector {
    fn default() -> Self {
        LexicalDetector::new(ProviderRuleSet::with_defaults(), 32)
    }
}

/// Case-fold, collapse punctuation, drop reference numbers and noise words,
/// truncate; `UNKNOWN` when nothing is left
pub fn normalize_hint(raw: &str, max_len: usize) -> String {
    let folded = raw.to_uppercase();
    let collapsed: String = folded
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let tokens: Vec<&str> = collapsed
        .split_whitespace()
        .filter(|t| !t.chars().any(|c| c.is_ascii_digit()))
        .filter(|t| !NOISE_TOKENS.contains(t))
        .collect();

    let joined = tokens.join(" ");
    let truncated: String = joined.chars().take(max_len).collect();
    let trimmed = truncated.trim_end();

    if trimmed.is_empty() {
        UNKNOWN_MERCHANT.to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::txn;

    #[test]
    fn test_provider_candidate() {
        let detector = LexicalDetector::default();
        let c = detector
            .candidate(&txn("t1", "2025-01-01", -5000, "AFFIRM * BESTBUY 4821"))
            .unwrap();

        assert_eq!(c.provider, "Affirm");
        assert_eq!(c.merchant_hint, "BESTBUY");
    }

    #[test]
    fn test_generic_keyword_candidate() {
        let detector = LexicalDetector::default();
        let c = detector
            .candidate(&txn("t1", "2025-01-01", -2500, "Installment 2 of 4 - Peloton"))
            .unwrap();

        assert_eq!(c.provider, GENERIC_PROVIDER);
        assert_eq!(c.merchant_hint, "PELOTON");
    }

    #[test]
    fn test_non_candidates() {
        let detector = LexicalDetector::default();

        assert!(detector
            .candidate(&txn("t1", "2025-01-01", -450, "STARBUCKS #4521"))
            .is_none());
        // Refund from a provider is an inflow, never an installment
        assert!(detector
            .candidate(&txn("t2", "2025-01-01", 5000, "KLARNA REFUND"))
            .is_none());
    }

    #[test]
    fn test_provider_only_in_merchant_field() {
        let detector = LexicalDetector::default();
        let mut t = txn("t1", "2025-01-01", -3000, "POS DEBIT 0192 ZARA");
        t.merchant = Some("Klarna".to_string());

        let c = detector.candidate(&t).unwrap();
        assert_eq!(c.provider, "Klarna");
        assert_eq!(c.merchant_hint, "ZARA");
    }

    #[test]
    fn test_merchant_hint_separators() {
        let detector = LexicalDetector::default();

        let hint = |d: &str| detector.merchant_hint(&txn("t", "2025-01-01", -1, d), None);

        assert_eq!(hint("AFTERPAY*ULTA BEAUTY #33"), "ULTA BEAUTY");
        assert_eq!(hint("Sezzle payment at Target.com"), "TARGET");
        assert_eq!(hint("KLARNA @ H&M"), "H M");
        assert_eq!(hint("AFFIRM PAYMENT"), UNKNOWN_MERCHANT);
    }

    #[test]
    fn test_normalize_hint_truncates() {
        let hint = normalize_hint("the very long merchant name that keeps going", 12);
        assert_eq!(hint, "THE VERY LON");
        assert_eq!(normalize_hint("  -- 1234 --  ", 32), UNKNOWN_MERCHANT);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let detector = LexicalDetector::default();
        let a = detector.detect("KLARNA AFFIRM SEZZLE", None);
        let b = detector.detect("KLARNA AFFIRM SEZZLE", None);

        assert_eq!(a, b);
        assert_eq!(a.provider_name(), "Affirm");
    }
}
