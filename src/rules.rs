// 🏷️ Provider Rules - Rules as Data
// Case-insensitive provider patterns with a fixed, stable priority order

use anyhow::{Context as AnyhowContext, Result};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRule {
    /// Rule ID for tracking
    pub id: String,

    /// Canonical provider name stamped on contracts
    pub provider: String,

    /// Regular expression, matched case-insensitively against the full description
    pub pattern: String,

    /// Priority (higher = tried first); equal priorities keep declaration order
    #[serde(default)]
    pub priority: i32,
}

impl ProviderRule {
    fn new(id: &str, provider: &str, pattern: &str, priority: i32) -> Self {
        ProviderRule {
            id: id.to_string(),
            provider: provider.to_string(),
            pattern: pattern.to_string(),
            priority,
        }
    }

    fn compile(self) -> Result<CompiledRule> {
        let regex = RegexBuilder::new(&self.pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid pattern for provider rule {}", self.id))?;
        Ok(CompiledRule { rule: self, regex })
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: ProviderRule,
    regex: Regex,
}

/// Built-in providers, in priority order
pub fn default_rules() -> Vec<ProviderRule> {
    vec![
        ProviderRule::new("affirm", "Affirm", r"\baffirm\b", 110),
        ProviderRule::new("afterpay", "Afterpay", r"\bafter\s?pay\b", 100),
        ProviderRule::new("klarna", "Klarna", r"\bklarna\b", 90),
        ProviderRule::new("zip", "Zip", r"\b(quad\s?pay|zip\s?pay|zip\.co)\b", 80),
        ProviderRule::new("sezzle", "Sezzle", r"\bsezzle\b", 70),
        ProviderRule::new(
            "paypal_pay_in_4",
            "PayPal",
            r"\bpaypal\b.{0,24}\b(pay\s?in\s?(4|four)|pay\s?later)\b",
            60,
        ),
        ProviderRule::new("apple_pay_later", "Apple Pay Later", r"\bapple\s?pay\s?later\b", 50),
        ProviderRule::new("splitit", "Splitit", r"\bsplitit\b", 40),
        ProviderRule::new("perpay", "Perpay", r"\bperpay\b", 30),
        ProviderRule::new("katapult", "Katapult", r"\bkatapult\b", 20),
        ProviderRule::new("uplift", "Uplift", r"\buplift\b", 10),
    ]
}

static DEFAULT_COMPILED: Lazy<Vec<CompiledRule>> = Lazy::new(|| {
    default_rules()
        .into_iter()
        .filter_map(|r| r.compile().ok())
        .collect()
});

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderMatch {
    pub provider: String,
    pub rule_id: String,

    /// Byte range of the match inside the searched text
    pub start: usize,
    pub end: usize,
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProviderRuleSet {
    rules: Vec<CompiledRule>,
}

impl ProviderRuleSet {
    /// Create an empty rule set
    pub fn new() -> Self {
        ProviderRuleSet { rules: Vec::new() }
    }

    /// Rule set with the built-in providers
    pub fn with_defaults() -> Self {
        ProviderRuleSet {
            rules: DEFAULT_COMPILED.clone(),
        }
    }

    /// Load rules from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

        let rules: Vec<ProviderRule> =
            serde_json::from_str(&content).context("Failed to parse rules JSON")?;

        ProviderRuleSet::from_rules(rules)
    }

    /// Create a rule set from a list of rules
    pub fn from_rules(rules: Vec<ProviderRule>) -> Result<Self> {
        let mut compiled = rules
            .into_iter()
            .map(ProviderRule::compile)
            .collect::<Result<Vec<_>>>()?;

        // Stable sort: ties keep declaration order, so reruns are deterministic
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(ProviderRuleSet { rules: compiled })
    }

    /// Add a single rule
    pub fn add_rule(&mut self, rule: ProviderRule) -> Result<()> {
        self.rules.push(rule.compile()?);
        self.rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(())
    }

    /// First matching provider in priority order
    pub fn classify(&self, text: &str) -> Option<ProviderMatch> {
        self.rules.iter().find_map(|compiled| {
            compiled.regex.find(text).map(|m| ProviderMatch {
                provider: compiled.rule.provider.clone(),
                rule_id: compiled.rule.id.clone(),
                start: m.start(),
                end: m.end(),
            })
        })
    }

    /// Whether the named provider's pattern occurs in `text`
    pub fn mentions_provider(&self, provider: &str, text: &str) -> bool {
        self.rules
            .iter()
            .filter(|c| c.rule.provider.eq_ignore_ascii_case(provider))
            .any(|c| c.regex.is_match(text))
            || text.to_lowercase().contains(&provider.to_lowercase())
    }

    /// Get number of rules loaded
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for ProviderRuleSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================
