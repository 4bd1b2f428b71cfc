// 🔗 Reconciliation Matcher - Score ledger debits against open installments
//
// score = 0.6 × amount + 0.3 × date + 0.1 × keyword
//
// Planning is pure: it works on in-memory copies and tracks how much of each
// transaction is still available, so a plan never spends the same cents
// twice. The store re-checks every application inside its own transaction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::contract::{Contract, Installment};
use crate::db::Transaction;
use crate::detector::{LexicalDetector, UNKNOWN_MERCHANT};

pub const AMOUNT_WEIGHT: f64 = 0.6;
pub const DATE_WEIGHT: f64 = 0.3;
pub const KEYWORD_WEIGHT: f64 = 0.1;

/// Score for inflows, and for debits outside the date window or the amount tolerance
pub const EXCLUDED_SCORE: f64 = -1.0;

// ============================================================================
// SCORE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub amount: f64,
    pub date: f64,
    pub keyword: f64,
    pub total: f64,
}

impl MatchScore {
    fn excluded() -> Self {
        MatchScore {
            amount: 0.0,
            date: 0.0,
            keyword: 0.0,
            total: EXCLUDED_SCORE,
        }
    }

    pub fn is_excluded(&self) -> bool {
        self.total < 0.0
    }
}

/// One planned application of funds to an installment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub installment_id: String,
    pub txn_id: String,
    pub amount_cents: i64,
    pub confidence: f64,
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct ReconciliationMatcher<'a> {
    config: &'a EngineConfig,
    detector: &'a LexicalDetector,
}

impl<'a> ReconciliationMatcher<'a> {
    pub fn new(config: &'a EngineConfig, detector: &'a LexicalDetector) -> Self {
        ReconciliationMatcher { config, detector }
    }

    /// 1 at an exact match, linear to 0 at the looser of the two tolerances
    pub fn amount_score(&self, expected_cents: i64, actual_cents: i64) -> f64 {
        let tolerance = self.config.match_amount_tolerance(expected_cents);
        if tolerance <= 0 {
            return if expected_cents == actual_cents { 1.0 } else { 0.0 };
        }

        let diff = (expected_cents - actual_cents).abs() as f64;
        (1.0 - diff / tolerance as f64).clamp(0.0, 1.0)
    }

    /// 1 on the due date, linear to 0 at the edge of the asymmetric window.
    /// None outside the window.
    pub fn date_score(&self, installment: &Installment, txn: &Transaction) -> Option<f64> {
        let offset = (txn.posted_date - installment.due_date).num_days();

        let window = if offset < 0 {
            self.config.match_days_before
        } else {
            self.config.match_days_after
        };

        if offset.abs() > window {
            return None;
        }
        if window == 0 {
            return Some(1.0);
        }

        Some(1.0 - offset.abs() as f64 / window as f64)
    }

    /// Provider name or generic BNPL wording present → 1.
    /// Otherwise the merchant decides; with no merchant to filter on, 0.5.
    pub fn keyword_score(&self, contract: &Contract, txn: &Transaction) -> f64 {
        let text = txn.search_text();

        if self.detector.rules().mentions_provider(&contract.provider, &text) {
            return 1.0;
        }

        let detection = self.detector.detect(&txn.description, txn.merchant.as_deref());
        if detection.installment_keyword && detection.provider_match.is_none() {
            return 1.0;
        }

        if contract.merchant.is_empty() || contract.merchant == UNKNOWN_MERCHANT {
            return 0.5;
        }

        if text.to_uppercase().contains(&contract.merchant) {
            1.0
        } else {
            0.0
        }
    }

    /// Weighted score of `txn` against the unpaid remainder of `installment`
    pub fn score(&self, contract: &Contract, installment: &Installment, txn: &Transaction) -> MatchScore {
        if !txn.is_outflow() {
            return MatchScore::excluded();
        }

        let date = match self.date_score(installment, txn) {
            Some(d) => d,
            None => return MatchScore::excluded(),
        };

        let expected = match installment.remaining_cents() {
            0 => installment.amount_due_cents,
            r => r,
        };
        let amount = self.amount_score(expected, txn.abs_amount());
        if amount <= 0.0 {
            return MatchScore::excluded();
        }

        let keyword = self.keyword_score(contract, txn);

        MatchScore {
            amount,
            date,
            keyword,
            total: AMOUNT_WEIGHT * amount + DATE_WEIGHT * date + KEYWORD_WEIGHT * keyword,
        }
    }

    /// Plan applications for one contract.
    ///
    /// Installments are visited earliest-due first. For each one, candidates
    /// with availability left and a score at or above the threshold are
    /// consumed by descending score until the installment is covered.
    /// `applied` holds what existing links already took from each transaction.
    pub fn plan(
        &self,
        contract: &Contract,
        installments: &[Installment],
        transactions: &[Transaction],
        applied: &HashMap<String, i64>,
    ) -> Vec<Application> {
        let mut available: HashMap<&str, i64> = transactions
            .iter()
            .filter(|t| t.is_outflow())
            .filter(|t| contract.principal_txn_id.as_deref() != Some(t.id.as_str()))
            .map(|t| {
                let used = applied.get(&t.id).copied().unwrap_or(0);
                (t.id.as_str(), (t.abs_amount() - used).max(0))
            })
            .filter(|(_, left)| *left > 0)
            .collect();

        let mut ordered: Vec<&Installment> = installments.iter().filter(|i| !i.is_paid()).collect();
        ordered.sort_by(|a, b| a.due_date.cmp(&b.due_date).then(a.index.cmp(&b.index)));

        let mut plan = Vec::new();

        for installment in ordered {
            let mut remaining = installment.remaining_cents();

            let mut scored: Vec<(f64, &Transaction)> = transactions
                .iter()
                .filter(|t| available.get(t.id.as_str()).copied().unwrap_or(0) > 0)
                .map(|t| (self.score(contract, installment, t).total, t))
                .filter(|(score, _)| *score >= self.config.acceptance_threshold)
                .collect();

            scored.sort_by(|(sa, ta), (sb, tb)| {
                sb.partial_cmp(sa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ta.posted_date.cmp(&tb.posted_date))
                    .then_with(|| ta.id.cmp(&tb.id))
            });

            for (score, txn) in scored {
                if remaining == 0 {
                    break;
                }

                let left = available.get(txn.id.as_str()).copied().unwrap_or(0);
                let amount = remaining.min(left);
                if amount == 0 {
                    continue;
                }

                debug!(
                    installment_id = %installment.id,
                    txn_id = %txn.id,
                    amount,
                    score,
                    "Planned payment application"
                );

                available.insert(txn.id.as_str(), left - amount);
                remaining -= amount;

                plan.push(Application {
                    installment_id: installment.id.clone(),
                    txn_id: txn.id.clone(),
                    amount_cents: amount,
                    confidence: score.clamp(0.0, 1.0),
                });
            }
        }

        plan
    }
}

// ============================================================================
// TESTS
// ============================================================================
