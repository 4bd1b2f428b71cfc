// 🏗️ Contract Builder - Qualifying cluster → contract + schedule
//
// 1. Locate the principal purchase near the first installment
// 2. Derive the installment count and snap it to a canonical schedule
// 3. Hash the defining fields into the contract id
// 4. Materialize every slot, binding observed payments in order

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::cluster::Cluster;
use crate::config::{EngineConfig, CANONICAL_INSTALLMENT_COUNTS};
use crate::contract::{contract_id, installment_id, Contract, ContractState, Installment, InstallmentStatus};
use crate::db::Transaction;
use crate::inference::Inference;
use crate::rollup;

/// Observed payment bound to a slot at build time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub installment_id: String,
    pub txn: Transaction,
    pub amount_cents: i64,
}

/// Everything one contract write consists of
#[derive(Debug, Clone, PartialEq)]
pub struct ContractBundle {
    pub contract: Contract,
    pub installments: Vec<Installment>,
    pub bindings: Vec<Binding>,
}

impl ContractBundle {
    /// Persistence operations needed to write this bundle
    /// (contract + installments + one link and one event per binding)
    pub fn operation_count(&self) -> usize {
        1 + self.installments.len() + 2 * self.bindings.len()
    }
}

/// Snap `round(principal / typical)` to the nearest canonical count.
/// Equidistant counts snap to the smaller one.
pub fn snap_installment_count(principal_cents: i64, typical_cents: i64) -> u32 {
    if typical_cents <= 0 {
        return CANONICAL_INSTALLMENT_COUNTS[0];
    }

    let raw = (principal_cents.abs() as f64 / typical_cents as f64).round() as i64;

    CANONICAL_INSTALLMENT_COUNTS
        .iter()
        .copied()
        .min_by_key(|&c| ((c as i64 - raw).abs(), c))
        .unwrap_or(CANONICAL_INSTALLMENT_COUNTS[0])
}

pub struct ContractBuilder<'a> {
    config: &'a EngineConfig,
}

impl<'a> ContractBuilder<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        ContractBuilder { config }
    }

    /// Largest same-account debit within the window around the first
    /// installment that is at least `principal_min_ratio` of the typical amount.
    /// Installments themselves are never the principal.
    pub fn locate_principal<'t>(
        &self,
        inference: &Inference,
        all: &'t [Transaction],
    ) -> Option<&'t Transaction> {
        let first = inference.qualifying.first()?;
        let installment_ids: HashSet<&str> =
            inference.qualifying.iter().map(|t| t.id.as_str()).collect();
        let floor = inference.typical_amount_cents as f64 * self.config.principal_min_ratio;

        all.iter()
            .filter(|t| t.account_id == first.account_id && t.user_id == first.user_id)
            .filter(|t| t.is_outflow())
            .filter(|t| !installment_ids.contains(t.id.as_str()))
            .filter(|t| {
                (t.posted_date - first.posted_date).num_days().abs()
                    <= self.config.principal_window_days
            })
            .filter(|t| t.abs_amount() as f64 >= floor)
            .max_by(|a, b| {
                a.abs_amount()
                    .cmp(&b.abs_amount())
                    // Prefer the earlier one, then the smaller id, on ties
                    .then_with(|| b.posted_date.cmp(&a.posted_date))
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    pub fn build(
        &self,
        user_id: &str,
        cluster: &Cluster,
        inference: &Inference,
        all: &[Transaction],
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Option<ContractBundle> {
        let first = inference.qualifying.first()?;
        let typical = inference.typical_amount_cents;
        let start_date = first.posted_date;

        let principal = self.locate_principal(inference, all);
        let principal_cents = match principal {
            Some(p) => p.abs_amount(),
            None => typical * self.config.default_principal_multiplier,
        };

        // Payments beyond the snapped schedule stay unbound
        let total = snap_installment_count(principal_cents, typical);

        let id = contract_id(
            user_id,
            &cluster.key.provider,
            &cluster.key.merchant_hint,
            start_date,
            typical,
        );

        debug!(
            contract_id = %id,
            principal_cents,
            principal_found = principal.is_some(),
            total,
            cadence = %inference.cadence,
            "Built contract"
        );

        let mut installments = Vec::with_capacity(total as usize);
        let mut bindings = Vec::new();

        for index in 0..total {
            let inst_id = installment_id(&id, index + 1);
            let due_date = inference.cadence.due_date(start_date, index);

            let (amount_due, amount_paid, paid_at) = match inference.qualifying.get(index as usize) {
                Some(payment) => {
                    bindings.push(Binding {
                        installment_id: inst_id.clone(),
                        txn: payment.clone(),
                        amount_cents: payment.abs_amount(),
                    });
                    (payment.abs_amount(), payment.abs_amount(), Some(payment.posted_date))
                }
                None => (typical, 0, None),
            };

            installments.push(Installment {
                id: inst_id,
                contract_id: id.clone(),
                index,
                due_date,
                amount_due_cents: amount_due,
                amount_paid_cents: amount_paid,
                status: InstallmentStatus::Upcoming,
                paid_at,
            });
        }

        let mut contract = Contract {
            id,
            user_id: user_id.to_string(),
            account_id: cluster.key.account_id.clone(),
            provider: cluster.key.provider.clone(),
            merchant: cluster.key.merchant_hint.clone(),
            principal_cents,
            principal_txn_id: principal.map(|p| p.id.clone()),
            typical_installment_cents: typical,
            currency: self.config.currency.clone(),
            start_date,
            schedule_count: total,
            schedule_frequency: inference.cadence,
            state: ContractState::Open,
            next_due_date: None,
            paid_installments: 0,
            total_installments: total,
            outstanding_cents: 0,
            last_reconciled_at: None,
            created_at: now,
            updated_at: now,
        };

        rollup::refresh_contract(
            &mut contract,
            &mut installments,
            today,
            self.config.due_soon_days,
            now,
        );

        Some(ContractBundle {
            contract,
            installments,
            bindings,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::cluster_candidates;
    use crate::contract::Cadence;
    use crate::detector::LexicalDetector;
    use crate::inference::infer;
    use crate::test_support::{date, series, txn};

    fn build_all(all: &[Transaction], today: &str) -> Vec<ContractBundle> {
        let config = EngineConfig::default();
        let builder = ContractBuilder::new(&config);
        let detector = LexicalDetector::default();
        let now = Utc::now();

        cluster_candidates(detector.candidates(all))
            .iter()
            .filter_map(|c| {
                let inference = infer(c, &config)?;
                builder.build("user-1", c, &inference, all, date(today), now)
            })
            .collect()
    }

    fn four_biweekly_with_principal() -> Vec<Transaction> {
        let mut all = vec![txn("p", "2025-01-01", -20000, "BESTBUY 0042 PURCHASE")];
        all.extend(series("t", "2025-01-01", 14, 4, -5000, "AFFIRM * BESTBUY"));
        all
    }

    #[test]
    fn test_snap_to_canonical() {
        assert_eq!(snap_installment_count(1180, 100), 12);
        assert_eq!(snap_installment_count(20000, 5000), 4);
        assert_eq!(snap_installment_count(30000, 5000), 6);
        assert_eq!(snap_installment_count(35000, 5000), 6);
        // 5 is equidistant from 4 and 6
        assert_eq!(snap_installment_count(25000, 5000), 4);
        // 9 is equidistant from 6 and 12
        assert_eq!(snap_installment_count(45000, 5000), 6);
        assert_eq!(snap_installment_count(100000, 5000), 12);
    }

    #[test]
    fn test_full_scenario_all_paid() {
        let bundles = build_all(&four_biweekly_with_principal(), "2025-03-01");

        assert_eq!(bundles.len(), 1);
        let b = &bundles[0];
        assert_eq!(b.contract.total_installments, 4);
        assert_eq!(b.contract.schedule_frequency, Cadence::Biweekly);
        assert_eq!(b.contract.principal_cents, 20000);
        assert_eq!(b.contract.principal_txn_id.as_deref(), Some("p"));
        assert_eq!(b.contract.state, ContractState::Paid);
        assert_eq!(b.contract.outstanding_cents, 0);
        assert!(b.installments.iter().all(|i| i.status == InstallmentStatus::Paid));
        assert_eq!(b.bindings.len(), 4);
    }

    #[test]
    fn test_half_paid_scenario() {
        let mut all = vec![txn("p", "2025-01-01", -20000, "BESTBUY 0042 PURCHASE")];
        all.extend(series("t", "2025-01-01", 14, 2, -5000, "AFFIRM * BESTBUY"));

        // Before the third due date (2025-01-29)
        let active = &build_all(&all, "2025-01-16")[0];
        assert_eq!(active.contract.paid_installments, 2);
        assert_eq!(active.contract.outstanding_cents, 2 * 5000);
        assert_eq!(active.contract.state, ContractState::Active);
        assert_eq!(active.contract.next_due_date, Some(date("2025-01-29")));
        assert_eq!(active.installments[2].status, InstallmentStatus::Upcoming);

        // After the third due date passes unpaid
        let late = &build_all(&all, "2025-02-01")[0];
        assert_eq!(late.contract.state, ContractState::Late);
        assert_eq!(late.installments[2].status, InstallmentStatus::Overdue);
        assert_eq!(late.installments[3].status, InstallmentStatus::Upcoming);
        assert_eq!(late.contract.outstanding_cents, 2 * 5000);
    }

    #[test]
    fn test_build_is_idempotent() {
        let all = four_biweekly_with_principal();
        let a = build_all(&all, "2025-03-01");
        let b = build_all(&all, "2025-03-01");

        assert_eq!(a[0].contract.id, b[0].contract.id);
        assert_eq!(a[0].installments, b[0].installments);
        assert_eq!(a[0].bindings, b[0].bindings);
    }

    #[test]
    fn test_default_principal_when_none_found() {
        let all = series("t", "2025-01-01", 14, 2, -5000, "AFFIRM * BESTBUY");
        let b = &build_all(&all, "2025-01-16")[0];

        assert_eq!(b.contract.principal_cents, 4 * 5000);
        assert_eq!(b.contract.principal_txn_id, None);
        assert_eq!(b.contract.total_installments, 4);
    }

    #[test]
    fn test_principal_outside_window_ignored() {
        let mut all = vec![txn("p", "2024-12-28", -60000, "BESTBUY PURCHASE")];
        all.extend(series("t", "2025-01-01", 14, 2, -5000, "AFFIRM * BESTBUY"));

        let b = &build_all(&all, "2025-01-16")[0];
        assert_eq!(b.contract.principal_txn_id, None);
    }

    #[test]
    fn test_principal_prefers_largest() {
        let mut all = vec![
            txn("small", "2025-01-02", -6000, "TARGET"),
            txn("big", "2024-12-30", -30000, "BESTBUY PURCHASE"),
            // Inflows never count
            txn("refund", "2025-01-01", 90000, "BESTBUY REFUND"),
        ];
        all.extend(series("t", "2025-01-01", 14, 2, -5000, "AFFIRM * BESTBUY"));

        let b = &build_all(&all, "2025-01-16")[0];
        assert_eq!(b.contract.principal_txn_id.as_deref(), Some("big"));
        assert_eq!(b.contract.total_installments, 6);
    }

    #[test]
    fn test_surplus_payments_do_not_grow_the_schedule() {
        // Six payments observed but no principal: the default principal says 4
        let all = series("t", "2025-01-01", 7, 6, -2500, "SEZZLE*NIKE");
        let b = &build_all(&all, "2025-02-20")[0];

        assert_eq!(b.contract.total_installments, 4);
        assert_eq!(b.contract.schedule_frequency, Cadence::Weekly);
        assert_eq!(b.contract.state, ContractState::Paid);
        assert_eq!(b.contract.outstanding_cents, 0);

        let bound: Vec<&str> = b.bindings.iter().map(|x| x.txn.id.as_str()).collect();
        assert_eq!(bound, vec!["t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn test_monthly_schedule_clamps() {
        let all = vec![
            txn("t1", "2025-01-31", -10000, "KLARNA*IKEA"),
            txn("t2", "2025-02-28", -10000, "KLARNA*IKEA"),
        ];
        let b = &build_all(&all, "2025-03-01")[0];

        let due: Vec<NaiveDate> = b.installments.iter().map(|i| i.due_date).collect();
        assert_eq!(
            due,
            vec![
                date("2025-01-31"),
                date("2025-02-28"),
                date("2025-03-31"),
                date("2025-04-30")
            ]
        );
    }

    #[test]
    fn test_operation_count() {
        let b = &build_all(&four_biweekly_with_principal(), "2025-03-01")[0];
        assert_eq!(b.operation_count(), 1 + 4 + 8);
    }
}
