// 🧮 Rollup Aggregator - Contract summary from installment state
// Always derived fresh; a stored delta is never trusted, so a run that
// crashed mid-batch heals on the next pass.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{Contract, Installment};
use crate::state;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollup {
    pub outstanding_cents: i64,
    pub paid_installments: u32,
    pub total_installments: u32,
    pub next_due_date: Option<NaiveDate>,
}

pub fn rollup(installments: &[Installment]) -> Rollup {
    let outstanding_cents = installments.iter().map(|i| i.remaining_cents()).sum();
    let paid_installments = installments.iter().filter(|i| i.is_paid()).count() as u32;
    let next_due_date = installments
        .iter()
        .filter(|i| !i.is_paid())
        .map(|i| i.due_date)
        .min();

    Rollup {
        outstanding_cents,
        paid_installments,
        total_installments: installments.len() as u32,
        next_due_date,
    }
}

/// Re-derive statuses, summary fields and state for a contract in place
pub fn refresh_contract(
    contract: &mut Contract,
    installments: &mut [Installment],
    today: NaiveDate,
    due_soon_days: i64,
    now: DateTime<Utc>,
) {
    state::refresh_statuses(installments, today, due_soon_days);

    let summary = rollup(installments);
    contract.outstanding_cents = summary.outstanding_cents;
    contract.paid_installments = summary.paid_installments;
    contract.total_installments = summary.total_installments;
    contract.next_due_date = summary.next_due_date;
    contract.state = state::contract_state(installments, contract.state);
    contract.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{installment_id, InstallmentStatus};
    use crate::test_support::date;

    fn inst(n: u32, due: &str, amount_due: i64, paid: i64) -> Installment {
        Installment {
            id: installment_id("bnpl_x", n),
            contract_id: "bnpl_x".to_string(),
            index: n - 1,
            due_date: date(due),
            amount_due_cents: amount_due,
            amount_paid_cents: paid,
            status: InstallmentStatus::Upcoming,
            paid_at: None,
        }
    }

    #[test]
    fn test_rollup_fields() {
        let installments = vec![
            inst(1, "2025-01-01", 5000, 5000),
            inst(2, "2025-01-15", 5000, 2000),
            inst(3, "2025-01-29", 5000, 0),
        ];

        let r = rollup(&installments);

        assert_eq!(r.outstanding_cents, 3000 + 5000);
        assert_eq!(r.paid_installments, 1);
        assert_eq!(r.total_installments, 3);
        assert_eq!(r.next_due_date, Some(date("2025-01-15")));
    }

    #[test]
    fn test_rollup_fully_paid_has_no_next_due() {
        let installments = vec![inst(1, "2025-01-01", 5000, 5000), inst(2, "2025-01-15", 5000, 5000)];
        let r = rollup(&installments);

        assert_eq!(r.outstanding_cents, 0);
        assert_eq!(r.next_due_date, None);
    }

    #[test]
    fn test_rollup_ignores_overpayment() {
        // Outstanding is a sum of clamped remainders, never negative
        let installments = vec![inst(1, "2025-01-01", 5000, 6000), inst(2, "2025-01-15", 5000, 0)];
        assert_eq!(rollup(&installments).outstanding_cents, 5000);
    }

    #[test]
    fn test_empty_rollup() {
        let r = rollup(&[]);
        assert_eq!(r.outstanding_cents, 0);
        assert_eq!(r.total_installments, 0);
        assert_eq!(r.next_due_date, None);
    }
}
