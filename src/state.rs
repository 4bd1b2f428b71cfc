// 🔁 State Machine - Installment status and contract state
//
// Status is recomputed forward from (due date, amount due, amount paid, today)
// on every pass. Because amount paid only grows outside explicit user
// corrections, recomputation never moves an installment backward.

use chrono::NaiveDate;

use crate::contract::{ContractState, Installment, InstallmentStatus};
use crate::error::EngineError;

/// Status of one installment as of `today`
pub fn installment_status(
    due_date: NaiveDate,
    amount_due_cents: i64,
    amount_paid_cents: i64,
    today: NaiveDate,
    due_soon_days: i64,
) -> InstallmentStatus {
    if amount_paid_cents >= amount_due_cents {
        InstallmentStatus::Paid
    } else if today > due_date && amount_paid_cents > 0 {
        InstallmentStatus::Partial
    } else if today > due_date {
        InstallmentStatus::Overdue
    } else if (due_date - today).num_days() <= due_soon_days {
        InstallmentStatus::Due
    } else {
        InstallmentStatus::Upcoming
    }
}

/// Recompute every installment's status in place
pub fn refresh_statuses(installments: &mut [Installment], today: NaiveDate, due_soon_days: i64) {
    for inst in installments.iter_mut() {
        inst.status = installment_status(
            inst.due_date,
            inst.amount_due_cents,
            inst.amount_paid_cents,
            today,
            due_soon_days,
        );
    }
}

/// Contract state derived from its installments.
/// CLOSED is only ever set by a user and is never left.
pub fn contract_state(installments: &[Installment], current: ContractState) -> ContractState {
    if current == ContractState::Closed {
        return ContractState::Closed;
    }
    if installments.is_empty() {
        return ContractState::Open;
    }

    let all_paid = installments
        .iter()
        .all(|i| i.status == InstallmentStatus::Paid);
    let any_overdue = installments
        .iter()
        .any(|i| i.status == InstallmentStatus::Overdue);
    let any_progress = installments
        .iter()
        .any(|i| matches!(i.status, InstallmentStatus::Paid | InstallmentStatus::Partial));

    if all_paid {
        ContractState::Paid
    } else if any_overdue {
        ContractState::Late
    } else if any_progress {
        ContractState::Active
    } else {
        ContractState::Open
    }
}

/// Explicit user transition to CLOSED
pub fn close(contract_id: &str, current: ContractState) -> Result<ContractState, EngineError> {
    match current {
        ContractState::Closed => Err(EngineError::ContractClosed(contract_id.to_string())),
        _ => Ok(ContractState::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::installment_id;
    use crate::test_support::date;

    fn inst(due: &str, amount_due: i64, paid: i64, status: InstallmentStatus) -> Installment {
        Installment {
            id: installment_id("bnpl_x", 1),
            contract_id: "bnpl_x".to_string(),
            index: 0,
            due_date: date(due),
            amount_due_cents: amount_due,
            amount_paid_cents: paid,
            status,
            paid_at: None,
        }
    }

    #[test]
    fn test_installment_status_table() {
        let today = date("2025-02-01");
        let s = |due: &str, paid: i64| installment_status(date(due), 5000, paid, today, 7);

        assert_eq!(s("2025-01-15", 5000), InstallmentStatus::Paid);
        assert_eq!(s("2025-03-15", 5000), InstallmentStatus::Paid);
        assert_eq!(s("2025-01-15", 2500), InstallmentStatus::Partial);
        assert_eq!(s("2025-01-15", 0), InstallmentStatus::Overdue);
        assert_eq!(s("2025-02-01", 0), InstallmentStatus::Due);
        assert_eq!(s("2025-02-08", 0), InstallmentStatus::Due);
        assert_eq!(s("2025-02-09", 0), InstallmentStatus::Upcoming);
        // Partially paid but not yet due is still upcoming/due
        assert_eq!(s("2025-03-01", 1000), InstallmentStatus::Upcoming);
    }

    #[test]
    fn test_contract_state_rules() {
        use InstallmentStatus::*;
        let open = ContractState::Open;

        let all_paid = vec![inst("2025-01-01", 1, 1, Paid), inst("2025-01-15", 1, 1, Paid)];
        assert_eq!(contract_state(&all_paid, open), ContractState::Paid);

        let late = vec![inst("2025-01-01", 1, 1, Paid), inst("2025-01-15", 1, 0, Overdue)];
        assert_eq!(contract_state(&late, open), ContractState::Late);

        let active = vec![inst("2025-01-01", 1, 1, Paid), inst("2025-01-15", 1, 0, Upcoming)];
        assert_eq!(contract_state(&active, open), ContractState::Active);

        let partial = vec![inst("2025-01-01", 2, 1, Partial), inst("2025-01-15", 1, 0, Due)];
        assert_eq!(contract_state(&partial, open), ContractState::Active);

        let untouched = vec![inst("2025-01-01", 1, 0, Due), inst("2025-01-15", 1, 0, Upcoming)];
        assert_eq!(contract_state(&untouched, open), ContractState::Open);

        assert_eq!(contract_state(&[], open), ContractState::Open);
    }

    #[test]
    fn test_closed_is_terminal() {
        use InstallmentStatus::*;
        let all_paid = vec![inst("2025-01-01", 1, 1, Paid)];

        assert_eq!(
            contract_state(&all_paid, ContractState::Closed),
            ContractState::Closed
        );
        assert!(close("bnpl_x", ContractState::Closed).is_err());
        assert_eq!(close("bnpl_x", ContractState::Late).unwrap(), ContractState::Closed);
    }

    #[test]
    fn test_status_never_regresses_as_payments_grow() {
        let due = date("2025-01-15");
        let mut previous = None;

        // Walk time forward while money arrives
        for (today, paid) in [
            ("2025-01-01", 0),
            ("2025-01-10", 0),
            ("2025-01-20", 0),
            ("2025-01-25", 2000),
            ("2025-02-01", 5000),
            ("2025-03-01", 5000),
        ] {
            let status = installment_status(due, 5000, paid, date(today), 7);
            if previous == Some(InstallmentStatus::Paid) {
                assert_eq!(status, InstallmentStatus::Paid);
            }
            previous = Some(status);
        }
        assert_eq!(previous, Some(InstallmentStatus::Paid));
    }
}
