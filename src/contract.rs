// 📄 Contract Model - Reconstructed BNPL agreements
//
// Identity is derived, never assigned: the same defining fields always
// hash to the same contract id, so re-running detection upserts instead
// of duplicating.

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

// ============================================================================
// CADENCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Weekly,
    Biweekly,
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Weekly => "weekly",
            Cadence::Biweekly => "biweekly",
            Cadence::Monthly => "monthly",
        }
    }

    /// Due date of the slot at `index` (0-based) counted from `start`.
    /// Monthly keeps the start day-of-month, clamped to the end of shorter months.
    pub fn due_date(&self, start: NaiveDate, index: u32) -> NaiveDate {
        match self {
            Cadence::Weekly => start + chrono::Duration::days(7 * index as i64),
            Cadence::Biweekly => start + chrono::Duration::days(14 * index as i64),
            Cadence::Monthly => start
                .checked_add_months(Months::new(index))
                .unwrap_or(NaiveDate::MAX),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(Cadence::Weekly),
            "biweekly" => Ok(Cadence::Biweekly),
            "monthly" => Ok(Cadence::Monthly),
            other => Err(EngineError::InvalidValue {
                field: "schedule_frequency".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// CONTRACT STATE / INSTALLMENT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractState {
    Open,
    Active,
    Late,
    Paid,
    Closed,
}

impl ContractState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractState::Open => "OPEN",
            ContractState::Active => "ACTIVE",
            ContractState::Late => "LATE",
            ContractState::Paid => "PAID",
            ContractState::Closed => "CLOSED",
        }
    }

    /// Contracts the matcher still works on
    pub fn is_reconcilable(&self) -> bool {
        matches!(
            self,
            ContractState::Open | ContractState::Active | ContractState::Late
        )
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ContractState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ContractState::Open),
            "ACTIVE" => Ok(ContractState::Active),
            "LATE" => Ok(ContractState::Late),
            "PAID" => Ok(ContractState::Paid),
            "CLOSED" => Ok(ContractState::Closed),
            other => Err(EngineError::InvalidValue {
                field: "state".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstallmentStatus {
    Upcoming,
    Due,
    Partial,
    Paid,
    Overdue,
}

impl InstallmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallmentStatus::Upcoming => "UPCOMING",
            InstallmentStatus::Due => "DUE",
            InstallmentStatus::Partial => "PARTIAL",
            InstallmentStatus::Paid => "PAID",
            InstallmentStatus::Overdue => "OVERDUE",
        }
    }
}

impl fmt::Display for InstallmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InstallmentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPCOMING" => Ok(InstallmentStatus::Upcoming),
            "DUE" => Ok(InstallmentStatus::Due),
            "PARTIAL" => Ok(InstallmentStatus::Partial),
            "PAID" => Ok(InstallmentStatus::Paid),
            "OVERDUE" => Ok(InstallmentStatus::Overdue),
            other => Err(EngineError::InvalidValue {
                field: "status".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Deterministic hash of the defining fields (see `contract_id`)
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub provider: String,
    pub merchant: String,
    pub principal_cents: i64,

    /// Ledger transaction recognised as the original purchase, if any
    pub principal_txn_id: Option<String>,
    pub typical_installment_cents: i64,
    pub currency: String,
    pub start_date: NaiveDate,
    pub schedule_count: u32,
    pub schedule_frequency: Cadence,
    pub state: ContractState,

    // Rollup fields, always re-derived from installments
    pub next_due_date: Option<NaiveDate>,
    pub paid_installments: u32,
    pub total_installments: u32,
    pub outstanding_cents: i64,

    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    /// `{contract_id}_{n}` with n starting at 1
    pub id: String,
    pub contract_id: String,
    pub index: u32,
    pub due_date: NaiveDate,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub status: InstallmentStatus,
    pub paid_at: Option<NaiveDate>,
}

impl Installment {
    pub fn remaining_cents(&self) -> i64 {
        (self.amount_due_cents - self.amount_paid_cents).max(0)
    }

    pub fn is_paid(&self) -> bool {
        self.amount_paid_cents >= self.amount_due_cents
    }
}

/// Application of ledger funds to one installment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub contract_id: String,
    pub txn_id: String,
    pub installment_id: String,
    pub amount_applied_cents: i64,
    pub confidence: f64,
    pub matched_at: DateTime<Utc>,
}

// ============================================================================
// IDENTITY
// ============================================================================

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Contract id from its defining fields.
/// Fields are serialized through a sorted map so key order never matters.
pub fn contract_id(
    user_id: &str,
    provider: &str,
    merchant: &str,
    start_date: NaiveDate,
    typical_amount_cents: i64,
) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("merchant", merchant.to_string());
    fields.insert("provider", provider.to_string());
    fields.insert("start_date", start_date.format("%Y-%m-%d").to_string());
    fields.insert("typical_amount_cents", typical_amount_cents.to_string());
    fields.insert("user_id", user_id.to_string());

    // A map of strings always serializes
    let canonical = serde_json::to_string(&fields).unwrap_or_default();
    format!("bnpl_{}", &sha256_hex(&canonical)[..32])
}

/// Installment ids are index-addressed so re-derivation is stable
pub fn installment_id(contract_id: &str, number: u32) -> String {
    format!("{}_{}", contract_id, number)
}

/// One link per (installment, transaction) pair; retries resolve to the same id
pub fn link_id(installment_id: &str, txn_id: &str) -> String {
    format!("lnk_{}", &sha256_hex(&format!("{}|{}", installment_id, txn_id))[..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_contract_id_is_deterministic() {
        let a = contract_id("u1", "Affirm", "BESTBUY", date(2025, 1, 1), 5000);
        let b = contract_id("u1", "Affirm", "BESTBUY", date(2025, 1, 1), 5000);
        let c = contract_id("u1", "Affirm", "BESTBUY", date(2025, 1, 2), 5000);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("bnpl_"));
        assert_eq!(a.len(), 5 + 32);
    }

    #[test]
    fn test_contract_id_field_boundaries() {
        // Shifting text between fields must not collide
        let a = contract_id("u1", "Affirm", "XBEST", date(2025, 1, 1), 5000);
        let b = contract_id("u1", "AffirmX", "BEST", date(2025, 1, 1), 5000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_monthly_due_dates_clamp_to_month_end() {
        let start = date(2025, 1, 31);

        assert_eq!(Cadence::Monthly.due_date(start, 0), date(2025, 1, 31));
        assert_eq!(Cadence::Monthly.due_date(start, 1), date(2025, 2, 28));
        assert_eq!(Cadence::Monthly.due_date(start, 2), date(2025, 3, 31));
        assert_eq!(Cadence::Monthly.due_date(start, 3), date(2025, 4, 30));
    }

    #[test]
    fn test_weekly_and_biweekly_steps() {
        let start = date(2025, 1, 1);
        assert_eq!(Cadence::Weekly.due_date(start, 2), date(2025, 1, 15));
        assert_eq!(Cadence::Biweekly.due_date(start, 3), date(2025, 2, 12));
    }

    #[test]
    fn test_state_round_trips_through_storage_strings() {
        for state in [
            ContractState::Open,
            ContractState::Active,
            ContractState::Late,
            ContractState::Paid,
            ContractState::Closed,
        ] {
            assert_eq!(state.as_str().parse::<ContractState>().unwrap(), state);
        }
        assert!("open".parse::<ContractState>().is_err());
        assert!("SETTLED".parse::<InstallmentStatus>().is_err());
    }

    #[test]
    fn test_installment_remaining_never_negative() {
        let inst = Installment {
            id: installment_id("bnpl_x", 1),
            contract_id: "bnpl_x".to_string(),
            index: 0,
            due_date: date(2025, 1, 1),
            amount_due_cents: 5000,
            amount_paid_cents: 5200,
            status: InstallmentStatus::Paid,
            paid_at: None,
        };
        assert_eq!(inst.remaining_cents(), 0);
        assert!(inst.is_paid());
        assert_eq!(inst.id, "bnpl_x_1");
    }
}
