// 📐 Shape Layer - Schema checks at the persistence boundary
// Stored documents are parsed into explicit records; anything that does
// not fit the shape is quarantined instead of flowing on half-populated.

use chrono::{DateTime, NaiveDate, Utc};
use std::str::FromStr;

use crate::contract::{Cadence, Contract, ContractState, Installment, InstallmentStatus, Link};
use crate::db::{Transaction, DATE_FORMAT};

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub context: String,
}

impl ValidationError {
    fn new(context: &str, field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.to_string(),
            message: message.into(),
            context: context.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.context, self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// A record excluded from processing, with where it came from and why
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct QuarantinedRecord {
    pub source: String,
    pub reason: String,
}

impl QuarantinedRecord {
    pub fn from_errors(source: String, errors: &[ValidationError]) -> Self {
        let reason = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        QuarantinedRecord { source, reason }
    }
}

// ============================================================================
// RAW ROWS (as stored)
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub posted_date: String,
    pub amount_cents: i64,
    pub description: String,
    pub merchant: Option<String>,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct ContractRow {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub provider: String,
    pub merchant: String,
    pub principal_cents: i64,
    pub principal_txn_id: Option<String>,
    pub typical_installment_cents: i64,
    pub currency: String,
    pub start_date: String,
    pub schedule_count: i64,
    pub schedule_frequency: String,
    pub state: String,
    pub next_due_date: Option<String>,
    pub paid_installments: i64,
    pub total_installments: i64,
    pub outstanding_cents: i64,
    pub last_reconciled_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct InstallmentRow {
    pub id: String,
    pub contract_id: String,
    pub index: i64,
    pub due_date: String,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub status: String,
    pub paid_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LinkRow {
    pub id: String,
    pub contract_id: String,
    pub txn_id: String,
    pub installment_id: String,
    pub amount_applied_cents: i64,
    pub confidence: f64,
    pub matched_at: String,
}

// ============================================================================
// SCHEMA VALIDATOR
// ============================================================================

pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        SchemaValidator
    }

    /// Validate a ledger transaction against the core Transaction schema
    pub fn validate_transaction(&self, tx: &Transaction) -> ValidationResult {
        let mut errors = Vec::new();
        let ctx = "Transaction";

        for (field, value) in [
            ("id", &tx.id),
            ("user_id", &tx.user_id),
            ("account_id", &tx.account_id),
            ("description", &tx.description),
        ] {
            if value.trim().is_empty() {
                errors.push(ValidationError::new(ctx, field, "Required field is empty"));
            }
        }

        if tx.currency.trim().is_empty() {
            errors.push(ValidationError::new(ctx, "currency", "Required field is empty"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn transaction_from_row(
        &self,
        row: TransactionRow,
    ) -> Result<Transaction, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let posted_date = parse_date("Transaction", "posted_date", &row.posted_date, &mut errors);

        let tx = Transaction {
            id: row.id,
            user_id: row.user_id,
            account_id: row.account_id,
            posted_date: posted_date.unwrap_or_default(),
            amount_cents: row.amount_cents,
            description: row.description,
            merchant: row.merchant.filter(|m| !m.trim().is_empty()),
            currency: row.currency,
        };

        if let Err(mut more) = self.validate_transaction(&tx) {
            errors.append(&mut more);
        }

        if errors.is_empty() {
            Ok(tx)
        } else {
            Err(errors)
        }
    }

    pub fn contract_from_row(&self, row: ContractRow) -> Result<Contract, Vec<ValidationError>> {
        let ctx = "Contract";
        let mut errors = Vec::new();

        if row.id.is_empty() {
            errors.push(ValidationError::new(ctx, "id", "Required field is empty"));
        }
        if row.typical_installment_cents <= 0 {
            errors.push(ValidationError::new(
                ctx,
                "typical_installment_cents",
                format!("Must be positive, got {}", row.typical_installment_cents),
            ));
        }

        let start_date = parse_date(ctx, "start_date", &row.start_date, &mut errors);
        let frequency = parse_enum::<Cadence>(ctx, "schedule_frequency", &row.schedule_frequency, &mut errors);
        let state = parse_enum::<ContractState>(ctx, "state", &row.state, &mut errors);
        let next_due_date = row
            .next_due_date
            .as_deref()
            .and_then(|s| parse_date(ctx, "next_due_date", s, &mut errors));
        let last_reconciled_at = row
            .last_reconciled_at
            .as_deref()
            .and_then(|s| parse_timestamp(ctx, "last_reconciled_at", s, &mut errors));
        let created_at = parse_timestamp(ctx, "created_at", &row.created_at, &mut errors);
        let updated_at = parse_timestamp(ctx, "updated_at", &row.updated_at, &mut errors);
        let schedule_count = parse_count(ctx, "schedule_count", row.schedule_count, &mut errors);
        let paid = parse_count(ctx, "paid_installments", row.paid_installments, &mut errors);
        let total = parse_count(ctx, "total_installments", row.total_installments, &mut errors);

        match (start_date, frequency, state, created_at, updated_at) {
            (Some(start_date), Some(schedule_frequency), Some(state), Some(created_at), Some(updated_at))
                if errors.is_empty() =>
            {
                Ok(Contract {
                    id: row.id,
                    user_id: row.user_id,
                    account_id: row.account_id,
                    provider: row.provider,
                    merchant: row.merchant,
                    principal_cents: row.principal_cents,
                    principal_txn_id: row.principal_txn_id,
                    typical_installment_cents: row.typical_installment_cents,
                    currency: row.currency,
                    start_date,
                    schedule_count,
                    schedule_frequency,
                    state,
                    next_due_date,
                    paid_installments: paid,
                    total_installments: total,
                    outstanding_cents: row.outstanding_cents,
                    last_reconciled_at,
                    created_at,
                    updated_at,
                })
            }
            _ => Err(errors),
        }
    }

    pub fn installment_from_row(
        &self,
        row: InstallmentRow,
    ) -> Result<Installment, Vec<ValidationError>> {
        let ctx = "Installment";
        let mut errors = Vec::new();

        if row.amount_due_cents < 0 || row.amount_paid_cents < 0 {
            errors.push(ValidationError::new(ctx, "amount", "Amounts must not be negative"));
        }
        if row.amount_paid_cents > row.amount_due_cents {
            errors.push(ValidationError::new(
                ctx,
                "amount_paid_cents",
                format!(
                    "Paid {} exceeds due {}",
                    row.amount_paid_cents, row.amount_due_cents
                ),
            ));
        }

        let index = parse_count(ctx, "index", row.index, &mut errors);
        let due_date = parse_date(ctx, "due_date", &row.due_date, &mut errors);
        let status = parse_enum::<InstallmentStatus>(ctx, "status", &row.status, &mut errors);
        let paid_at = row
            .paid_at
            .as_deref()
            .and_then(|s| parse_date(ctx, "paid_at", s, &mut errors));

        match (due_date, status) {
            (Some(due_date), Some(status)) if errors.is_empty() => Ok(Installment {
                id: row.id,
                contract_id: row.contract_id,
                index,
                due_date,
                amount_due_cents: row.amount_due_cents,
                amount_paid_cents: row.amount_paid_cents,
                status,
                paid_at,
            }),
            _ => Err(errors),
        }
    }

    pub fn link_from_row(&self, row: LinkRow) -> Result<Link, Vec<ValidationError>> {
        let ctx = "Link";
        let mut errors = Vec::new();

        if row.amount_applied_cents <= 0 {
            errors.push(ValidationError::new(
                ctx,
                "amount_applied_cents",
                format!("Must be positive, got {}", row.amount_applied_cents),
            ));
        }
        if !(0.0..=1.0).contains(&row.confidence) {
            errors.push(ValidationError::new(
                ctx,
                "confidence",
                format!("Must be between 0.0 and 1.0, got {}", row.confidence),
            ));
        }
        let matched_at = parse_timestamp(ctx, "matched_at", &row.matched_at, &mut errors);

        match matched_at {
            Some(matched_at) if errors.is_empty() => Ok(Link {
                id: row.id,
                contract_id: row.contract_id,
                txn_id: row.txn_id,
                installment_id: row.installment_id,
                amount_applied_cents: row.amount_applied_cents,
                confidence: row.confidence,
                matched_at,
            }),
            _ => Err(errors),
        }
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FIELD PARSERS
// ============================================================================

fn parse_date(
    ctx: &str,
    field: &str,
    value: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(value, DATE_FORMAT) {
        Ok(d) => Some(d),
        Err(_) => {
            errors.push(ValidationError::new(
                ctx,
                field,
                format!("Expected YYYY-MM-DD, got {:?}", value),
            ));
            None
        }
    }
}

fn parse_timestamp(
    ctx: &str,
    field: &str,
    value: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(_) => {
            errors.push(ValidationError::new(
                ctx,
                field,
                format!("Expected RFC 3339 timestamp, got {:?}", value),
            ));
            None
        }
    }
}

fn parse_enum<T: FromStr>(
    ctx: &str,
    field: &str,
    value: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<T> {
    match value.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(ValidationError::new(ctx, field, format!("Unknown value {:?}", value)));
            None
        }
    }
}

fn parse_count(ctx: &str, field: &str, value: i64, errors: &mut Vec<ValidationError>) -> u32 {
    match u32::try_from(value) {
        Ok(v) => v,
        Err(_) => {
            errors.push(ValidationError::new(ctx, field, format!("Out of range: {}", value)));
            0
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn installment_row() -> InstallmentRow {
        InstallmentRow {
            id: "bnpl_x_1".to_string(),
            contract_id: "bnpl_x".to_string(),
            index: 0,
            due_date: "2025-01-01".to_string(),
            amount_due_cents: 5000,
            amount_paid_cents: 0,
            status: "UPCOMING".to_string(),
            paid_at: None,
        }
    }

    #[test]
    fn test_valid_installment_row() {
        let validator = SchemaValidator::new();
        let inst = validator.installment_from_row(installment_row()).unwrap();

        assert_eq!(inst.status, InstallmentStatus::Upcoming);
        assert_eq!(inst.due_date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    }

    #[test]
    fn test_overpaid_installment_rejected() {
        let validator = SchemaValidator::new();
        let mut row = installment_row();
        row.amount_paid_cents = 6000;

        let errors = validator.installment_from_row(row).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "amount_paid_cents");
    }

    #[test]
    fn test_unknown_status_rejected() {
        let validator = SchemaValidator::new();
        let mut row = installment_row();
        row.status = "SETTLED".to_string();
        row.due_date = "yesterday".to_string();

        let errors = validator.installment_from_row(row).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["due_date", "status"]);
    }

    #[test]
    fn test_transaction_row_blank_merchant_becomes_none() {
        let validator = SchemaValidator::new();
        let tx = validator
            .transaction_from_row(TransactionRow {
                id: "t1".to_string(),
                user_id: "u1".to_string(),
                account_id: "a1".to_string(),
                posted_date: "2025-02-03".to_string(),
                amount_cents: -2500,
                description: "ZIP PAY".to_string(),
                merchant: Some("  ".to_string()),
                currency: "USD".to_string(),
            })
            .unwrap();

        assert_eq!(tx.merchant, None);
    }

    #[test]
    fn test_quarantine_reason_lists_every_error() {
        let errors = vec![
            ValidationError::new("Transaction", "id", "Required field is empty"),
            ValidationError::new("Transaction", "description", "Required field is empty"),
        ];
        let q = QuarantinedRecord::from_errors("csv:2".to_string(), &errors);

        assert_eq!(
            q.reason,
            "[Transaction] id: Required field is empty; [Transaction] description: Required field is empty"
        );
    }
}
