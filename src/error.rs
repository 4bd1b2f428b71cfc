// ⚠️ Engine Errors - Domain failures surfaced to callers
// Insufficient evidence is never an error: those clusters are skipped.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Installment not found: {0}")]
    InstallmentNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Link not found: {0}")]
    LinkNotFound(String),

    #[error("Contract {0} is closed")]
    ContractClosed(String),

    #[error("Transaction {txn_id} has no funds left to apply (amount {amount_cents}, applied {applied_cents})")]
    FundsExhausted {
        txn_id: String,
        amount_cents: i64,
        applied_cents: i64,
    },

    #[error("Transaction {0} is not an outflow and cannot repay an installment")]
    NotAnOutflow(String),

    #[error("Invalid {field} value: {value}")]
    InvalidValue { field: String, value: String },
}
