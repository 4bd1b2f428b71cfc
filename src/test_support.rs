// Shared fixtures for unit tests

use chrono::NaiveDate;

use crate::db::{Transaction, DATE_FORMAT};

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
}

/// Ledger transaction for `user-1` / `acct-1`
pub fn txn(id: &str, posted: &str, amount_cents: i64, description: &str) -> Transaction {
    Transaction {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        account_id: "acct-1".to_string(),
        posted_date: date(posted),
        amount_cents,
        description: description.to_string(),
        merchant: None,
        currency: "USD".to_string(),
    }
}

/// `count` debits of `amount_cents`, `step_days` apart, starting at `start`
pub fn series(
    prefix: &str,
    start: &str,
    step_days: i64,
    count: usize,
    amount_cents: i64,
    description: &str,
) -> Vec<Transaction> {
    let first = date(start);
    (0..count)
        .map(|i| {
            let posted = first + chrono::Duration::days(step_days * i as i64);
            let mut t = txn(
                &format!("{}{}", prefix, i + 1),
                start,
                amount_cents,
                description,
            );
            t.posted_date = posted;
            t
        })
        .collect()
}
