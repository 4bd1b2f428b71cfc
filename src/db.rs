use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::schema::{QuarantinedRecord, SchemaValidator, TransactionRow};

/// Storage format for calendar dates (sorts lexicographically)
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// Event types written to the audit log
pub const EVENT_USER_EDITED: &str = "userEdited";
pub const EVENT_LINK_PAYMENT: &str = "linkPayment";
pub const EVENT_UNLINK_PAYMENT: &str = "unlinkPayment";
pub const EVENT_CLOSE_PLAN: &str = "closePlan";

/// Ledger transaction as observed upstream.
/// Immutable once stored; the engine only attaches links to it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub posted_date: NaiveDate,

    /// Signed minor units, negative = outflow
    pub amount_cents: i64,

    pub description: String,

    #[serde(default)]
    pub merchant: Option<String>,

    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Transaction {
    /// Compute idempotency hash for duplicate detection on import
    pub fn compute_idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}|{}", self.user_id, self.account_id, self.id));
        format!("{:x}", hasher.finalize())
    }

    pub fn is_outflow(&self) -> bool {
        self.amount_cents < 0
    }

    pub fn abs_amount(&self) -> i64 {
        self.amount_cents.abs()
    }

    /// Description and merchant joined, for pattern matching
    pub fn search_text(&self) -> String {
        match &self.merchant {
            Some(m) if !m.is_empty() => format!("{} {}", self.description, m),
            _ => self.description.clone(),
        }
    }
}

/// Result of a validated read: valid records plus the ones set aside
#[derive(Debug, Default)]
pub struct LoadedTransactions {
    pub transactions: Vec<Transaction>,
    pub quarantined: Vec<QuarantinedRecord>,
}

/// Event for audit trail: appended once, never updated
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Ledger transactions (read-only to the engine)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            txn_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            posted_date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            description TEXT NOT NULL,
            merchant TEXT,
            currency TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_txn_user_account_date
         ON transactions(user_id, account_id, posted_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_txn_user_id ON transactions(user_id, txn_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    crate::store::setup_contract_tables(conn)?;

    Ok(())
}

/// Load the canonical ledger CSV.
/// Rows that fail to deserialize or validate are quarantined, not fatal.
pub fn load_csv(csv_path: &Path) -> Result<LoadedTransactions> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;
    let validator = SchemaValidator::new();

    let mut loaded = LoadedTransactions::default();

    for (index, result) in rdr.deserialize::<Transaction>().enumerate() {
        // Header is line 1
        let source = format!("{}:{}", csv_path.display(), index + 2);

        match result {
            Ok(tx) => match validator.validate_transaction(&tx) {
                Ok(()) => loaded.transactions.push(tx),
                Err(errors) => loaded
                    .quarantined
                    .push(QuarantinedRecord::from_errors(source, &errors)),
            },
            Err(e) => loaded.quarantined.push(QuarantinedRecord {
                source,
                reason: e.to_string(),
            }),
        }
    }

    for q in &loaded.quarantined {
        warn!(source = %q.source, reason = %q.reason, "Quarantined ledger row");
    }

    Ok(loaded)
}

pub fn insert_transactions(conn: &Connection, transactions: &[Transaction]) -> Result<usize> {
    let validator = SchemaValidator::new();
    let mut inserted = 0;
    let mut duplicates = 0;
    let mut rejected = 0;

    for tx in transactions {
        if let Err(errors) = validator.validate_transaction(tx) {
            rejected += 1;
            warn!(txn_id = %tx.id, errors = ?errors, "Rejected transaction at write boundary");
            continue;
        }

        let hash = tx.compute_idempotency_hash();

        let result = conn.execute(
            "INSERT INTO transactions (
                idempotency_hash, txn_id, user_id, account_id, posted_date,
                amount_cents, description, merchant, currency
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                hash,
                tx.id,
                tx.user_id,
                tx.account_id,
                tx.posted_date.format(DATE_FORMAT).to_string(),
                tx.amount_cents,
                tx.description,
                tx.merchant,
                tx.currency,
            ],
        );

        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(inserted, duplicates, rejected, "Ledger import finished");

    Ok(inserted)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    debug!(event_type = %event.event_type, entity_id = %event.entity_id, "Event appended");

    Ok(())
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

const TRANSACTION_COLUMNS: &str =
    "txn_id, user_id, account_id, posted_date, amount_cents, description, merchant, currency";

fn read_transaction_row(row: &rusqlite::Row) -> rusqlite::Result<TransactionRow> {
    Ok(TransactionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        account_id: row.get(2)?,
        posted_date: row.get(3)?,
        amount_cents: row.get(4)?,
        description: row.get(5)?,
        merchant: row.get(6)?,
        currency: row.get(7)?,
    })
}

/// Run the schema check over raw rows, splitting valid from quarantined
fn validate_rows(rows: Vec<TransactionRow>) -> LoadedTransactions {
    let validator = SchemaValidator::new();
    let mut loaded = LoadedTransactions::default();

    for row in rows {
        let source = format!("transactions/{}", row.id);
        match validator.transaction_from_row(row) {
            Ok(tx) => loaded.transactions.push(tx),
            Err(errors) => {
                let q = QuarantinedRecord::from_errors(source, &errors);
                warn!(source = %q.source, reason = %q.reason, "Quarantined stored transaction");
                loaded.quarantined.push(q);
            }
        }
    }

    loaded
}

/// Transactions for one user/account, optionally bounded by an inclusive date range
pub fn get_transactions_for_account(
    conn: &Connection,
    user_id: &str,
    account_id: &str,
    range: Option<(NaiveDate, NaiveDate)>,
) -> Result<LoadedTransactions> {
    let (from, to) = match range {
        Some((from, to)) => (
            from.format(DATE_FORMAT).to_string(),
            to.format(DATE_FORMAT).to_string(),
        ),
        None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS}
         FROM transactions
         WHERE user_id = ?1 AND account_id = ?2 AND posted_date >= ?3 AND posted_date <= ?4
         ORDER BY posted_date ASC, txn_id ASC"
    ))?;

    let rows = stmt
        .query_map(params![user_id, account_id, from, to], read_transaction_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(validate_rows(rows))
}

/// Every transaction a user has, across accounts
pub fn get_transactions_for_user(conn: &Connection, user_id: &str) -> Result<LoadedTransactions> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRANSACTION_COLUMNS}
         FROM transactions
         WHERE user_id = ?1
         ORDER BY posted_date ASC, account_id ASC, txn_id ASC"
    ))?;

    let rows = stmt
        .query_map([user_id], read_transaction_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(validate_rows(rows))
}

/// Distinct accounts a user has ledger rows for
pub fn get_accounts_for_user(conn: &Connection, user_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT account_id FROM transactions WHERE user_id = ?1 ORDER BY account_id",
    )?;

    let accounts = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    Ok(accounts)
}

/// Single transaction by id, None if missing or quarantined
pub fn get_transaction(
    conn: &Connection,
    user_id: &str,
    txn_id: &str,
) -> Result<Option<Transaction>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE user_id = ?1 AND txn_id = ?2 LIMIT 1"
            ),
            params![user_id, txn_id],
            read_transaction_row,
        )
        .optional()?;

    Ok(row.and_then(|r| validate_rows(vec![r]).transactions.pop()))
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;

    Ok(count)
}
