// 🗄️ Contract Store - Contracts, installments and links in SQLite
//
// Two write paths:
// - write_bundles: batched merge-upserts of whole contracts
// - apply_payment: per-installment read-modify-write inside a transaction
//
// Rows are shape-checked on the way out; anything malformed is quarantined
// and logged rather than handed to the engine half-populated.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::builder::ContractBundle;
use crate::contract::{link_id, Contract, ContractState, Installment, Link};
use crate::db::{self, Event, Transaction, DATE_FORMAT, EVENT_LINK_PAYMENT};
use crate::error::EngineError;
use crate::schema::{ContractRow, InstallmentRow, LinkRow, QuarantinedRecord, SchemaValidator};

pub const ACTOR_BUILDER: &str = "builder";

pub fn setup_contract_tables(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Contracts
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS contracts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            merchant TEXT NOT NULL,
            merchant_edited INTEGER NOT NULL DEFAULT 0,
            principal_cents INTEGER NOT NULL,
            principal_txn_id TEXT,
            typical_installment_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            start_date TEXT NOT NULL,
            schedule_count INTEGER NOT NULL,
            schedule_frequency TEXT NOT NULL,
            state TEXT NOT NULL,
            next_due_date TEXT,
            paid_installments INTEGER NOT NULL,
            total_installments INTEGER NOT NULL,
            outstanding_cents INTEGER NOT NULL,
            last_reconciled_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Installments (one per slot, index-addressed)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS installments (
            id TEXT PRIMARY KEY,
            contract_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            due_date TEXT NOT NULL,
            amount_due_cents INTEGER NOT NULL,
            amount_paid_cents INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            paid_at TEXT,
            edited INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (contract_id) REFERENCES contracts(id)
        )",
        [],
    )?;

    // ==========================================================================
    // Links (transaction ↔ installment)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS links (
            id TEXT PRIMARY KEY,
            contract_id TEXT NOT NULL,
            txn_id TEXT NOT NULL,
            installment_id TEXT NOT NULL,
            amount_applied_cents INTEGER NOT NULL,
            confidence REAL NOT NULL,
            matched_at TEXT NOT NULL,
            FOREIGN KEY (installment_id) REFERENCES installments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contracts_user ON contracts(user_id, state)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_installments_contract ON installments(contract_id, due_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_txn ON links(txn_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_contract ON links(contract_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// BATCHED WRITES
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct WriteSummary {
    pub contracts_created: usize,
    pub contracts_updated: usize,
    pub installments_created: usize,
    pub links_created: usize,
    pub batches: usize,
}

/// Split bundles into consecutive runs of at most `limit` operations.
/// A bundle is never split; one that alone exceeds the limit gets its own batch.
pub fn plan_batches(bundles: &[ContractBundle], limit: usize) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut ops = 0;

    for (i, bundle) in bundles.iter().enumerate() {
        let cost = bundle.operation_count();
        if i > start && ops + cost > limit {
            batches.push(start..i);
            start = i;
            ops = 0;
        }
        ops += cost;
    }

    if start < bundles.len() {
        batches.push(start..bundles.len());
    }

    batches
}

/// Write contract bundles with merge semantics, one SQLite transaction per batch.
/// A failed batch rolls back whole; rerunning it is safe.
pub fn write_bundles(
    conn: &mut Connection,
    bundles: &[ContractBundle],
    batch_limit: usize,
) -> Result<WriteSummary> {
    let mut summary = WriteSummary::default();

    for range in plan_batches(bundles, batch_limit) {
        let batch = &bundles[range];
        let ops: usize = batch.iter().map(|b| b.operation_count()).sum();
        if ops > batch_limit {
            warn!(
                contract_id = %batch[0].contract.id,
                ops,
                batch_limit,
                "Contract exceeds batch limit; writing it alone"
            );
        }

        let tx = conn.transaction()?;
        for bundle in batch {
            write_bundle(&tx, bundle, &mut summary)?;
        }
        tx.commit()?;

        summary.batches += 1;
        debug!(contracts = batch.len(), ops, "Committed batch");
    }

    info!(
        created = summary.contracts_created,
        updated = summary.contracts_updated,
        installments = summary.installments_created,
        links = summary.links_created,
        batches = summary.batches,
        "Contract bundles written"
    );

    Ok(summary)
}

fn write_bundle(conn: &Connection, bundle: &ContractBundle, summary: &mut WriteSummary) -> Result<()> {
    let contract = &bundle.contract;

    // Finished plans keep their schedule, state and links as stored
    let stored = stored_state(conn, &contract.id)?;
    if matches!(stored, Some(ContractState::Closed | ContractState::Paid)) {
        debug!(contract_id = %contract.id, state = ?stored, "Leaving finished contract untouched");
        summary.contracts_updated += 1;
        return Ok(());
    }

    if contract_exists(conn, &contract.id)? {
        summary.contracts_updated += 1;
    } else {
        summary.contracts_created += 1;
    }
    upsert_contract(conn, contract)?;

    for installment in &bundle.installments {
        if !installment_exists(conn, &installment.id)? {
            summary.installments_created += 1;
        }
        upsert_installment(conn, installment)?;
    }

    // Slots beyond the current schedule that never received money
    conn.execute(
        "DELETE FROM installments
         WHERE contract_id = ?1 AND idx >= ?2 AND amount_paid_cents = 0 AND edited = 0
           AND id NOT IN (SELECT installment_id FROM links)",
        params![contract.id, contract.total_installments],
    )?;

    for binding in &bundle.bindings {
        let link = apply_payment(
            conn,
            &binding.installment_id,
            &binding.txn,
            binding.amount_cents,
            1.0,
            contract.updated_at,
        )?;

        if let Some(link) = link {
            summary.links_created += 1;
            db::insert_event(conn, &link_event(&link, ACTOR_BUILDER))?;
        }
    }

    Ok(())
}

/// `linkPayment` audit event for an applied link
pub fn link_event(link: &Link, actor: &str) -> Event {
    Event::new(
        EVENT_LINK_PAYMENT,
        "contract",
        &link.contract_id,
        json!({
            "link_id": link.id,
            "installment_id": link.installment_id,
            "txn_id": link.txn_id,
            "amount_applied_cents": link.amount_applied_cents,
            "confidence": link.confidence,
        }),
        actor,
    )
}

fn contract_exists(conn: &Connection, contract_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM contracts WHERE id = ?1", [contract_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn installment_exists(conn: &Connection, installment_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM installments WHERE id = ?1", [installment_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn stored_state(conn: &Connection, contract_id: &str) -> Result<Option<ContractState>> {
    let state: Option<String> = conn
        .query_row("SELECT state FROM contracts WHERE id = ?1", [contract_id], |row| row.get(0))
        .optional()?;
    Ok(state.and_then(|s| s.parse().ok()))
}

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Merge-upsert: existing rows keep created_at, a CLOSED state and a
/// user-edited merchant label
fn upsert_contract(conn: &Connection, c: &Contract) -> Result<()> {
    conn.execute(
        "INSERT INTO contracts (
            id, user_id, account_id, provider, merchant, principal_cents, principal_txn_id,
            typical_installment_cents, currency, start_date, schedule_count, schedule_frequency,
            state, next_due_date, paid_installments, total_installments, outstanding_cents,
            last_reconciled_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        ON CONFLICT(id) DO UPDATE SET
            merchant = CASE WHEN contracts.merchant_edited = 1
                            THEN contracts.merchant ELSE excluded.merchant END,
            principal_cents = excluded.principal_cents,
            principal_txn_id = excluded.principal_txn_id,
            currency = excluded.currency,
            schedule_count = excluded.schedule_count,
            schedule_frequency = excluded.schedule_frequency,
            state = CASE WHEN contracts.state = 'CLOSED'
                         THEN contracts.state ELSE excluded.state END,
            next_due_date = excluded.next_due_date,
            paid_installments = excluded.paid_installments,
            total_installments = excluded.total_installments,
            outstanding_cents = excluded.outstanding_cents,
            updated_at = excluded.updated_at",
        params![
            c.id,
            c.user_id,
            c.account_id,
            c.provider,
            c.merchant,
            c.principal_cents,
            c.principal_txn_id,
            c.typical_installment_cents,
            c.currency,
            fmt_date(c.start_date),
            c.schedule_count,
            c.schedule_frequency.as_str(),
            c.state.as_str(),
            c.next_due_date.map(fmt_date),
            c.paid_installments,
            c.total_installments,
            c.outstanding_cents,
            c.last_reconciled_at.map(|t| t.to_rfc3339()),
            c.created_at.to_rfc3339(),
            c.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

/// Merge-upsert: existing rows keep amount paid, and user edits keep their
/// due date and amount. Amount due never drops below what is already paid.
fn upsert_installment(conn: &Connection, i: &Installment) -> Result<()> {
    conn.execute(
        "INSERT INTO installments (
            id, contract_id, idx, due_date, amount_due_cents, amount_paid_cents, status, paid_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, NULL)
        ON CONFLICT(id) DO UPDATE SET
            due_date = CASE WHEN installments.edited = 1
                            THEN installments.due_date ELSE excluded.due_date END,
            amount_due_cents = CASE WHEN installments.edited = 1
                                    THEN installments.amount_due_cents
                                    ELSE MAX(excluded.amount_due_cents, installments.amount_paid_cents) END",
        params![
            i.id,
            i.contract_id,
            i.index,
            fmt_date(i.due_date),
            i.amount_due_cents,
            i.status.as_str(),
        ],
    )?;

    Ok(())
}

// ============================================================================
// PER-INSTALLMENT READ-MODIFY-WRITE
// ============================================================================

/// Total already applied from a ledger transaction, across all of the owner's contracts
pub fn applied_total(conn: &Connection, user_id: &str, txn_id: &str) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(l.amount_applied_cents), 0)
         FROM links l JOIN contracts c ON c.id = l.contract_id
         WHERE l.txn_id = ?1 AND c.user_id = ?2",
        params![txn_id, user_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Apply up to `requested` cents of `txn` to one installment.
///
/// Re-reads the installment and the transaction's applied total on the
/// connection it is given, so callers wrap it in a transaction to make the
/// read and the write atomic. Applies `min(requested, remaining due,
/// remaining available)`; returns None when nothing can be applied.
pub fn apply_payment(
    conn: &Connection,
    installment_id: &str,
    txn: &Transaction,
    requested: i64,
    confidence: f64,
    now: DateTime<Utc>,
) -> Result<Option<Link>> {
    if !txn.is_outflow() {
        return Err(EngineError::NotAnOutflow(txn.id.clone()).into());
    }

    let row: Option<(String, i64, i64, String)> = conn
        .query_row(
            "SELECT i.contract_id, i.amount_due_cents, i.amount_paid_cents, c.state
             FROM installments i JOIN contracts c ON c.id = i.contract_id
             WHERE i.id = ?1",
            [installment_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let (contract_id, amount_due, amount_paid, state) = match row {
        Some(r) => r,
        None => return Err(EngineError::InstallmentNotFound(installment_id.to_string()).into()),
    };

    if state == ContractState::Closed.as_str() {
        return Err(EngineError::ContractClosed(contract_id).into());
    }

    let remaining_due = (amount_due - amount_paid).max(0);
    let available = (txn.abs_amount() - applied_total(conn, &txn.user_id, &txn.id)?).max(0);
    let amount = requested.min(remaining_due).min(available);

    if amount <= 0 {
        debug!(
            installment_id,
            txn_id = %txn.id,
            remaining_due,
            available,
            "Nothing left to apply"
        );
        return Ok(None);
    }

    let id = link_id(installment_id, &txn.id);
    let confidence = confidence.clamp(0.0, 1.0);

    // Same (installment, txn) pair tops up the existing link
    conn.execute(
        "INSERT INTO links (
            id, contract_id, txn_id, installment_id, amount_applied_cents, confidence, matched_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            amount_applied_cents = links.amount_applied_cents + excluded.amount_applied_cents,
            confidence = MAX(links.confidence, excluded.confidence),
            matched_at = excluded.matched_at",
        params![
            id,
            contract_id,
            txn.id,
            installment_id,
            amount,
            confidence,
            now.to_rfc3339(),
        ],
    )?;

    let paid_at = if amount_paid + amount >= amount_due {
        Some(fmt_date(txn.posted_date))
    } else {
        None
    };

    conn.execute(
        "UPDATE installments
         SET amount_paid_cents = amount_paid_cents + ?1,
             paid_at = COALESCE(?2, paid_at)
         WHERE id = ?3",
        params![amount, paid_at, installment_id],
    )?;

    Ok(Some(Link {
        id,
        contract_id,
        txn_id: txn.id.clone(),
        installment_id: installment_id.to_string(),
        amount_applied_cents: amount,
        confidence,
        matched_at: now,
    }))
}

/// Remove a link and take its amount back off the installment
pub fn remove_link(conn: &Connection, link_id: &str) -> Result<Link> {
    let link = get_link(conn, link_id)?
        .ok_or_else(|| EngineError::LinkNotFound(link_id.to_string()))?;

    conn.execute(
        "UPDATE installments
         SET amount_paid_cents = MAX(0, amount_paid_cents - ?1),
             paid_at = CASE WHEN amount_paid_cents - ?1 >= amount_due_cents THEN paid_at ELSE NULL END
         WHERE id = ?2",
        params![link.amount_applied_cents, link.installment_id],
    )?;
    conn.execute("DELETE FROM links WHERE id = ?1", [link_id])?;

    Ok(link)
}

// ============================================================================
// USER EDITS / STATE
// ============================================================================

pub fn set_merchant_label(conn: &Connection, contract_id: &str, merchant: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE contracts SET merchant = ?1, merchant_edited = 1 WHERE id = ?2",
        params![merchant, contract_id],
    )?;
    if changed == 0 {
        return Err(EngineError::ContractNotFound(contract_id.to_string()).into());
    }
    Ok(())
}

/// Override an installment's amount due; it may not drop below what is paid
pub fn set_installment_amount(
    conn: &Connection,
    contract_id: &str,
    installment_id: &str,
    amount_due_cents: i64,
) -> Result<()> {
    let paid: Option<i64> = conn
        .query_row(
            "SELECT amount_paid_cents FROM installments WHERE id = ?1 AND contract_id = ?2",
            params![installment_id, contract_id],
            |row| row.get(0),
        )
        .optional()?;

    let paid = paid.ok_or_else(|| EngineError::InstallmentNotFound(installment_id.to_string()))?;

    if amount_due_cents <= 0 || amount_due_cents < paid {
        return Err(EngineError::InvalidValue {
            field: "amount_due_cents".to_string(),
            value: amount_due_cents.to_string(),
        }
        .into());
    }

    conn.execute(
        "UPDATE installments SET amount_due_cents = ?1, edited = 1 WHERE id = ?2",
        params![amount_due_cents, installment_id],
    )?;
    Ok(())
}

/// Persist re-derived statuses and summary fields
pub fn save_refreshed(
    conn: &Connection,
    contract: &Contract,
    installments: &[Installment],
) -> Result<()> {
    for i in installments {
        conn.execute(
            "UPDATE installments SET status = ?1 WHERE id = ?2",
            params![i.status.as_str(), i.id],
        )?;
    }

    conn.execute(
        "UPDATE contracts SET
            state = ?1, next_due_date = ?2, paid_installments = ?3, total_installments = ?4,
            outstanding_cents = ?5, last_reconciled_at = ?6, updated_at = ?7
         WHERE id = ?8",
        params![
            contract.state.as_str(),
            contract.next_due_date.map(fmt_date),
            contract.paid_installments,
            contract.total_installments,
            contract.outstanding_cents,
            contract.last_reconciled_at.map(|t| t.to_rfc3339()),
            contract.updated_at.to_rfc3339(),
            contract.id,
        ],
    )?;

    Ok(())
}

// ============================================================================
// READS
// ============================================================================

const CONTRACT_COLUMNS: &str = "id, user_id, account_id, provider, merchant, principal_cents,
    principal_txn_id, typical_installment_cents, currency, start_date, schedule_count,
    schedule_frequency, state, next_due_date, paid_installments, total_installments,
    outstanding_cents, last_reconciled_at, created_at, updated_at";

fn read_contract_row(row: &rusqlite::Row) -> rusqlite::Result<ContractRow> {
    Ok(ContractRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        account_id: row.get(2)?,
        provider: row.get(3)?,
        merchant: row.get(4)?,
        principal_cents: row.get(5)?,
        principal_txn_id: row.get(6)?,
        typical_installment_cents: row.get(7)?,
        currency: row.get(8)?,
        start_date: row.get(9)?,
        schedule_count: row.get(10)?,
        schedule_frequency: row.get(11)?,
        state: row.get(12)?,
        next_due_date: row.get(13)?,
        paid_installments: row.get(14)?,
        total_installments: row.get(15)?,
        outstanding_cents: row.get(16)?,
        last_reconciled_at: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

/// Shape-check raw rows, splitting valid records from quarantined ones
fn validate_rows<R, T>(
    rows: Vec<R>,
    kind: &str,
    id_of: impl Fn(&R) -> String,
    parse: impl Fn(R) -> Result<T, Vec<crate::schema::ValidationError>>,
) -> (Vec<T>, Vec<QuarantinedRecord>) {
    let mut valid = Vec::with_capacity(rows.len());
    let mut quarantined = Vec::new();

    for row in rows {
        let source = format!("{}/{}", kind, id_of(&row));
        match parse(row) {
            Ok(v) => valid.push(v),
            Err(errors) => {
                let q = QuarantinedRecord::from_errors(source, &errors);
                warn!(source = %q.source, reason = %q.reason, "Quarantined stored record");
                quarantined.push(q);
            }
        }
    }

    (valid, quarantined)
}

/// Shape-check raw rows; invalid ones are logged and dropped
fn validated<R, T>(
    rows: Vec<R>,
    kind: &str,
    id_of: impl Fn(&R) -> String,
    parse: impl Fn(R) -> Result<T, Vec<crate::schema::ValidationError>>,
) -> Vec<T> {
    validate_rows(rows, kind, id_of, parse).0
}

fn query_contracts(conn: &Connection, filter: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Contract>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE {filter} ORDER BY start_date ASC, id ASC"
    ))?;

    let rows = stmt
        .query_map(params, read_contract_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let validator = SchemaValidator::new();
    Ok(validated(rows, "contracts", |r| r.id.clone(), |r| validator.contract_from_row(r)))
}

pub fn get_contract(conn: &Connection, contract_id: &str) -> Result<Option<Contract>> {
    Ok(query_contracts(conn, "id = ?1", params![contract_id])?.pop())
}

pub fn get_contracts_for_user(conn: &Connection, user_id: &str) -> Result<Vec<Contract>> {
    query_contracts(conn, "user_id = ?1", params![user_id])
}

/// Contracts the matcher works on: OPEN, ACTIVE or LATE
pub fn get_open_contracts(conn: &Connection, user_id: &str) -> Result<Vec<Contract>> {
    query_contracts(
        conn,
        "user_id = ?1 AND state IN ('OPEN', 'ACTIVE', 'LATE')",
        params![user_id],
    )
}

/// Installments read back for one contract, with any rows that failed the check
#[derive(Debug, Default)]
pub struct LoadedInstallments {
    pub installments: Vec<Installment>,
    pub quarantined: Vec<QuarantinedRecord>,
}

impl LoadedInstallments {
    /// Every slot of a `schedule_count` schedule came back intact
    pub fn is_complete(&self, schedule_count: u32) -> bool {
        self.quarantined.is_empty() && self.installments.len() >= schedule_count as usize
    }
}

/// Installments of a contract, earliest due first
pub fn get_installments(conn: &Connection, contract_id: &str) -> Result<Vec<Installment>> {
    Ok(load_installments(conn, contract_id)?.installments)
}

pub fn load_installments(conn: &Connection, contract_id: &str) -> Result<LoadedInstallments> {
    let mut stmt = conn.prepare(
        "SELECT id, contract_id, idx, due_date, amount_due_cents, amount_paid_cents, status, paid_at
         FROM installments
         WHERE contract_id = ?1
         ORDER BY due_date ASC, idx ASC",
    )?;

    let rows = stmt
        .query_map([contract_id], |row| {
            Ok(InstallmentRow {
                id: row.get(0)?,
                contract_id: row.get(1)?,
                index: row.get(2)?,
                due_date: row.get(3)?,
                amount_due_cents: row.get(4)?,
                amount_paid_cents: row.get(5)?,
                status: row.get(6)?,
                paid_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let validator = SchemaValidator::new();
    let (installments, quarantined) = validate_rows(rows, "installments", |r| r.id.clone(), |r| {
        validator.installment_from_row(r)
    });

    Ok(LoadedInstallments {
        installments,
        quarantined,
    })
}

fn read_link_row(row: &rusqlite::Row) -> rusqlite::Result<LinkRow> {
    Ok(LinkRow {
        id: row.get(0)?,
        contract_id: row.get(1)?,
        txn_id: row.get(2)?,
        installment_id: row.get(3)?,
        amount_applied_cents: row.get(4)?,
        confidence: row.get(5)?,
        matched_at: row.get(6)?,
    })
}

const LINK_COLUMNS: &str =
    "id, contract_id, txn_id, installment_id, amount_applied_cents, confidence, matched_at";

pub fn get_links(conn: &Connection, contract_id: &str) -> Result<Vec<Link>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LINK_COLUMNS} FROM links WHERE contract_id = ?1 ORDER BY matched_at ASC, id ASC"
    ))?;

    let rows = stmt
        .query_map([contract_id], read_link_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let validator = SchemaValidator::new();
    Ok(validated(rows, "links", |r| r.id.clone(), |r| validator.link_from_row(r)))
}

pub fn get_link(conn: &Connection, link_id: &str) -> Result<Option<Link>> {
    let row = conn
        .query_row(
            &format!("SELECT {LINK_COLUMNS} FROM links WHERE id = ?1"),
            [link_id],
            read_link_row,
        )
        .optional()?;

    let validator = SchemaValidator::new();
    Ok(row.and_then(|r| {
        validated(vec![r], "links", |r| r.id.clone(), |r| validator.link_from_row(r)).pop()
    }))
}

/// Amount already consumed from each of a user's transactions
pub fn applied_totals(conn: &Connection, user_id: &str) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare(
        "SELECT l.txn_id, SUM(l.amount_applied_cents)
         FROM links l JOIN contracts c ON c.id = l.contract_id
         WHERE c.user_id = ?1
         GROUP BY l.txn_id",
    )?;

    let totals = stmt
        .query_map([user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(totals)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ContractBuilder;
    use crate::cluster::cluster_candidates;
    use crate::config::EngineConfig;
    use crate::detector::LexicalDetector;
    use crate::inference::infer;
    use crate::test_support::{date, series, txn};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    fn bundles_for(all: &[Transaction], today: &str) -> Vec<ContractBundle> {
        let config = EngineConfig::default();
        let builder = ContractBuilder::new(&config);
        let detector = LexicalDetector::default();

        cluster_candidates(detector.candidates(all))
            .iter()
            .filter_map(|c| {
                let inference = infer(c, &config)?;
                builder.build("user-1", c, &inference, all, date(today), Utc::now())
            })
            .collect()
    }

    fn two_paid_of_four() -> Vec<Transaction> {
        series("t", "2025-01-01", 14, 2, -5000, "AFFIRM * BESTBUY")
    }

    #[test]
    fn test_write_bundles_creates_then_merges() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");

        let first = write_bundles(&mut conn, &bundles, 400).unwrap();
        assert_eq!(first.contracts_created, 1);
        assert_eq!(first.installments_created, 4);
        assert_eq!(first.links_created, 2);

        let second = write_bundles(&mut conn, &bundles, 400).unwrap();
        assert_eq!(second.contracts_created, 0);
        assert_eq!(second.contracts_updated, 1);
        assert_eq!(second.installments_created, 0);
        assert_eq!(second.links_created, 0, "Bindings must not be applied twice");

        let id = &bundles[0].contract.id;
        let installments = get_installments(&conn, id).unwrap();
        assert_eq!(installments.len(), 4);
        assert_eq!(installments[0].amount_paid_cents, 5000);
        assert_eq!(installments[1].amount_paid_cents, 5000);
        assert_eq!(installments[2].amount_paid_cents, 0);
        assert_eq!(get_links(&conn, id).unwrap().len(), 2);
    }

    #[test]
    fn test_merge_keeps_closed_state() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");
        write_bundles(&mut conn, &bundles, 400).unwrap();

        let id = bundles[0].contract.id.clone();
        conn.execute("UPDATE contracts SET state = 'CLOSED' WHERE id = ?1", [&id])
            .unwrap();

        write_bundles(&mut conn, &bundles, 400).unwrap();
        let stored = get_contract(&conn, &id).unwrap().unwrap();
        assert_eq!(stored.state, ContractState::Closed);
    }

    #[test]
    fn test_closed_schedule_is_frozen() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");
        write_bundles(&mut conn, &bundles, 400).unwrap();

        let id = bundles[0].contract.id.clone();
        conn.execute("UPDATE contracts SET state = 'CLOSED' WHERE id = ?1", [&id])
            .unwrap();
        let before = get_installments(&conn, &id).unwrap();

        // A rebuild that would move and resize the unpaid slots
        let mut rebuilt = bundles.clone();
        for i in rebuilt[0].installments.iter_mut().skip(2) {
            i.due_date = i.due_date + chrono::Duration::days(3);
            i.amount_due_cents = 6000;
        }
        rebuilt[0].contract.total_installments = 3;
        rebuilt[0].installments.truncate(3);

        let summary = write_bundles(&mut conn, &rebuilt, 400).unwrap();
        assert_eq!(summary.contracts_updated, 1);
        assert_eq!(summary.links_created, 0);
        assert_eq!(get_installments(&conn, &id).unwrap(), before);
    }

    #[test]
    fn test_plan_batches_never_splits_a_contract() {
        let mut all = series("a", "2025-01-01", 14, 2, -5000, "AFFIRM * BESTBUY");
        all.extend(series("k", "2025-01-03", 30, 2, -7500, "KLARNA*IKEA"));
        all.extend(series("s", "2025-01-05", 7, 2, -2500, "SEZZLE*NIKE"));
        let bundles = bundles_for(&all, "2025-02-20");
        assert_eq!(bundles.len(), 3);

        // Each bundle is 1 + 4 + 2×2 = 9 operations
        let batches = plan_batches(&bundles, 20);
        assert_eq!(batches, vec![0..2, 2..3]);

        // Too small for any bundle: one per batch
        let batches = plan_batches(&bundles, 5);
        assert_eq!(batches.len(), 3);

        let mut conn = setup();
        let summary = write_bundles(&mut conn, &bundles, 20).unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.contracts_created, 3);
        assert_eq!(summary.installments_created, 12);
    }

    #[test]
    fn test_apply_payment_caps_at_remaining_and_available() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");
        write_bundles(&mut conn, &bundles, 400).unwrap();
        let id = &bundles[0].contract.id;
        let third = format!("{}_3", id);
        let fourth = format!("{}_4", id);

        // A single 6000 debit: 5000 to the third slot, only 1000 left for the fourth
        let big = txn("big", "2025-01-29", -6000, "AFFIRM * BESTBUY");
        let tx = conn.transaction().unwrap();
        let a = apply_payment(&tx, &third, &big, 6000, 0.9, Utc::now()).unwrap().unwrap();
        let b = apply_payment(&tx, &fourth, &big, 5000, 0.9, Utc::now()).unwrap().unwrap();
        let c = apply_payment(&tx, &fourth, &big, 5000, 0.9, Utc::now()).unwrap();
        tx.commit().unwrap();

        assert_eq!(a.amount_applied_cents, 5000);
        assert_eq!(b.amount_applied_cents, 1000);
        assert!(c.is_none());
        assert_eq!(applied_total(&conn, "user-1", "big").unwrap(), 6000);

        let installments = get_installments(&conn, id).unwrap();
        assert_eq!(installments[2].amount_paid_cents, 5000);
        assert_eq!(installments[2].paid_at, Some(date("2025-01-29")));
        assert_eq!(installments[3].amount_paid_cents, 1000);
        assert_eq!(installments[3].paid_at, None);
    }

    #[test]
    fn test_apply_payment_rejects_inflow_and_unknown_installment() {
        let conn = setup();
        let refund = txn("r", "2025-01-29", 5000, "AFFIRM REFUND");
        let err = apply_payment(&conn, "bnpl_missing_1", &refund, 5000, 1.0, Utc::now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NotAnOutflow(_))
        ));

        let debit = txn("d", "2025-01-29", -5000, "AFFIRM");
        let err = apply_payment(&conn, "bnpl_missing_1", &debit, 5000, 1.0, Utc::now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InstallmentNotFound(_))
        ));
    }

    #[test]
    fn test_remove_link_restores_availability() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");
        write_bundles(&mut conn, &bundles, 400).unwrap();
        let id = &bundles[0].contract.id;

        let links = get_links(&conn, id).unwrap();
        let removed = remove_link(&conn, &links[0].id).unwrap();
        assert_eq!(removed.amount_applied_cents, 5000);

        let installments = get_installments(&conn, id).unwrap();
        assert_eq!(installments[0].amount_paid_cents, 0);
        assert_eq!(installments[0].paid_at, None);
        assert_eq!(applied_total(&conn, "user-1", &removed.txn_id).unwrap(), 0);

        assert!(remove_link(&conn, &removed.id).is_err());
    }

    #[test]
    fn test_user_edits_survive_rebuild() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");
        write_bundles(&mut conn, &bundles, 400).unwrap();
        let id = bundles[0].contract.id.clone();
        let fourth = format!("{}_4", id);

        set_merchant_label(&conn, &id, "Best Buy").unwrap();
        set_installment_amount(&conn, &id, &fourth, 5200).unwrap();
        write_bundles(&mut conn, &bundles, 400).unwrap();

        let contract = get_contract(&conn, &id).unwrap().unwrap();
        assert_eq!(contract.merchant, "Best Buy");
        assert_eq!(contract.id, id);
        assert_eq!(get_installments(&conn, &id).unwrap()[3].amount_due_cents, 5200);

        // Cannot drop below what is already paid
        let first = format!("{}_1", id);
        assert!(set_installment_amount(&conn, &id, &first, 100).is_err());
    }

    #[test]
    fn test_corrupt_installment_quarantined() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");
        write_bundles(&mut conn, &bundles, 400).unwrap();
        let id = bundles[0].contract.id.clone();

        conn.execute(
            "UPDATE installments SET due_date = 'not-a-date' WHERE id = ?1",
            [format!("{}_4", id)],
        )
        .unwrap();

        assert_eq!(get_installments(&conn, &id).unwrap().len(), 3);

        let loaded = load_installments(&conn, &id).unwrap();
        assert_eq!(loaded.quarantined.len(), 1);
        assert!(loaded.quarantined[0].source.ends_with("_4"));
        assert!(!loaded.is_complete(4));
    }

    #[test]
    fn test_open_contracts_filter() {
        let mut conn = setup();
        let bundles = bundles_for(&two_paid_of_four(), "2025-01-16");
        write_bundles(&mut conn, &bundles, 400).unwrap();

        assert_eq!(get_open_contracts(&conn, "user-1").unwrap().len(), 1);
        conn.execute("UPDATE contracts SET state = 'PAID'", []).unwrap();
        assert!(get_open_contracts(&conn, "user-1").unwrap().is_empty());
        assert_eq!(get_contracts_for_user(&conn, "user-1").unwrap().len(), 1);
    }
}
