// 🚀 BNPL Engine - Trigger surface over the pipeline
//
// reconstruct: ledger → detector → clusterer → inferencer → builder → store
// reconcile:   open contracts + ledger → matcher → per-installment apply → rollup
//
// Every mutation is followed by a refresh that re-derives statuses and the
// rollup from stored installments.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::builder::ContractBuilder;
use crate::cluster::cluster_candidates;
use crate::config::EngineConfig;
use crate::contract::{Contract, ContractState, Installment, Link};
use crate::db::{self, Event, Transaction, EVENT_CLOSE_PLAN, EVENT_UNLINK_PAYMENT, EVENT_USER_EDITED};
use crate::detector::LexicalDetector;
use crate::error::EngineError;
use crate::inference::infer;
use crate::matcher::ReconciliationMatcher;
use crate::rollup;
use crate::rules::ProviderRuleSet;
use crate::state;
use crate::store;

pub const ACTOR_RECONCILER: &str = "reconciler";
pub const ACTOR_USER: &str = "user";

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructReport {
    pub contracts_created: usize,
    pub installments_created: usize,
    pub contracts_updated: usize,
    pub quarantined: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub contract_id: String,
    pub state: ContractState,
    pub outstanding_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContractDetail {
    pub contract: Contract,
    pub installments: Vec<Installment>,
    pub links: Vec<Link>,
}

/// A user's corrections to a contract; identity never changes
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UserEdit {
    #[serde(default)]
    pub merchant: Option<String>,

    #[serde(default)]
    pub installment_amounts: Vec<InstallmentAmount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallmentAmount {
    pub installment_id: String,
    pub amount_due_cents: i64,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct BnplEngine {
    config: EngineConfig,
    detector: LexicalDetector,
}

impl BnplEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_rules(config, ProviderRuleSet::with_defaults())
    }

    pub fn with_rules(config: EngineConfig, rules: ProviderRuleSet) -> Self {
        let detector = LexicalDetector::new(rules, config.merchant_hint_max_len);
        BnplEngine { config, detector }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Detect and persist contracts for one account.
    /// Zero contracts found is a valid outcome.
    pub fn reconstruct(
        &self,
        conn: &mut Connection,
        user_id: &str,
        account_id: &str,
        today: NaiveDate,
    ) -> Result<ReconstructReport> {
        let now = Utc::now();
        let loaded = db::get_transactions_for_account(conn, user_id, account_id, None)
            .context("Failed to load ledger")?;

        let candidates = self.detector.candidates(&loaded.transactions);
        let candidate_count = candidates.len();
        let clusters = cluster_candidates(candidates);
        let builder = ContractBuilder::new(&self.config);

        let bundles: Vec<_> = clusters
            .iter()
            .filter_map(|cluster| {
                let inference = infer(cluster, &self.config)?;
                builder.build(user_id, cluster, &inference, &loaded.transactions, today, now)
            })
            .collect();

        debug!(
            candidates = candidate_count,
            clusters = clusters.len(),
            contracts = bundles.len(),
            "Detection finished"
        );

        let summary = store::write_bundles(conn, &bundles, self.config.batch_limit)
            .context("Failed to write contracts")?;

        for bundle in &bundles {
            self.refresh(conn, &bundle.contract.id, today, None)?;
        }

        let report = ReconstructReport {
            contracts_created: summary.contracts_created,
            installments_created: summary.installments_created,
            contracts_updated: summary.contracts_updated,
            quarantined: loaded.quarantined.len(),
        };

        info!(
            user_id,
            account_id,
            created = report.contracts_created,
            updated = report.contracts_updated,
            installments = report.installments_created,
            quarantined = report.quarantined,
            "Reconstruction finished"
        );

        Ok(report)
    }

    /// Match new ledger debits against every OPEN / ACTIVE / LATE contract
    pub fn reconcile(
        &self,
        conn: &mut Connection,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<Vec<ReconcileOutcome>> {
        let matcher = ReconciliationMatcher::new(&self.config, &self.detector);
        let contracts = store::get_open_contracts(conn, user_id)?;
        let mut applied = store::applied_totals(conn, user_id)?;
        let mut outcomes = Vec::with_capacity(contracts.len());
        let mut links_created = 0;

        for contract in contracts {
            let installments = match self.intact_installments(conn, &contract)? {
                Some(i) => i,
                None => continue,
            };
            let transactions = self.window_transactions(conn, &contract, &installments)?;
            let by_id: HashMap<&str, &Transaction> =
                transactions.iter().map(|t| (t.id.as_str(), t)).collect();

            let plan = matcher.plan(&contract, &installments, &transactions, &applied);

            for application in &plan {
                let txn = match by_id.get(application.txn_id.as_str()) {
                    Some(t) => *t,
                    None => continue,
                };

                let tx = conn.transaction()?;
                let link = store::apply_payment(
                    &tx,
                    &application.installment_id,
                    txn,
                    application.amount_cents,
                    application.confidence,
                    Utc::now(),
                )?;
                if let Some(link) = &link {
                    db::insert_event(&tx, &store::link_event(link, ACTOR_RECONCILER))?;
                }
                tx.commit()
                    .with_context(|| format!("Failed to apply payment to {}", application.installment_id))?;

                if let Some(link) = link {
                    *applied.entry(link.txn_id.clone()).or_default() += link.amount_applied_cents;
                    links_created += 1;
                }
            }

            let refreshed = self.refresh(conn, &contract.id, today, Some(Utc::now()))?;
            outcomes.push(ReconcileOutcome {
                contract_id: refreshed.id,
                state: refreshed.state,
                outstanding_cents: refreshed.outstanding_cents,
            });
        }

        info!(
            user_id,
            contracts = outcomes.len(),
            links = links_created,
            "Reconciliation finished"
        );

        Ok(outcomes)
    }

    /// Ledger rows that could fall inside any installment's match window
    fn window_transactions(
        &self,
        conn: &Connection,
        contract: &Contract,
        installments: &[Installment],
    ) -> Result<Vec<Transaction>> {
        let first_due = installments
            .iter()
            .map(|i| i.due_date)
            .min()
            .unwrap_or(contract.start_date);
        let last_due = installments
            .iter()
            .map(|i| i.due_date)
            .max()
            .unwrap_or(contract.start_date);

        let from = first_due - Duration::days(self.config.match_days_before);
        let to = last_due + Duration::days(self.config.match_days_after);

        let loaded = db::get_transactions_for_account(
            conn,
            &contract.user_id,
            &contract.account_id,
            Some((from, to)),
        )?;

        Ok(loaded.transactions)
    }

    /// Installments of a contract, or None when part of the schedule failed
    /// the read check. A rollup over a partial schedule is never derived.
    fn intact_installments(
        &self,
        conn: &Connection,
        contract: &Contract,
    ) -> Result<Option<Vec<Installment>>> {
        let loaded = store::load_installments(conn, &contract.id)?;
        if loaded.is_complete(contract.schedule_count) {
            return Ok(Some(loaded.installments));
        }

        warn!(
            contract_id = %contract.id,
            read = loaded.installments.len(),
            quarantined = loaded.quarantined.len(),
            schedule_count = contract.schedule_count,
            "Incomplete schedule; leaving contract as stored"
        );
        Ok(None)
    }

    /// Re-derive statuses and rollup from stored installments and persist them.
    /// A contract whose schedule does not read back intact is returned as stored.
    pub fn refresh(
        &self,
        conn: &Connection,
        contract_id: &str,
        today: NaiveDate,
        reconciled_at: Option<DateTime<Utc>>,
    ) -> Result<Contract> {
        let mut contract = store::get_contract(conn, contract_id)?
            .ok_or_else(|| EngineError::ContractNotFound(contract_id.to_string()))?;
        let mut installments = match self.intact_installments(conn, &contract)? {
            Some(i) => i,
            None => return Ok(contract),
        };

        rollup::refresh_contract(
            &mut contract,
            &mut installments,
            today,
            self.config.due_soon_days,
            Utc::now(),
        );
        if reconciled_at.is_some() {
            contract.last_reconciled_at = reconciled_at;
        }

        store::save_refreshed(conn, &contract, &installments)?;
        Ok(contract)
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    fn open_contract(&self, conn: &Connection, contract_id: &str) -> Result<Contract> {
        let contract = store::get_contract(conn, contract_id)?
            .ok_or_else(|| EngineError::ContractNotFound(contract_id.to_string()))?;

        if contract.state == ContractState::Closed {
            return Err(EngineError::ContractClosed(contract_id.to_string()).into());
        }
        Ok(contract)
    }

    /// Manually apply a transaction to an installment.
    /// Without an amount, covers as much of the remainder as the transaction allows.
    pub fn link_payment(
        &self,
        conn: &mut Connection,
        contract_id: &str,
        installment_id: &str,
        txn_id: &str,
        amount_cents: Option<i64>,
        today: NaiveDate,
    ) -> Result<Link> {
        let contract = self.open_contract(conn, contract_id)?;

        let installment = store::get_installments(conn, contract_id)?
            .into_iter()
            .find(|i| i.id == installment_id)
            .ok_or_else(|| EngineError::InstallmentNotFound(installment_id.to_string()))?;

        let txn = db::get_transaction(conn, &contract.user_id, txn_id)?
            .ok_or_else(|| EngineError::TransactionNotFound(txn_id.to_string()))?;

        if let Some(amount) = amount_cents {
            if amount <= 0 {
                return Err(EngineError::InvalidValue {
                    field: "amount_cents".to_string(),
                    value: amount.to_string(),
                }
                .into());
            }
        }
        if installment.is_paid() {
            return Err(EngineError::InvalidValue {
                field: "installment_id".to_string(),
                value: format!("{} is already paid", installment_id),
            }
            .into());
        }

        let requested = amount_cents.unwrap_or_else(|| installment.remaining_cents());

        let tx = conn.transaction()?;
        let link = match store::apply_payment(&tx, installment_id, &txn, requested, 1.0, Utc::now())? {
            Some(link) => link,
            None => {
                let applied_cents = store::applied_total(&tx, &txn.user_id, &txn.id)?;
                return Err(EngineError::FundsExhausted {
                    txn_id: txn.id.clone(),
                    amount_cents: txn.abs_amount(),
                    applied_cents,
                }
                .into());
            }
        };
        db::insert_event(&tx, &store::link_event(&link, ACTOR_USER))?;
        tx.commit()?;

        self.refresh(conn, contract_id, today, None)?;
        info!(contract_id, link_id = %link.id, amount = link.amount_applied_cents, "Payment linked");

        Ok(link)
    }

    /// Undo a link. A deliberate correction: the installment's paid amount drops.
    pub fn unlink_payment(
        &self,
        conn: &mut Connection,
        link_id: &str,
        today: NaiveDate,
    ) -> Result<Link> {
        let existing = store::get_link(conn, link_id)?
            .ok_or_else(|| EngineError::LinkNotFound(link_id.to_string()))?;
        self.open_contract(conn, &existing.contract_id)?;

        let tx = conn.transaction()?;
        let link = store::remove_link(&tx, link_id)?;
        db::insert_event(
            &tx,
            &Event::new(
                EVENT_UNLINK_PAYMENT,
                "contract",
                &link.contract_id,
                json!({
                    "link_id": link.id,
                    "installment_id": link.installment_id,
                    "txn_id": link.txn_id,
                    "amount_applied_cents": link.amount_applied_cents,
                }),
                ACTOR_USER,
            ),
        )?;
        tx.commit()?;

        self.refresh(conn, &link.contract_id, today, None)?;
        info!(link_id, contract_id = %link.contract_id, "Payment unlinked");

        Ok(link)
    }

    /// Terminal, user-initiated CLOSED transition
    pub fn close_plan(
        &self,
        conn: &mut Connection,
        contract_id: &str,
        today: NaiveDate,
    ) -> Result<Contract> {
        let mut contract = store::get_contract(conn, contract_id)?
            .ok_or_else(|| EngineError::ContractNotFound(contract_id.to_string()))?;
        let previous = contract.state;
        contract.state = state::close(contract_id, previous)?;

        let mut installments = store::get_installments(conn, contract_id)?;
        rollup::refresh_contract(
            &mut contract,
            &mut installments,
            today,
            self.config.due_soon_days,
            Utc::now(),
        );

        let tx = conn.transaction()?;
        store::save_refreshed(&tx, &contract, &installments)?;
        db::insert_event(
            &tx,
            &Event::new(
                EVENT_CLOSE_PLAN,
                "contract",
                contract_id,
                json!({ "previous_state": previous.as_str() }),
                ACTOR_USER,
            ),
        )?;
        tx.commit()?;

        info!(contract_id, previous = %previous, "Plan closed");
        Ok(contract)
    }

    /// Merchant label and/or installment amount overrides, applied atomically
    pub fn user_edit(
        &self,
        conn: &mut Connection,
        contract_id: &str,
        edit: &UserEdit,
        today: NaiveDate,
    ) -> Result<Contract> {
        self.open_contract(conn, contract_id)?;

        let tx = conn.transaction()?;
        if let Some(merchant) = edit.merchant.as_deref() {
            let merchant = merchant.trim();
            if merchant.is_empty() {
                return Err(EngineError::InvalidValue {
                    field: "merchant".to_string(),
                    value: merchant.to_string(),
                }
                .into());
            }
            store::set_merchant_label(&tx, contract_id, merchant)?;
        }
        for change in &edit.installment_amounts {
            store::set_installment_amount(
                &tx,
                contract_id,
                &change.installment_id,
                change.amount_due_cents,
            )?;
        }
        db::insert_event(
            &tx,
            &Event::new(
                EVENT_USER_EDITED,
                "contract",
                contract_id,
                serde_json::to_value(edit)?,
                ACTOR_USER,
            ),
        )?;
        tx.commit()?;

        self.refresh(conn, contract_id, today, None)
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn contract_detail(&self, conn: &Connection, contract_id: &str) -> Result<ContractDetail> {
        let contract = store::get_contract(conn, contract_id)?
            .ok_or_else(|| EngineError::ContractNotFound(contract_id.to_string()))?;

        Ok(ContractDetail {
            installments: store::get_installments(conn, contract_id)?,
            links: store::get_links(conn, contract_id)?,
            contract,
        })
    }

    /// Reconstruct every account a user has ledger rows for
    pub fn reconstruct_user(
        &self,
        conn: &mut Connection,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<ReconstructReport> {
        let mut total = ReconstructReport::default();

        for account_id in db::get_accounts_for_user(conn, user_id)? {
            match self.reconstruct(conn, user_id, &account_id, today) {
                Ok(r) => {
                    total.contracts_created += r.contracts_created;
                    total.installments_created += r.installments_created;
                    total.contracts_updated += r.contracts_updated;
                    total.quarantined += r.quarantined;
                }
                Err(e) => {
                    // Left for the next scheduled run
                    warn!(user_id, account_id = %account_id, error = %e, "Account reconstruction failed");
                }
            }
        }

        Ok(total)
    }
}

impl Default for BnplEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
