use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use bnpl_reconstruct::{
    get_events_for_entity, insert_transactions, load_csv, setup_database, verify_count,
    BnplEngine, EngineConfig, ProviderRuleSet,
};

const DEFAULT_DB_PATH: &str = "bnpl.db";

const USAGE: &str = "Usage:
  bnpl import <csv>
  bnpl reconstruct <user> [account]
  bnpl reconcile <user>
  bnpl close <contract>
  bnpl events <contract>

Environment:
  BNPL_DB      database path (default: bnpl.db)
  BNPL_CONFIG  engine config JSON
  BNPL_RULES   provider rules JSON
  RUST_LOG     log filter (default: info)";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("");

    match (command, &args[2.min(args.len())..]) {
        ("import", [csv]) => run_import(Path::new(csv)),
        ("reconstruct", [user]) => run_reconstruct(user, None),
        ("reconstruct", [user, account]) => run_reconstruct(user, Some(account)),
        ("reconcile", [user]) => run_reconcile(user),
        ("close", [contract]) => run_close(contract),
        ("events", [contract]) => run_events(contract),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn open_database() -> Result<Connection> {
    let db_path = env::var("BNPL_DB").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let conn = Connection::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn build_engine() -> Result<BnplEngine> {
    let config = EngineConfig::from_env()?;
    let rules = match env::var("BNPL_RULES") {
        Ok(path) if !path.is_empty() => ProviderRuleSet::from_file(path)?,
        _ => ProviderRuleSet::with_defaults(),
    };
    Ok(BnplEngine::with_rules(config, rules))
}

fn run_import(csv_path: &Path) -> Result<()> {
    println!("📂 Loading {}...", csv_path.display());
    let loaded = load_csv(csv_path)?;
    println!(
        "✓ Loaded {} transactions ({} quarantined)",
        loaded.transactions.len(),
        loaded.quarantined.len()
    );

    for q in &loaded.quarantined {
        println!("   ⚠️  {} - {}", q.source, q.reason);
    }

    let conn = open_database()?;
    let inserted = insert_transactions(&conn, &loaded.transactions)?;
    let count = verify_count(&conn)?;

    println!("✓ Inserted {} new transactions", inserted);
    println!(
        "✓ Duplicates skipped: {}",
        loaded.transactions.len() - inserted
    );
    println!("✓ Database contains {} transactions", count);

    Ok(())
}

fn run_reconstruct(user_id: &str, account_id: Option<&String>) -> Result<()> {
    let mut conn = open_database()?;
    let engine = build_engine()?;
    let today = Utc::now().date_naive();

    let report = match account_id {
        Some(account) => engine.reconstruct(&mut conn, user_id, account, today)?,
        None => engine.reconstruct_user(&mut conn, user_id, today)?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_reconcile(user_id: &str) -> Result<()> {
    let mut conn = open_database()?;
    let engine = build_engine()?;

    let outcomes = engine.reconcile(&mut conn, user_id, Utc::now().date_naive())?;

    if outcomes.is_empty() {
        println!("No open contracts for {}", user_id);
        return Ok(());
    }

    println!("{:<40} {:<8} {:>12}", "CONTRACT", "STATE", "OUTSTANDING");
    for o in &outcomes {
        println!(
            "{:<40} {:<8} {:>12.2}",
            o.contract_id,
            o.state.as_str(),
            o.outstanding_cents as f64 / 100.0
        );
    }

    Ok(())
}

fn run_close(contract_id: &str) -> Result<()> {
    let mut conn = open_database()?;
    let engine = build_engine()?;

    let contract = engine.close_plan(&mut conn, contract_id, Utc::now().date_naive())?;
    println!("✓ {} is now {}", contract.id, contract.state);

    Ok(())
}

fn run_events(contract_id: &str) -> Result<()> {
    let conn = open_database()?;
    let events = get_events_for_entity(&conn, "contract", contract_id)?;

    if events.is_empty() {
        bail!("No events recorded for {}", contract_id);
    }

    for event in &events {
        println!(
            "{}  {:<14} {:<10} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.actor,
            event.data
        );
    }

    Ok(())
}
