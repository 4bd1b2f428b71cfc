// ⚙️ Engine Configuration - Tolerances and thresholds as data
// Every field has a default, so a config file only needs the overrides.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Gap (in days) between consecutive candidates that starts a new cluster.
/// Not configurable: a new purchase starts a new contract when payments
/// stop being contiguous.
pub const SEGMENTATION_GAP_DAYS: i64 = 45;

/// Installment counts a reconstructed contract may have.
pub const CANONICAL_INSTALLMENT_COUNTS: [u32; 3] = [4, 6, 12];

/// Default number of operations per batched commit.
pub const DEFAULT_BATCH_LIMIT: usize = 400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ========================================================================
    // CLUSTERING / INFERENCE
    // ========================================================================
    /// Relative tolerance when bucketing installment amounts (default: 3%)
    pub amount_tolerance_pct: f64,

    /// Absolute floor for the bucketing tolerance, in cents (default: 100)
    pub amount_tolerance_floor_cents: i64,

    /// Allowed distance from 7 / 14 days when classifying cadence (default: 2)
    pub cadence_tolerance_days: i64,

    /// Upper bound for the normalized merchant hint (default: 32 chars)
    pub merchant_hint_max_len: usize,

    // ========================================================================
    // CONTRACT BUILDER
    // ========================================================================
    /// Search window around the first installment for the principal (default: 2)
    pub principal_window_days: i64,

    /// Minimum principal size relative to the typical installment (default: 0.8)
    pub principal_min_ratio: f64,

    /// Multiplier used when no principal is found (default: 4)
    pub default_principal_multiplier: i64,

    /// Currency stamped on reconstructed contracts (default: USD)
    pub currency: String,

    // ========================================================================
    // RECONCILIATION MATCHER
    // ========================================================================
    /// Relative amount tolerance for scoring (default: 10%)
    pub match_amount_tolerance_pct: f64,

    /// Absolute amount tolerance for scoring, in cents (default: 500)
    pub match_amount_tolerance_cents: i64,

    /// Days before the due date a payment may still match (default: 7)
    pub match_days_before: i64,

    /// Days after the due date a payment may still match (default: 21)
    pub match_days_after: i64,

    /// Minimum weighted score for a candidate to be applied (default: 0.4)
    pub acceptance_threshold: f64,

    // ========================================================================
    // STATE MACHINE / PERSISTENCE
    // ========================================================================
    /// An unpaid installment due within this many days is DUE (default: 7)
    pub due_soon_days: i64,

    /// Maximum operations per batched commit (default: 400)
    pub batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            amount_tolerance_pct: 0.03,
            amount_tolerance_floor_cents: 100,
            cadence_tolerance_days: 2,
            merchant_hint_max_len: 32,
            principal_window_days: 2,
            principal_min_ratio: 0.8,
            default_principal_multiplier: 4,
            currency: "USD".to_string(),
            match_amount_tolerance_pct: 0.10,
            match_amount_tolerance_cents: 500,
            match_days_before: 7,
            match_days_after: 21,
            acceptance_threshold: 0.4,
            due_soon_days: 7,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file; missing fields use defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        Ok(config)
    }

    /// Load from the path in `BNPL_CONFIG`, or fall back to defaults
    pub fn from_env() -> Result<Self> {
        match std::env::var("BNPL_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Bucketing tolerance for an amount: percentage or floor, whichever is larger
    pub fn amount_tolerance(&self, amount_cents: i64) -> i64 {
        let pct = (amount_cents.abs() as f64 * self.amount_tolerance_pct).round() as i64;
        pct.max(self.amount_tolerance_floor_cents)
    }

    /// Matching tolerance for an amount: whichever tolerance is looser
    pub fn match_amount_tolerance(&self, amount_cents: i64) -> i64 {
        let pct = (amount_cents.abs() as f64 * self.match_amount_tolerance_pct).round() as i64;
        pct.max(self.match_amount_tolerance_cents)
    }
}
