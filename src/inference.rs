// 📈 Cadence & Amount Inference
//
// Typical amount is a mode-with-tolerance: installments are near-identical
// but the last one may carry a rounding remainder, so neither mean nor
// strict median is reliable. Cadence is a coarse three-way classifier.

use tracing::debug;

use crate::cluster::Cluster;
use crate::config::EngineConfig;
use crate::contract::Cadence;
use crate::db::Transaction;

#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub typical_amount_cents: i64,

    /// Cluster members within tolerance of the typical amount, oldest first
    pub qualifying: Vec<Transaction>,

    pub cadence: Cadence,
    pub median_gap_days: f64,
}

fn within_tolerance(a: i64, b: i64, config: &EngineConfig) -> bool {
    let tolerance = config.amount_tolerance(a).max(config.amount_tolerance(b));
    (a - b).abs() <= tolerance
}

/// Amount of the largest bucket of mutually-close amounts.
/// Ties go to the seed seen most often exactly, then to the smaller amount.
pub fn typical_amount(amounts: &[i64], config: &EngineConfig) -> Option<i64> {
    let mut sorted: Vec<i64> = amounts.iter().map(|a| a.abs()).filter(|a| *a > 0).collect();
    sorted.sort_unstable();

    let mut best: Option<(usize, usize, i64)> = None;

    for (i, &seed) in sorted.iter().enumerate() {
        if i > 0 && sorted[i - 1] == seed {
            continue;
        }

        let bucket = sorted
            .iter()
            .filter(|&&a| within_tolerance(a, seed, config))
            .count();
        let exact = sorted.iter().filter(|&&a| a == seed).count();

        let better = match best {
            None => true,
            Some((b_bucket, b_exact, _)) => (bucket, exact) > (b_bucket, b_exact),
        };
        if better {
            best = Some((bucket, exact, seed));
        }
    }

    best.map(|(_, _, amount)| amount)
}

/// Median of consecutive gaps, in days
pub fn median_gap_days(sorted: &[Transaction]) -> Option<f64> {
    let mut gaps: Vec<i64> = sorted
        .windows(2)
        .map(|w| (w[1].posted_date - w[0].posted_date).num_days())
        .collect();

    if gaps.is_empty() {
        return None;
    }

    gaps.sort_unstable();
    let mid = gaps.len() / 2;
    let median = if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) as f64 / 2.0
    } else {
        gaps[mid] as f64
    };

    Some(median)
}

/// Weekly / biweekly when close to 7 / 14 days, monthly otherwise
pub fn classify_cadence(median_gap: f64, tolerance_days: i64) -> Cadence {
    let tolerance = tolerance_days as f64;

    if (median_gap - 7.0).abs() <= tolerance {
        Cadence::Weekly
    } else if (median_gap - 14.0).abs() <= tolerance {
        Cadence::Biweekly
    } else {
        Cadence::Monthly
    }
}

/// Infer amount and cadence for a cluster.
/// None means insufficient evidence; the cluster is skipped, not an error.
pub fn infer(cluster: &Cluster, config: &EngineConfig) -> Option<Inference> {
    let amounts: Vec<i64> = cluster.members.iter().map(|t| t.amount_cents).collect();
    let typical = typical_amount(&amounts, config)?;

    let qualifying: Vec<Transaction> = cluster
        .members
        .iter()
        .filter(|t| within_tolerance(t.abs_amount(), typical, config))
        .cloned()
        .collect();

    if qualifying.len() < 2 {
        debug!(
            provider = %cluster.key.provider,
            merchant = %cluster.key.merchant_hint,
            typical,
            "Too few installments near the typical amount"
        );
        return None;
    }

    let median_gap = median_gap_days(&qualifying)?;
    let cadence = classify_cadence(median_gap, config.cadence_tolerance_days);

    Some(Inference {
        typical_amount_cents: typical,
        qualifying,
        cadence,
        median_gap_days: median_gap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterKey;
    use crate::test_support::{series, txn};

    fn cluster(members: Vec<Transaction>) -> Cluster {
        Cluster {
            key: ClusterKey {
                provider: "Affirm".to_string(),
                merchant_hint: "BESTBUY".to_string(),
                account_id: "acct-1".to_string(),
            },
            members,
        }
    }

    #[test]
    fn test_cadence_boundaries() {
        assert_eq!(classify_cadence(7.0, 2), Cadence::Weekly);
        assert_eq!(classify_cadence(14.0, 2), Cadence::Biweekly);
        assert_eq!(classify_cadence(30.0, 2), Cadence::Monthly);
        assert_eq!(classify_cadence(10.0, 2), Cadence::Monthly);
        assert_eq!(classify_cadence(16.0, 2), Cadence::Biweekly);
        assert_eq!(classify_cadence(5.0, 2), Cadence::Weekly);
    }

    #[test]
    fn test_cadence_from_clusters() {
        let config = EngineConfig::default();

        for (step, expected) in [
            (7, Cadence::Weekly),
            (14, Cadence::Biweekly),
            (30, Cadence::Monthly),
            (10, Cadence::Monthly),
        ] {
            let c = cluster(series("t", "2025-01-01", step, 4, -5000, "AFFIRM * BESTBUY"));
            assert_eq!(infer(&c, &config).unwrap().cadence, expected, "step {}", step);
        }
    }

    #[test]
    fn test_typical_amount_tolerates_rounding_remainder() {
        let config = EngineConfig::default();
        // Three equal installments plus a final one off by a few cents
        let typical = typical_amount(&[-3333, -3333, -3333, -3334], &config);
        assert_eq!(typical, Some(3333));
    }

    #[test]
    fn test_typical_amount_ignores_principal() {
        let config = EngineConfig::default();
        let typical = typical_amount(&[-20000, -5000, -5000, -5000, -5000], &config);
        assert_eq!(typical, Some(5000));
    }

    #[test]
    fn test_filter_discards_principal_from_cluster() {
        let config = EngineConfig::default();
        let mut members = vec![txn("p", "2025-01-01", -20000, "AFFIRM * BESTBUY")];
        members.extend(series("t", "2025-01-01", 14, 4, -5000, "AFFIRM * BESTBUY"));

        let inference = infer(&cluster(members), &config).unwrap();

        assert_eq!(inference.typical_amount_cents, 5000);
        assert_eq!(inference.qualifying.len(), 4);
        assert!(inference.qualifying.iter().all(|t| t.id != "p"));
        assert_eq!(inference.cadence, Cadence::Biweekly);
    }

    #[test]
    fn test_insufficient_evidence() {
        let config = EngineConfig::default();
        let members = vec![
            txn("a", "2025-01-01", -5000, "AFFIRM * BESTBUY"),
            txn("b", "2025-01-15", -9000, "AFFIRM * BESTBUY"),
        ];

        assert!(infer(&cluster(members), &config).is_none());
    }

    #[test]
    fn test_median_gap_even_count() {
        let members = vec![
            txn("a", "2025-01-01", -5000, "X"),
            txn("b", "2025-01-08", -5000, "X"),
            txn("c", "2025-01-22", -5000, "X"),
        ];
        assert_eq!(median_gap_days(&members), Some(10.5));
    }
}
