// 🧩 Clusterer - Candidates → provisional contracts
// Group by (provider, merchant hint, account), then cut each group
// wherever payments stop being contiguous.

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::SEGMENTATION_GAP_DAYS;
use crate::db::Transaction;
use crate::detector::Candidate;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    pub provider: String,
    pub merchant_hint: String,
    pub account_id: String,
}

/// Time-bounded run of same-key candidates, in chronological order
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub key: ClusterKey,
    pub members: Vec<Transaction>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Group and segment candidates. Clusters with fewer than 2 members are dropped.
/// Output order is deterministic: by key, then by first date.
pub fn cluster_candidates(candidates: Vec<Candidate>) -> Vec<Cluster> {
    let mut groups: BTreeMap<ClusterKey, Vec<Transaction>> = BTreeMap::new();

    for candidate in candidates {
        let key = ClusterKey {
            provider: candidate.provider,
            merchant_hint: candidate.merchant_hint,
            account_id: candidate.txn.account_id.clone(),
        };
        groups.entry(key).or_default().push(candidate.txn);
    }

    let mut clusters = Vec::new();

    for (key, mut members) in groups {
        members.sort_by(|a, b| {
            a.posted_date
                .cmp(&b.posted_date)
                .then_with(|| a.id.cmp(&b.id))
        });

        for segment in segment_by_gap(members, SEGMENTATION_GAP_DAYS) {
            if segment.len() < 2 {
                debug!(
                    provider = %key.provider,
                    merchant = %key.merchant_hint,
                    "Dropping single-transaction cluster"
                );
                continue;
            }
            clusters.push(Cluster {
                key: key.clone(),
                members: segment,
            });
        }
    }

    clusters
}

/// Split a date-sorted list wherever consecutive dates are more than `max_gap_days` apart
fn segment_by_gap(sorted: Vec<Transaction>, max_gap_days: i64) -> Vec<Vec<Transaction>> {
    let mut segments: Vec<Vec<Transaction>> = Vec::new();

    for txn in sorted {
        let starts_new = match segments.last().and_then(|s| s.last()) {
            Some(prev) => (txn.posted_date - prev.posted_date).num_days() > max_gap_days,
            None => true,
        };

        if starts_new {
            segments.push(vec![txn]);
        } else if let Some(current) = segments.last_mut() {
            current.push(txn);
        }
    }

    segments
}

// ============================================================================
// TESTS
// ============================================================================
