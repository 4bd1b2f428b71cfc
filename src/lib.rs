// BNPL Contract Reconstruction - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod builder;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod contract;
pub mod db;
pub mod detector;
pub mod engine;
pub mod error;
pub mod inference;
pub mod matcher;
pub mod rollup;
pub mod rules;
pub mod schema;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use builder::{snap_installment_count, Binding, ContractBuilder, ContractBundle};
pub use cache::TtlCache;
pub use cluster::{cluster_candidates, Cluster, ClusterKey};
pub use config::EngineConfig;
pub use contract::{
    Cadence, Contract, ContractState, Installment, InstallmentStatus, Link,
};
pub use db::{
    get_events_for_entity, get_transactions_for_user, insert_event, insert_transactions, load_csv,
    setup_database, verify_count, Event, LoadedTransactions, Transaction,
};
pub use detector::{Candidate, Detection, LexicalDetector};
pub use engine::{
    BnplEngine, ContractDetail, InstallmentAmount, ReconcileOutcome, ReconstructReport, UserEdit,
};
pub use error::EngineError;
pub use inference::{infer, Inference};
pub use matcher::{Application, MatchScore, ReconciliationMatcher};
pub use rollup::{rollup, Rollup};
pub use rules::{ProviderMatch, ProviderRule, ProviderRuleSet};
pub use schema::{QuarantinedRecord, SchemaValidator, ValidationError, ValidationResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
