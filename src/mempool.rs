use std::sync::Arc;

use thiserror::Error;

use crate::chain::ChainError;
use crate::wire::{Block, Hash256, RejectCode, Transaction};

#[derive(Debug, Error)]
pub enum MempoolError {
    /// The transaction was rejected under consensus or policy rules rather
    /// than by an internal failure.
    #[error("rule violation: {reason}")]
    Rule { code: RejectCode, reason: String },
    #[error("{0}")]
    Other(String),
}

impl MempoolError {
    pub fn is_rule_error(&self) -> bool {
        matches!(self, MempoolError::Rule { .. })
    }
}

/// Convert a processing error into the code and reason carried by a reject
/// message.
pub trait ToRejectErr {
    fn to_reject_err(&self) -> (RejectCode, String);
}

impl ToRejectErr for MempoolError {
    fn to_reject_err(&self) -> (RejectCode, String) {
        match self {
            MempoolError::Rule { code, reason } => (*code, reason.clone()),
            MempoolError::Other(reason) => (RejectCode::Malformed, reason.clone()),
        }
    }
}

impl ToRejectErr for ChainError {
    fn to_reject_err(&self) -> (RejectCode, String) {
        match self {
            ChainError::Rule(reason) => (RejectCode::Invalid, reason.clone()),
            other => (RejectCode::Malformed, other.to_string()),
        }
    }
}

/// The transaction memory pool as the sync manager sees it.
pub trait TxPool: Send + Sync {
    /// Validate and insert a transaction, handling orphans. Returns the
    /// transactions accepted as a result, the submitted one first.
    fn process_transaction(
        &self,
        tx: &Arc<Transaction>,
        allow_orphan: bool,
        rate_limit: bool,
        tag: i32,
    ) -> Result<Vec<Arc<Transaction>>, MempoolError>;

    /// Whether the pool knows the transaction in any form (main pool or
    /// orphan pool).
    fn have_transaction(&self, hash: &Hash256) -> bool;

    /// Re-validate a transaction against the current chain view without
    /// orphan handling, as used when reinserting after a disconnect.
    fn maybe_accept_transaction(
        &self,
        tx: &Transaction,
        is_new: bool,
        rate_limit: bool,
    ) -> Result<(), MempoolError>;

    fn remove_transaction(&self, tx: &Transaction, remove_redeemers: bool);
    fn remove_double_spends(&self, tx: &Transaction);
    fn remove_orphan(&self, tx: &Transaction);

    /// Promote any orphans made valid by the passed transaction. Returns the
    /// newly accepted transactions.
    fn process_orphans(&self, tx: &Transaction) -> Vec<Arc<Transaction>>;
}

/// The fee estimator fed by block connect/disconnect events.
pub trait FeeEstimator: Send + Sync {
    fn register_block(&self, block: &Block) -> anyhow::Result<()>;
    fn rollback(&self, hash: &Hash256);

    /// Discard all observations. Used when `register_block` fails and the
    /// estimator state can no longer be trusted.
    fn reset(&self);
}
