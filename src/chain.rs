use std::sync::Arc;

use thiserror::Error;

use crate::utreexo::{UtreexoRootHint, UtreexoViewpoint};
use crate::wire::{AnyBlock, Block, BlockHeader, Hash256, OutPoint, Transaction};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
}

impl ChainParams {
    pub fn is_regtest(&self) -> bool {
        self.network == Network::Regtest
    }
}

/// A hard-coded known-good block. Headers downloaded up to a checkpoint need
/// less validation since the checkpoint hash vouches for them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Snapshot of the chain tip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BestState {
    pub hash: Hash256,
    pub height: i32,
}

/// Validation behavior tweaks passed through to block processing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BehaviorFlags {
    /// Skip checks already subsumed by header verification.
    pub fast_add: bool,
}

impl BehaviorFlags {
    pub const NONE: BehaviorFlags = BehaviorFlags { fast_add: false };
    pub const FAST_ADD: BehaviorFlags = BehaviorFlags { fast_add: true };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    Periodic,
    Required,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Deployment {
    Segwit,
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// The block or header broke a consensus rule. Logged, rejected, never
    /// escalated.
    #[error("rule violation: {0}")]
    Rule(String),
    /// The block database is corrupt. Processing cannot continue.
    #[error("database corruption: {0}")]
    DbCorruption(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("block not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl ChainError {
    pub fn is_rule_error(&self) -> bool {
        matches!(self, ChainError::Rule(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, ChainError::DbCorruption(_))
    }
}

/// A spendable-output record from the chain's UTXO view.
#[derive(Clone, Copy, Debug)]
pub struct UtxoEntry {
    pub amount: i64,
    pub block_height: i32,
    pub spent: bool,
}

impl UtxoEntry {
    pub fn is_spent(&self) -> bool {
        self.spent
    }
}

/// Events published by the chain engine as blocks move through it.
#[derive(Clone, Debug)]
pub enum Notification {
    /// A block passed validation and entered the chain (main or side).
    BlockAccepted(Arc<Block>),
    /// A block was connected to the main chain. Compact-state nodes see the
    /// ublock that carried the proof.
    BlockConnected(AnyBlock),
    /// A block was disconnected from the main chain during a reorganization.
    BlockDisconnected(Arc<Block>),
}

pub type NotificationCallback = Box<dyn Fn(Notification) + Send + Sync>;

/// The chain engine as the sync manager sees it. Validation, storage and
/// fork choice live behind this seam.
pub trait Chain: Send + Sync {
    fn best_snapshot(&self) -> BestState;

    /// Submit a block. Returns whether the block is an orphan.
    fn process_block(&self, block: &Block, flags: BehaviorFlags) -> Result<bool, ChainError>;

    /// Submit a ublock. Returns whether the block is an orphan.
    fn process_ublock(
        &self,
        ublock: &crate::wire::UBlock,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError>;

    /// Replay a ublock against an accumulator viewpoint, validating it
    /// against the already-verified header chain. Returns whether the block
    /// is on the main chain. Calls for a given viewpoint are serialized by
    /// height.
    fn process_header_ublock(
        &self,
        ublock: &crate::wire::UBlock,
        view: &mut UtreexoViewpoint,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError>;

    /// Validate a batch of headers against the stored header chain,
    /// optionally anchored at a utreexo start root.
    fn process_headers(
        &self,
        headers: &[BlockHeader],
        start_root: Option<&UtreexoRootHint>,
        flags: BehaviorFlags,
    ) -> Result<(), ChainError>;

    fn latest_block_locator(&self) -> Result<Vec<Hash256>, ChainError>;
    fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256>;
    fn block_height_by_hash(&self, hash: &Hash256) -> Result<i32, ChainError>;

    /// Whether the block is known in any form: main chain, side chain, or
    /// orphan pool.
    fn have_block(&self, hash: &Hash256) -> Result<bool, ChainError>;
    fn have_ublock(&self, hash: &Hash256) -> Result<bool, ChainError>;

    fn is_known_orphan(&self, hash: &Hash256, utreexo: bool) -> bool;
    fn get_orphan_root(&self, hash: &Hash256, utreexo: bool) -> Hash256;

    fn fetch_utxo_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError>;

    fn is_deployment_active(&self, deployment: Deployment) -> Result<bool, ChainError>;
    fn checkpoints(&self) -> Vec<Checkpoint>;
    fn is_current(&self) -> bool;

    fn subscribe(&self, callback: NotificationCallback);
    fn flush_cached_state(&self, mode: FlushMode) -> Result<(), ChainError>;

    /// Height of a block already known to the header chain.
    fn lookup_node(&self, hash: &Hash256) -> Result<i32, ChainError>;

    fn utreexo_root_hints(&self) -> Vec<UtreexoRootHint>;
    fn find_previous_utreexo_root_hint(&self, height: i32) -> Option<UtreexoRootHint>;
    fn set_utreexo_viewpoint(&self, hint: Option<&UtreexoRootHint>) -> Result<(), ChainError>;
}

/// Whether a block's coinbase is required to carry the serialized height
/// (version 2 and later).
pub fn should_have_serialized_block_height(header: &BlockHeader) -> bool {
    header.version >= 2
}

/// Extract the height committed in the first push of the coinbase script.
pub fn extract_coinbase_height(coinbase: &Transaction) -> Result<i32, ChainError> {
    let script = coinbase
        .inputs
        .first()
        .map(|input| input.script_sig.as_slice())
        .unwrap_or_default();
    let Some((&len, rest)) = script.split_first() else {
        return Err(ChainError::Rule(
            "coinbase script is empty, height is missing".to_string(),
        ));
    };
    let len = len as usize;
    if len == 0 || len > 8 || rest.len() < len {
        return Err(ChainError::Rule(format!(
            "coinbase script has malformed height push of {} bytes",
            len
        )));
    }
    let mut height: i64 = 0;
    for (i, &byte) in rest[..len].iter().enumerate() {
        height |= (byte as i64) << (8 * i);
    }
    if height < 0 || height > i32::MAX as i64 {
        return Err(ChainError::Rule(format!(
            "coinbase height {} out of range",
            height
        )));
    }
    Ok(height as i32)
}
