#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Duration;

use copse::chain::{
    BehaviorFlags, BestState, Chain, ChainError, ChainParams, Checkpoint, Deployment, FlushMode,
    Network, Notification, NotificationCallback, UtxoEntry,
};
use copse::manager::PeerNotifier;
use copse::mempool::{FeeEstimator, MempoolError, TxPool};
use copse::peer::{Peer, PeerId};
use copse::utreexo::{find_previous_root_hint, UtreexoRootHint, UtreexoViewpoint};
use copse::wire::{
    AnyBlock, Block, BlockHeader, Hash256, Message, OutPoint, RejectCode, Transaction, TxIn,
    TxOut, UBlock, UData,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

pub const GENESIS_HASH: Hash256 = [9u8; 32];

pub fn height_hash(height: i32) -> Hash256 {
    let mut hash = [0u8; 32];
    hash[..4].copy_from_slice(&height.to_le_bytes());
    hash[4] = 0xee;
    hash
}

/// A coinbase carrying the BIP34-style height push expected of version 2
/// blocks.
pub fn coinbase_for_height(height: i32) -> Transaction {
    let mut script_sig = vec![4u8];
    script_sig.extend_from_slice(&height.to_le_bytes());
    Transaction {
        version: 2,
        inputs: vec![TxIn {
            prev_out: OutPoint { hash: [0u8; 32], index: u32::MAX },
            script_sig,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut { value: 50, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

/// A uniquely-keyed spend so tests can watch mempool bookkeeping.
pub fn spend_for_height(height: i32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prev_out: OutPoint { hash: height_hash(height), index: 0 },
            script_sig: vec![0x51],
            witness: Vec::new(),
        }],
        outputs: vec![TxOut { value: 25, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

/// Build `count` blocks linked from the genesis hash. Each block carries a
/// coinbase and, when asked, one ordinary spend.
pub fn build_chain(count: i32, with_spends: bool) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut prev_hash = GENESIS_HASH;
    for height in 1..=count {
        let mut transactions = vec![coinbase_for_height(height)];
        if with_spends {
            transactions.push(spend_for_height(height));
        }
        let block = Block {
            header: BlockHeader {
                version: 2,
                prev_block: prev_hash,
                merkle_root: height_hash(height),
                timestamp: 1_600_000_000 + height as u32,
                bits: 0x1d00ffff,
                nonce: height as u32,
            },
            transactions,
        };
        prev_hash = block.block_hash();
        blocks.push(block);
    }
    blocks
}

pub fn ublocks_from(blocks: &[Block], start_height: i32) -> Vec<UBlock> {
    blocks
        .iter()
        .enumerate()
        .map(|(i, block)| UBlock {
            block: block.clone(),
            udata: UData {
                proof_targets: Vec::new(),
                proof_hashes: Vec::new(),
                leaf_ttls: Vec::new(),
            },
            height: start_height + i as i32,
        })
        .collect()
}

pub fn make_peer(
    id: PeerId,
    last_block: i32,
    services: u64,
) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
    let addr = format!("127.0.0.1:{}", 8000 + id as u16).parse().unwrap();
    let (peer, rx) = Peer::new(id, addr, services, last_block, "/copse-test:0.1.0/");
    (Arc::new(peer), rx)
}

pub async fn expect_msg(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a peer message")
        .expect("peer message channel closed")
}

/// Configurable in-memory stand-in for the chain engine.
pub struct MockChain {
    pub params: Arc<ChainParams>,
    pub best: Mutex<BestState>,
    pub checkpoints: Vec<Checkpoint>,
    pub segwit_active: bool,
    /// Height at which `is_current` starts returning true.
    pub current_at: i32,
    pub orphans: Mutex<HashSet<Hash256>>,
    pub orphan_roots: Mutex<HashMap<Hash256, Hash256>>,
    pub known_blocks: Mutex<HashSet<Hash256>>,
    pub heights_by_hash: Mutex<HashMap<Hash256, i32>>,
    pub root_hints: Vec<UtreexoRootHint>,
    pub processed: Mutex<Vec<Hash256>>,
    pub fail_next_block: Mutex<Option<ChainError>>,
    subscribers: Mutex<Vec<NotificationCallback>>,
}

impl MockChain {
    pub fn new(network: Network, current_at: i32) -> Self {
        Self {
            params: Arc::new(ChainParams { network }),
            best: Mutex::new(BestState { hash: GENESIS_HASH, height: 0 }),
            checkpoints: Vec::new(),
            segwit_active: false,
            current_at,
            orphans: Mutex::new(HashSet::new()),
            orphan_roots: Mutex::new(HashMap::new()),
            known_blocks: Mutex::new(HashSet::new()),
            heights_by_hash: Mutex::new(HashMap::new()),
            root_hints: Vec::new(),
            processed: Mutex::new(Vec::new()),
            fail_next_block: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn tip_height(&self) -> i32 {
        self.best.lock().unwrap().height
    }

    fn notify(&self, notification: Notification) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(notification.clone());
        }
    }

    fn accept(&self, block: AnyBlock) -> Result<bool, ChainError> {
        let hash = block.hash();
        self.processed.lock().unwrap().push(hash);

        if let Some(err) = self.fail_next_block.lock().unwrap().take() {
            return Err(err);
        }
        if self.orphans.lock().unwrap().contains(&hash) {
            return Ok(true);
        }

        {
            let mut best = self.best.lock().unwrap();
            best.height += 1;
            best.hash = hash;
        }
        self.known_blocks.lock().unwrap().insert(hash);

        self.notify(Notification::BlockConnected(block.clone()));
        if let AnyBlock::Plain(plain) = &block {
            self.notify(Notification::BlockAccepted(Arc::clone(plain)));
        }
        Ok(false)
    }
}

impl Chain for MockChain {
    fn best_snapshot(&self) -> BestState {
        *self.best.lock().unwrap()
    }

    fn process_block(&self, block: &Block, _flags: BehaviorFlags) -> Result<bool, ChainError> {
        self.accept(AnyBlock::Plain(Arc::new(block.clone())))
    }

    fn process_ublock(&self, ublock: &UBlock, _flags: BehaviorFlags) -> Result<bool, ChainError> {
        self.accept(AnyBlock::Utreexo(Arc::new(ublock.clone())))
    }

    fn process_header_ublock(
        &self,
        ublock: &UBlock,
        view: &mut UtreexoViewpoint,
        _flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        // Fold monotonically by height so range workers can land in any
        // order and the final roots still reflect the newest block.
        if ublock.height as u64 > view.num_leaves() {
            view.update(vec![height_hash(ublock.height)], ublock.height as u64);
        }
        Ok(true)
    }

    fn process_headers(
        &self,
        _headers: &[BlockHeader],
        _start_root: Option<&UtreexoRootHint>,
        _flags: BehaviorFlags,
    ) -> Result<(), ChainError> {
        Ok(())
    }

    fn latest_block_locator(&self) -> Result<Vec<Hash256>, ChainError> {
        Ok(vec![self.best.lock().unwrap().hash])
    }

    fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256> {
        vec![*hash]
    }

    fn block_height_by_hash(&self, hash: &Hash256) -> Result<i32, ChainError> {
        self.heights_by_hash
            .lock()
            .unwrap()
            .get(hash)
            .copied()
            .ok_or_else(|| ChainError::NotFound(copse::wire::hash_to_hex(hash)))
    }

    fn have_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.known_blocks.lock().unwrap().contains(hash))
    }

    fn have_ublock(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.known_blocks.lock().unwrap().contains(hash))
    }

    fn is_known_orphan(&self, hash: &Hash256, _utreexo: bool) -> bool {
        self.orphans.lock().unwrap().contains(hash)
    }

    fn get_orphan_root(&self, hash: &Hash256, _utreexo: bool) -> Hash256 {
        self.orphan_roots
            .lock()
            .unwrap()
            .get(hash)
            .copied()
            .unwrap_or(*hash)
    }

    fn fetch_utxo_entry(&self, _outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError> {
        Ok(None)
    }

    fn is_deployment_active(&self, _deployment: Deployment) -> Result<bool, ChainError> {
        Ok(self.segwit_active)
    }

    fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.clone()
    }

    fn is_current(&self) -> bool {
        self.best.lock().unwrap().height >= self.current_at
    }

    fn subscribe(&self, callback: NotificationCallback) {
        self.subscribers.lock().unwrap().push(callback);
    }

    fn flush_cached_state(&self, _mode: FlushMode) -> Result<(), ChainError> {
        Ok(())
    }

    fn lookup_node(&self, hash: &Hash256) -> Result<i32, ChainError> {
        self.heights_by_hash
            .lock()
            .unwrap()
            .get(hash)
            .copied()
            .ok_or_else(|| ChainError::NotFound(copse::wire::hash_to_hex(hash)))
    }

    fn utreexo_root_hints(&self) -> Vec<UtreexoRootHint> {
        self.root_hints.clone()
    }

    fn find_previous_utreexo_root_hint(&self, height: i32) -> Option<UtreexoRootHint> {
        find_previous_root_hint(height, &self.root_hints)
    }

    fn set_utreexo_viewpoint(&self, _hint: Option<&UtreexoRootHint>) -> Result<(), ChainError> {
        Ok(())
    }
}

/// Call-recording stand-in for the transaction pool.
pub struct MockTxPool {
    pub reject_all: bool,
    pub processed: Mutex<Vec<Hash256>>,
    pub removed: Mutex<Vec<Hash256>>,
}

impl MockTxPool {
    pub fn new(reject_all: bool) -> Self {
        Self {
            reject_all,
            processed: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }
}

impl TxPool for MockTxPool {
    fn process_transaction(
        &self,
        tx: &Arc<Transaction>,
        _allow_orphan: bool,
        _rate_limit: bool,
        _tag: i32,
    ) -> Result<Vec<Arc<Transaction>>, MempoolError> {
        self.processed.lock().unwrap().push(tx.txid());
        if self.reject_all {
            return Err(MempoolError::Rule {
                code: RejectCode::InsufficientFee,
                reason: "fee below relay minimum".to_string(),
            });
        }
        Ok(vec![Arc::clone(tx)])
    }

    fn have_transaction(&self, _hash: &Hash256) -> bool {
        false
    }

    fn maybe_accept_transaction(
        &self,
        _tx: &Transaction,
        _is_new: bool,
        _rate_limit: bool,
    ) -> Result<(), MempoolError> {
        Ok(())
    }

    fn remove_transaction(&self, tx: &Transaction, _remove_redeemers: bool) {
        self.removed.lock().unwrap().push(tx.txid());
    }

    fn remove_double_spends(&self, _tx: &Transaction) {}

    fn remove_orphan(&self, _tx: &Transaction) {}

    fn process_orphans(&self, _tx: &Transaction) -> Vec<Arc<Transaction>> {
        Vec::new()
    }
}

/// Call-recording stand-in for the server-side notifier.
#[derive(Default)]
pub struct MockNotifier {
    pub announced: Mutex<Vec<usize>>,
    pub relayed: Mutex<Vec<Hash256>>,
    pub height_updates: Mutex<Vec<(Hash256, i32, PeerId)>>,
    pub confirmed: Mutex<Vec<Hash256>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relayed_count(&self) -> usize {
        self.relayed.lock().unwrap().len()
    }

    pub fn height_updates(&self) -> Vec<(Hash256, i32, PeerId)> {
        self.height_updates.lock().unwrap().clone()
    }
}

impl PeerNotifier for MockNotifier {
    fn announce_new_transactions(&self, txs: &[Arc<Transaction>]) {
        self.announced.lock().unwrap().push(txs.len());
    }

    fn relay_inventory(&self, inv: copse::wire::InvVect, _header: &BlockHeader) {
        self.relayed.lock().unwrap().push(inv.hash);
    }

    fn update_peer_heights(&self, hash: &Hash256, height: i32, source: PeerId) {
        self.height_updates.lock().unwrap().push((*hash, height, source));
    }

    fn transaction_confirmed(&self, tx: &Transaction) {
        self.confirmed.lock().unwrap().push(tx.txid());
    }
}

#[derive(Default)]
pub struct MockFeeEstimator {
    pub registered: Mutex<usize>,
    pub rolled_back: Mutex<usize>,
    pub resets: Mutex<usize>,
}

impl FeeEstimator for MockFeeEstimator {
    fn register_block(&self, _block: &Block) -> anyhow::Result<()> {
        *self.registered.lock().unwrap() += 1;
        Ok(())
    }

    fn rollback(&self, _hash: &Hash256) {
        *self.rolled_back.lock().unwrap() += 1;
    }

    fn reset(&self) {
        *self.resets.lock().unwrap() += 1;
    }
}
