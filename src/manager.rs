use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::chain::{
    extract_coinbase_height, should_have_serialized_block_height, BehaviorFlags, Chain,
    ChainError, ChainParams, Checkpoint, Deployment, FlushMode, Notification,
};
use crate::mempool::{FeeEstimator, ToRejectErr, TxPool};
use crate::peer::{Peer, PeerId};
use crate::progress::BlockProgressLogger;
use crate::utreexo::{find_previous_root_hint, UtreexoRootHint, UtreexoViewpoint};
use crate::wire::{
    hash_to_hex, AnyBlock, Block, BlockHeader, Hash256, InvType, InvVect, Message, Transaction,
    UBlock, MAX_INV_PER_MSG, SERVICE_NODE_NETWORK, SERVICE_NODE_UTREEXO, ZERO_HASH,
};

/// Minimum number of blocks that should be in flight in headers-first mode
/// before requesting the next batch.
const MIN_IN_FLIGHT_BLOCKS: usize = 10;

/// Maximum number of rejected transaction hashes remembered.
const MAX_REJECTED_TXNS: usize = 1000;

const MAX_REQUESTED_BLOCKS: usize = MAX_INV_PER_MSG;
const MAX_REQUESTED_TXNS: usize = MAX_INV_PER_MSG;

/// Time without progress after which the sync peer is replaced.
const MAX_STALL_DURATION: Duration = Duration::from_secs(3 * 60);

/// Interval at which the stall check runs.
const STALL_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Insert into a bounded set, evicting an arbitrary entry when the set is
/// full. The victim does not need to be chosen deterministically: targeting
/// the eviction of a specific entry would require a preimage attack on the
/// hash function.
fn limit_add(set: &mut HashSet<Hash256>, hash: Hash256, limit: usize) {
    if set.len() + 1 > limit {
        if let Some(victim) = set.iter().next().copied() {
            set.remove(&victim);
        }
    }
    set.insert(hash);
}

/// One entry in the list of headers linked between checkpoints.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderNode {
    pub height: i32,
    pub hash: Hash256,
}

/// Outcome of verifying one utreexo root hint range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessedRootHint {
    pub validated: bool,
    pub height: i32,
}

/// Everything the sync manager tracks about one connected peer.
struct PeerSyncState {
    peer: Arc<Peer>,
    sync_candidate: bool,
    request_queue: Vec<InvVect>,
    requested_txns: HashSet<Hash256>,
    requested_blocks: HashSet<Hash256>,
}

/// An in-progress root-hint verification range: the accumulator view being
/// advanced block by block until it reaches the target root.
struct UTreeState {
    view: Mutex<UtreexoViewpoint>,
    start_root: Option<UtreexoRootHint>,
    root_to_verify: UtreexoRootHint,
}

/// Callbacks the manager uses to announce events to the rest of the node.
pub trait PeerNotifier: Send + Sync {
    fn announce_new_transactions(&self, txs: &[Arc<Transaction>]);
    fn relay_inventory(&self, inv: InvVect, header: &BlockHeader);
    fn update_peer_heights(&self, hash: &Hash256, height: i32, source: PeerId);
    fn transaction_confirmed(&self, tx: &Transaction);
}

pub struct Config {
    pub peer_notifier: Arc<dyn PeerNotifier>,
    pub chain: Arc<dyn Chain>,
    pub tx_pool: Arc<dyn TxPool>,
    pub chain_params: Arc<ChainParams>,
    pub fee_estimator: Option<Arc<dyn FeeEstimator>>,
    pub disable_checkpoints: bool,
    pub utreexo_csn: bool,
    pub utreexo_mn: bool,
    pub utreexo_wn: bool,
    pub utreexo_root_verify_mode: bool,
    pub utreexo_start_root: Option<UtreexoRootHint>,
}

/// Tagged messages dispatched by the event loops.
enum SyncMessage {
    NewPeer(Arc<Peer>),
    DonePeer(Arc<Peer>),
    Tx {
        tx: Arc<Transaction>,
        peer: Arc<Peer>,
        done: Option<oneshot::Sender<()>>,
    },
    Block {
        block: Arc<Block>,
        peer: Arc<Peer>,
        done: Option<oneshot::Sender<()>>,
    },
    UBlock {
        ublock: Arc<UBlock>,
        peer: Arc<Peer>,
        done: Option<oneshot::Sender<()>>,
    },
    Inv {
        inv: Vec<InvVect>,
        peer: Arc<Peer>,
    },
    Headers {
        headers: Vec<BlockHeader>,
        peer: Arc<Peer>,
    },
    NotFound {
        not_found: Vec<InvVect>,
        peer: Arc<Peer>,
    },
    GetSyncPeer {
        reply: oneshot::Sender<PeerId>,
    },
    ProcessBlock {
        block: Arc<Block>,
        flags: BehaviorFlags,
        reply: oneshot::Sender<Result<bool, ChainError>>,
    },
    ProcessUBlock {
        ublock: Arc<UBlock>,
        flags: BehaviorFlags,
        reply: oneshot::Sender<Result<bool, ChainError>>,
    },
    IsCurrent {
        reply: oneshot::Sender<bool>,
    },
    Pause {
        unpause: oneshot::Receiver<()>,
    },
    VerifyRootHint(UtreexoRootHint),
    ProcessedRootHint(ProcessedRootHint),
    ChainNotification(Notification),
}

impl SyncMessage {
    fn name(&self) -> &'static str {
        match self {
            SyncMessage::NewPeer(_) => "new peer",
            SyncMessage::DonePeer(_) => "done peer",
            SyncMessage::Tx { .. } => "tx",
            SyncMessage::Block { .. } => "block",
            SyncMessage::UBlock { .. } => "ublock",
            SyncMessage::Inv { .. } => "inv",
            SyncMessage::Headers { .. } => "headers",
            SyncMessage::NotFound { .. } => "notfound",
            SyncMessage::GetSyncPeer { .. } => "get sync peer",
            SyncMessage::ProcessBlock { .. } => "process block",
            SyncMessage::ProcessUBlock { .. } => "process ublock",
            SyncMessage::IsCurrent { .. } => "is current",
            SyncMessage::Pause { .. } => "pause",
            SyncMessage::VerifyRootHint(_) => "verify root hint",
            SyncMessage::ProcessedRootHint(_) => "processed root hint",
            SyncMessage::ChainNotification(_) => "chain notification",
        }
    }
}

/// The sync manager. Communicates block-related messages with peers: selects
/// a peer to sync from, drives the initial block download (headers-first to
/// the last checkpoint when possible), verifies utreexo root hints, and once
/// the chain is in sync relays announcements of new blocks.
///
/// All state lives behind a single message channel consumed by exactly one
/// of three event loops, chosen by which `start_*` method runs first.
pub struct SyncManager {
    msg_tx: mpsc::UnboundedSender<SyncMessage>,
    started: AtomicBool,
    shutdown: Arc<AtomicBool>,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
    new_sync_peer: watch::Receiver<bool>,
    handler: StdMutex<Option<SyncHandler>>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    /// Construct a new sync manager. Use one of the `start_*` methods to
    /// begin processing.
    pub fn new(config: Config) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (quit_tx, quit_rx) = watch::channel(false);
        let (first_peer_tx, first_peer_rx) = watch::channel(false);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handler = SyncHandler {
            chain_params: config.chain_params,
            chain: Arc::clone(&config.chain),
            tx_pool: config.tx_pool,
            peer_notifier: config.peer_notifier,
            fee_estimator: config.fee_estimator,
            progress: BlockProgressLogger::new("Processed"),
            msg_tx: msg_tx.clone(),
            msg_rx,
            quit: quit_rx.clone(),
            shutdown: Arc::clone(&shutdown),
            first_sync_peer: first_peer_tx,
            rejected_txns: HashSet::new(),
            requested_txns: HashSet::new(),
            requested_blocks: Arc::new(RwLock::new(HashSet::new())),
            peer_states: Arc::new(RwLock::new(HashMap::new())),
            sync_peer: None,
            sync_peer_id: Arc::new(AtomicI32::new(0)),
            last_progress_time: Arc::new(Mutex::new(Instant::now())),
            headers_first_mode: false,
            header_list: VecDeque::new(),
            start_header: None,
            next_checkpoint: None,
            utreexo_csn: config.utreexo_csn,
            utreexo_mn: config.utreexo_mn,
            utreexo_wn: config.utreexo_wn,
            utreexo_root_verify_mode: config.utreexo_root_verify_mode,
            utreexo_root_to_verify: None,
            utreexo_start_root: config.utreexo_start_root,
            u_tree_map: Arc::new(RwLock::new(HashMap::new())),
        };

        let best = handler.chain.best_snapshot();
        if !config.disable_checkpoints {
            handler.next_checkpoint = handler.find_next_header_checkpoint(best.height);
            if handler.next_checkpoint.is_some() {
                handler.reset_header_state(&best.hash, best.height);
            }
        } else {
            tracing::info!("Checkpoints are disabled");
            if handler.utreexo_root_verify_mode {
                handler.header_list.push_back(HeaderNode {
                    height: best.height,
                    hash: best.hash,
                });
            }
        }

        let notify_tx = msg_tx.clone();
        config.chain.subscribe(Box::new(move |notification| {
            let _ = notify_tx.send(SyncMessage::ChainNotification(notification));
        }));

        Self {
            msg_tx,
            started: AtomicBool::new(false),
            shutdown,
            quit_tx,
            quit_rx,
            new_sync_peer: first_peer_rx,
            handler: StdMutex::new(Some(handler)),
            join: StdMutex::new(None),
        }
    }

    /// Begin the core block handler which processes block and inv messages.
    pub fn start(&self) {
        let Some(handler) = self.take_handler() else { return };
        tracing::trace!("Starting sync manager");
        self.store_join(tokio::spawn(handler.block_handler()));
    }

    /// Begin the headers-only handler, downloading headers up to the given
    /// root hint's height. Signals `done` once the header chain reaches it.
    pub fn start_headers_download(&self, root_hint: UtreexoRootHint, done: oneshot::Sender<()>) {
        let Some(mut handler) = self.take_handler() else { return };
        handler.utreexo_root_to_verify = Some(root_hint);
        if let Err(err) = handler
            .chain
            .set_utreexo_viewpoint(handler.utreexo_start_root.as_ref())
        {
            tracing::error!("Failed to set the utreexo viewpoint: {}", err);
        }
        tracing::trace!("Starting header download");
        self.store_join(tokio::spawn(handler.header_handler(done)));
    }

    /// Begin the root-hint verify handler. Results for every verified range
    /// arrive on the passed channel.
    pub fn start_utreexo_root_hint_verify(
        &self,
        verified: mpsc::UnboundedSender<ProcessedRootHint>,
    ) {
        let Some(handler) = self.take_handler() else { return };
        tracing::trace!("Starting utreexo root hint verify");
        self.store_join(tokio::spawn(handler.u_root_hint_verify_handler(verified)));
    }

    /// Begin the root-hint verify handler with parallel ublock workers.
    pub fn start_parallel_u_root_verify(
        &self,
        verified: mpsc::UnboundedSender<ProcessedRootHint>,
    ) {
        self.start_utreexo_root_hint_verify(verified);
    }

    /// Gracefully shut down the sync manager, waiting for the running loop
    /// to finish.
    pub async fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::warn!("Sync manager is already in the process of shutting down");
            return;
        }
        tracing::info!("Sync manager shutting down");
        let _ = self.quit_tx.send(true);
        let join = self.join.lock().ok().and_then(|mut guard| guard.take());
        if let Some(join) = join {
            if let Err(err) = join.await {
                tracing::error!("Sync handler task failed: {}", err);
            }
        }
    }

    /// Inform the sync manager of a newly active peer.
    pub fn new_peer(&self, peer: Arc<Peer>) {
        if self.is_shut_down() {
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::NewPeer(peer));
    }

    /// Inform the sync manager that a peer has disconnected.
    pub fn done_peer(&self, peer: Arc<Peer>) {
        if self.is_shut_down() {
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::DonePeer(peer));
    }

    /// Queue a transaction message for handling. `done` is signalled after
    /// the message has been processed.
    pub fn queue_tx(&self, tx: Arc<Transaction>, peer: Arc<Peer>, done: oneshot::Sender<()>) {
        if self.is_shut_down() {
            let _ = done.send(());
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::Tx {
            tx,
            peer,
            done: Some(done),
        });
    }

    /// Queue a block message for handling. `done` is signalled after the
    /// message has been processed.
    pub fn queue_block(&self, block: Arc<Block>, peer: Arc<Peer>, done: oneshot::Sender<()>) {
        if self.is_shut_down() {
            let _ = done.send(());
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::Block {
            block,
            peer,
            done: Some(done),
        });
    }

    /// Queue a ublock message for handling. `done` is signalled after the
    /// message has been processed.
    pub fn queue_ublock(&self, ublock: Arc<UBlock>, peer: Arc<Peer>, done: oneshot::Sender<()>) {
        if self.is_shut_down() {
            let _ = done.send(());
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::UBlock {
            ublock,
            peer,
            done: Some(done),
        });
    }

    /// Queue a ublock for the parallel verify pipeline. No completion signal;
    /// workers report through the verified channel instead.
    pub fn queue_parallel(&self, ublock: Arc<UBlock>, peer: Arc<Peer>) {
        if self.is_shut_down() {
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::UBlock {
            ublock,
            peer,
            done: None,
        });
    }

    /// Queue an inv message for handling.
    pub fn queue_inv(&self, inv: Vec<InvVect>, peer: Arc<Peer>) {
        if self.is_shut_down() {
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::Inv { inv, peer });
    }

    /// Queue a headers message for handling.
    pub fn queue_headers(&self, headers: Vec<BlockHeader>, peer: Arc<Peer>) {
        if self.is_shut_down() {
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::Headers { headers, peer });
    }

    /// Queue a notfound message for handling.
    pub fn queue_not_found(&self, not_found: Vec<InvVect>, peer: Arc<Peer>) {
        if self.is_shut_down() {
            return;
        }
        let _ = self.msg_tx.send(SyncMessage::NotFound { not_found, peer });
    }

    /// Submit a root hint for verification. Waits until the first sync
    /// candidate has appeared (or shutdown begins) before queueing.
    pub async fn queue_u_root_hint(&self, root_hint: UtreexoRootHint) {
        if self.is_shut_down() {
            return;
        }
        let mut new_sync_peer = self.new_sync_peer.clone();
        let mut quit = self.quit_rx.clone();
        tokio::select! {
            _ = new_sync_peer.wait_for(|ready| *ready) => {}
            _ = quit.changed() => {}
        }
        let _ = self.msg_tx.send(SyncMessage::VerifyRootHint(root_hint));
    }

    /// Process a block through the running loop, serializing the call with
    /// all other chain access. Returns whether the block is an orphan.
    pub async fn process_block(
        &self,
        block: Arc<Block>,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .msg_tx
            .send(SyncMessage::ProcessBlock {
                block,
                flags,
                reply: reply_tx,
            })
            .is_err()
        {
            return Err(ChainError::Other("sync manager is not running".to_string()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(ChainError::Other("sync manager stopped".to_string())))
    }

    /// Process a ublock through the running loop. Returns whether the block
    /// is an orphan.
    pub async fn process_ublock(
        &self,
        ublock: Arc<UBlock>,
        flags: BehaviorFlags,
    ) -> Result<bool, ChainError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .msg_tx
            .send(SyncMessage::ProcessUBlock {
                ublock,
                flags,
                reply: reply_tx,
            })
            .is_err()
        {
            return Err(ChainError::Other("sync manager is not running".to_string()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(ChainError::Other("sync manager stopped".to_string())))
    }

    /// Whether the manager believes it is synced with its peers.
    pub async fn is_current(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .msg_tx
            .send(SyncMessage::IsCurrent { reply: reply_tx })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// The id of the current sync peer, or 0 if there is none.
    pub async fn sync_peer_id(&self) -> PeerId {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .msg_tx
            .send(SyncMessage::GetSyncPeer { reply: reply_tx })
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Pause the sync manager, giving the caller exclusive access until the
    /// returned sender fires or is dropped. Avoid pausing for long.
    pub fn pause(&self) -> oneshot::Sender<()> {
        let (unpause_tx, unpause_rx) = oneshot::channel();
        let _ = self.msg_tx.send(SyncMessage::Pause { unpause: unpause_rx });
        unpause_tx
    }

    /// Install a previously downloaded header chain, as handed over from a
    /// headers-only download. Only valid before a loop has started.
    pub fn set_header_list(&self, nodes: Vec<HeaderNode>) {
        let Ok(mut guard) = self.handler.lock() else { return };
        match guard.as_mut() {
            Some(handler) => {
                handler.start_header = nodes.first().map(|node| node.height);
                handler.header_list = nodes.into();
            }
            None => tracing::warn!("Cannot install a header list on a running sync manager"),
        }
    }

    /// Rewind the fetch cursor to the front of the header list. Only valid
    /// before a loop has started.
    pub fn set_start_header(&self) {
        let Ok(mut guard) = self.handler.lock() else { return };
        match guard.as_mut() {
            Some(handler) => {
                handler.start_header = handler.header_list.front().map(|node| node.height);
            }
            None => tracing::warn!("Cannot move the start header on a running sync manager"),
        }
    }

    fn take_handler(&self) -> Option<SyncHandler> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.handler.lock().ok().and_then(|mut guard| guard.take())
    }

    fn store_join(&self, join: JoinHandle<()>) {
        if let Ok(mut guard) = self.join.lock() {
            *guard = Some(join);
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// The state machine behind the message channel. Owned by whichever event
/// loop is running; the maps ublock workers contend on are shared through
/// locks, everything else is loop-local.
struct SyncHandler {
    chain_params: Arc<ChainParams>,
    chain: Arc<dyn Chain>,
    tx_pool: Arc<dyn TxPool>,
    peer_notifier: Arc<dyn PeerNotifier>,
    fee_estimator: Option<Arc<dyn FeeEstimator>>,
    progress: BlockProgressLogger,
    msg_tx: mpsc::UnboundedSender<SyncMessage>,
    msg_rx: mpsc::UnboundedReceiver<SyncMessage>,
    quit: watch::Receiver<bool>,
    shutdown: Arc<AtomicBool>,
    first_sync_peer: watch::Sender<bool>,

    rejected_txns: HashSet<Hash256>,
    requested_txns: HashSet<Hash256>,
    requested_blocks: Arc<RwLock<HashSet<Hash256>>>,
    peer_states: Arc<RwLock<HashMap<PeerId, PeerSyncState>>>,
    sync_peer: Option<Arc<Peer>>,
    sync_peer_id: Arc<AtomicI32>,
    last_progress_time: Arc<Mutex<Instant>>,

    headers_first_mode: bool,
    header_list: VecDeque<HeaderNode>,
    start_header: Option<i32>,
    next_checkpoint: Option<Checkpoint>,

    utreexo_csn: bool,
    utreexo_mn: bool,
    utreexo_wn: bool,
    utreexo_root_verify_mode: bool,
    utreexo_root_to_verify: Option<UtreexoRootHint>,
    utreexo_start_root: Option<UtreexoRootHint>,
    u_tree_map: Arc<RwLock<HashMap<i32, Arc<UTreeState>>>>,
}

impl SyncHandler {
    /// The main handler. Processes block and inv messages on a single task
    /// so no handler ever observes half-applied state.
    async fn block_handler(mut self) {
        let mut stall_ticker = time::interval(STALL_SAMPLE_INTERVAL);
        stall_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        SyncMessage::NewPeer(peer) => self.handle_new_peer(peer).await,
                        SyncMessage::Tx { tx, peer, done } => {
                            self.handle_tx(tx, peer).await;
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                        }
                        SyncMessage::Block { block, peer, done } => {
                            self.handle_block(AnyBlock::Plain(block), peer).await;
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                        }
                        SyncMessage::UBlock { ublock, peer, done } => {
                            self.handle_block(AnyBlock::Utreexo(ublock), peer).await;
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                        }
                        SyncMessage::Inv { inv, peer } => self.handle_inv(inv, peer).await,
                        SyncMessage::Headers { headers, peer } => {
                            self.handle_headers(headers, peer).await
                        }
                        SyncMessage::NotFound { not_found, peer } => {
                            self.handle_not_found(not_found, peer).await
                        }
                        SyncMessage::DonePeer(peer) => self.handle_done_peer(peer).await,
                        SyncMessage::GetSyncPeer { reply } => {
                            let _ = reply.send(self.sync_peer.as_ref().map_or(0, |p| p.id()));
                        }
                        SyncMessage::ProcessBlock { block, flags, reply } => {
                            let _ = reply.send(self.chain.process_block(&block, flags));
                        }
                        SyncMessage::ProcessUBlock { ublock, flags, reply } => {
                            let _ = reply.send(self.chain.process_ublock(&ublock, flags));
                        }
                        SyncMessage::IsCurrent { reply } => {
                            let _ = reply.send(self.current());
                        }
                        SyncMessage::Pause { unpause } => {
                            // Wait until the sender unpauses the manager.
                            let _ = unpause.await;
                        }
                        SyncMessage::ChainNotification(notification) => {
                            self.handle_chain_notification(notification)
                        }
                        other => tracing::warn!(
                            "Invalid message type in block handler: {}",
                            other.name()
                        ),
                    }
                }
                _ = stall_ticker.tick() => self.handle_stall_sample().await,
                _ = self.quit.changed() => break,
            }
        }

        if !self.utreexo_root_verify_mode {
            tracing::debug!("Block handler shutting down: flushing blockchain caches...");
            if let Err(err) = self.chain.flush_cached_state(FlushMode::Required) {
                tracing::error!("Error while flushing blockchain caches: {}", err);
            }
        }
        tracing::trace!("Block handler done");
    }

    /// Headers-only handler, used to download the header chain up to a root
    /// hint before ublock verification begins.
    async fn header_handler(mut self, done: oneshot::Sender<()>) {
        let mut stall_ticker = time::interval(STALL_SAMPLE_INTERVAL);
        stall_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut done = Some(done);

        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        SyncMessage::NewPeer(peer) => self.handle_new_peer(peer).await,
                        SyncMessage::Headers { headers, peer } => {
                            if self.handle_only_headers(headers, peer).await {
                                if let Some(done) = done.take() {
                                    let _ = done.send(());
                                }
                                break;
                            }
                        }
                        SyncMessage::NotFound { not_found, peer } => {
                            self.handle_not_found(not_found, peer).await
                        }
                        SyncMessage::DonePeer(peer) => self.handle_done_peer(peer).await,
                        SyncMessage::GetSyncPeer { reply } => {
                            let _ = reply.send(self.sync_peer.as_ref().map_or(0, |p| p.id()));
                        }
                        SyncMessage::IsCurrent { reply } => {
                            let _ = reply.send(self.current());
                        }
                        SyncMessage::Pause { unpause } => {
                            let _ = unpause.await;
                        }
                        SyncMessage::ChainNotification(notification) => {
                            self.handle_chain_notification(notification)
                        }
                        other => tracing::warn!(
                            "Invalid message type in header handler: {}",
                            other.name()
                        ),
                    }
                }
                _ = stall_ticker.tick() => self.handle_stall_sample().await,
                _ = self.quit.changed() => break,
            }
        }

        tracing::trace!("Header handler done");
    }

    /// Root-hint verify handler. Ublock processing is handed to fresh worker
    /// tasks; their reports funnel back through the message channel.
    async fn u_root_hint_verify_handler(
        mut self,
        verified: mpsc::UnboundedSender<ProcessedRootHint>,
    ) {
        let mut stall_ticker = time::interval(STALL_SAMPLE_INTERVAL);
        stall_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        SyncMessage::VerifyRootHint(root_hint) => {
                            self.handle_verify_root_hint(root_hint).await
                        }
                        SyncMessage::NewPeer(peer) => self.handle_new_peer(peer).await,
                        SyncMessage::UBlock { ublock, peer, done } => {
                            let worker = self.verify_worker();
                            tokio::spawn(worker.handle_ublock(ublock, peer, done));
                        }
                        SyncMessage::Inv { inv, peer } => self.handle_inv(inv, peer).await,
                        SyncMessage::NotFound { not_found, peer } => {
                            self.handle_not_found(not_found, peer).await
                        }
                        SyncMessage::DonePeer(peer) => self.handle_done_peer(peer).await,
                        SyncMessage::ProcessedRootHint(result) => {
                            let _ = verified.send(result);
                        }
                        SyncMessage::GetSyncPeer { reply } => {
                            let _ = reply.send(self.sync_peer.as_ref().map_or(0, |p| p.id()));
                        }
                        SyncMessage::IsCurrent { reply } => {
                            let _ = reply.send(self.current());
                        }
                        SyncMessage::Pause { unpause } => {
                            let _ = unpause.await;
                        }
                        SyncMessage::ChainNotification(notification) => {
                            self.handle_chain_notification(notification)
                        }
                        other => tracing::warn!(
                            "Invalid message type in root hint verify handler: {}",
                            other.name()
                        ),
                    }
                }
                _ = stall_ticker.tick() => self.handle_stall_sample().await,
                _ = self.quit.changed() => break,
            }
        }

        tracing::trace!("Root hint verify handler done");
    }

    // ── Peer lifecycle ──────────────────────────────────────────────────

    async fn handle_new_peer(&mut self, peer: Arc<Peer>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        tracing::info!("New valid peer {} ({})", peer, peer.user_agent());

        let is_sync_candidate = self.is_sync_candidate(&peer);
        self.peer_states.write().await.insert(
            peer.id(),
            PeerSyncState {
                peer: Arc::clone(&peer),
                sync_candidate: is_sync_candidate,
                request_queue: Vec::new(),
                requested_txns: HashSet::new(),
                requested_blocks: HashSet::new(),
            },
        );

        if is_sync_candidate && self.sync_peer.is_none() {
            if !*self.first_sync_peer.borrow() {
                let _ = self.first_sync_peer.send(true);
            }
            self.start_sync().await;
        }
    }

    /// Whether the peer is worth considering as a sync peer.
    fn is_sync_candidate(&self, peer: &Peer) -> bool {
        // The regression test harness is not a full node yet still needs to
        // be considered a sync candidate, so only require localhost there.
        if self.chain_params.is_regtest() {
            return peer.addr().ip().is_loopback();
        }

        if self.utreexo_csn {
            if peer.services() & SERVICE_NODE_UTREEXO != SERVICE_NODE_UTREEXO {
                tracing::debug!("Peer {} is not a utreexo node, not a sync candidate", peer);
                return false;
            }
            return true;
        }

        let segwit_active = match self.chain.is_deployment_active(Deployment::Segwit) {
            Ok(active) => active,
            Err(err) => {
                tracing::error!("Unable to query for segwit soft-fork state: {}", err);
                false
            }
        };
        if peer.services() & SERVICE_NODE_NETWORK != SERVICE_NODE_NETWORK {
            return false;
        }
        !(segwit_active && !peer.is_witness_enabled())
    }

    async fn handle_done_peer(&mut self, peer: Arc<Peer>) {
        let Some(state) = self.peer_states.write().await.remove(&peer.id()) else {
            tracing::warn!("Received done peer message for unknown peer {}", peer);
            return;
        };

        tracing::info!("Lost peer {}", peer);

        self.clear_requested_state(&state).await;

        if self.sync_peer.as_ref().map(|p| p.id()) == Some(peer.id()) {
            // The server already disconnected the peer before signalling.
            self.update_sync_peer(false).await;
        }
    }

    /// Return every transaction and block the peer had in flight to the free
    /// pool so another peer may serve them.
    async fn clear_requested_state(&mut self, state: &PeerSyncState) {
        for tx_hash in &state.requested_txns {
            self.requested_txns.remove(tx_hash);
        }

        let mut requested_blocks = self.requested_blocks.write().await;
        for block_hash in &state.requested_blocks {
            requested_blocks.remove(block_hash);
        }
    }

    // ── Peer selection ──────────────────────────────────────────────────

    /// Choose the best peer among the candidates to sync the chain from.
    /// Returns without doing anything when a sync is already running.
    async fn start_sync(&mut self) {
        if self.sync_peer.is_some() {
            return;
        }

        // Root range verification runs its own selection; re-queue any range
        // that was in flight so a fresh peer picks it up.
        if self.utreexo_root_verify_mode {
            tracing::info!("Node is in utreexo root verify mode");
            if self.utreexo_mn {
                self.validate_utreexo_root().await;
                return;
            }
            let u_tree_map = self.u_tree_map.read().await;
            for state in u_tree_map.values() {
                tracing::info!(
                    "Re-queuing root hint at height {}",
                    state.root_to_verify.height
                );
                let _ = self
                    .msg_tx
                    .send(SyncMessage::VerifyRootHint(state.root_to_verify.clone()));
            }
            return;
        }

        // Once segwit has activated we only sync from witness-enabled peers
        // so all blockchain data gets fully validated.
        let segwit_active = match self.chain.is_deployment_active(Deployment::Segwit) {
            Ok(active) => active,
            Err(err) => {
                tracing::error!("Unable to query for segwit soft-fork state: {}", err);
                return;
            }
        };

        let best = self.chain.best_snapshot();
        let Some(best_peer) = self.select_sync_peer(best.height, segwit_active).await else {
            tracing::warn!("No sync peer candidates available");
            return;
        };

        // Clear requested blocks when the sync peer changes, otherwise we
        // may ignore blocks the last sync peer failed to send.
        self.requested_blocks.write().await.clear();

        let locator = match self.chain.latest_block_locator() {
            Ok(locator) => locator,
            Err(err) => {
                tracing::error!("Failed to get block locator for the latest block: {}", err);
                return;
            }
        };

        tracing::info!(
            "Syncing to block height {} from peer {}",
            best_peer.last_block(),
            best_peer
        );

        // Below a known checkpoint, headers alone teach us which blocks
        // comprise the chain and need less validation: each header commits
        // to its parent and the checkpoint hash vouches for the whole run.
        // Past the final checkpoint (or with checkpoints disabled, or on
        // regtest which does not support it) fall back to inv-driven block
        // downloads with full validation.
        match self.next_checkpoint {
            Some(checkpoint)
                if best.height < checkpoint.height && !self.chain_params.is_regtest() =>
            {
                let _ = best_peer.push_get_headers_msg(locator, checkpoint.hash);
                self.headers_first_mode = true;
                tracing::info!(
                    "Downloading headers for blocks {} to {} from peer {}",
                    best.height + 1,
                    checkpoint.height,
                    best_peer
                );
            }
            _ => {
                if self.utreexo_csn {
                    let _ = best_peer.push_get_ublocks_msg(locator, ZERO_HASH);
                } else {
                    let _ = best_peer.push_get_blocks_msg(locator, ZERO_HASH);
                }
            }
        }

        self.set_sync_peer(best_peer);
        // Reset progress so a fresh sync peer is not instantly flagged as
        // stalled.
        *self.last_progress_time.lock().await = Instant::now();
    }

    /// Partition candidates by height and pick uniformly from the peers
    /// strictly ahead of `min_height`, falling back to peers exactly at it.
    /// Candidates that have fallen behind are demoted.
    async fn select_sync_peer(
        &mut self,
        min_height: i32,
        segwit_active: bool,
    ) -> Option<Arc<Peer>> {
        let mut higher_peers = Vec::new();
        let mut equal_peers = Vec::new();

        let mut peer_states = self.peer_states.write().await;
        for state in peer_states.values_mut() {
            if !state.sync_candidate {
                continue;
            }

            if segwit_active && !state.peer.is_witness_enabled() {
                tracing::debug!("Peer {} is not witness enabled, skipping", state.peer);
                continue;
            }

            // The < is intentional as opposed to <=: a peer exactly at our
            // height will likely have a later block soon, and keeping it
            // covers the case where both sides sit at 0 on regtest.
            let last_block = state.peer.last_block();
            if last_block < min_height {
                state.sync_candidate = false;
                continue;
            }
            if last_block == min_height {
                equal_peers.push(Arc::clone(&state.peer));
                continue;
            }
            higher_peers.push(Arc::clone(&state.peer));
        }
        drop(peer_states);

        let mut rng = rand::thread_rng();
        higher_peers
            .choose(&mut rng)
            .or_else(|| equal_peers.choose(&mut rng))
            .cloned()
    }

    fn set_sync_peer(&mut self, peer: Arc<Peer>) {
        self.sync_peer_id.store(peer.id(), Ordering::Relaxed);
        self.sync_peer = Some(peer);
    }

    fn unset_sync_peer(&mut self) {
        self.sync_peer_id.store(0, Ordering::Relaxed);
        self.sync_peer = None;
    }

    /// Whether we believe we are synced with our peers.
    fn current(&self) -> bool {
        if !self.chain.is_current() {
            return false;
        }

        // If the chain thinks we are current and we have no sync peer it is
        // probably right.
        let Some(sync_peer) = &self.sync_peer else {
            return true;
        };

        // No matter what the chain thinks, below the block we are syncing to
        // we are not current.
        self.chain.best_snapshot().height >= sync_peer.last_block()
    }

    // ── Stall detection ─────────────────────────────────────────────────

    /// Switch to a new sync peer if the current one has stalled.
    async fn handle_stall_sample(&mut self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        if self.sync_peer.is_none() {
            return;
        }

        if self.last_progress_time.lock().await.elapsed() <= MAX_STALL_DURATION {
            return;
        }

        let sync_peer_id = self.sync_peer.as_ref().map(|p| p.id());
        let state_exists = {
            let peer_states = self.peer_states.read().await;
            sync_peer_id.map_or(false, |id| peer_states.contains_key(&id))
        };
        if !state_exists {
            return;
        }

        self.clear_sync_peer_requests().await;

        let disconnect_sync_peer = self.should_dc_stalled_sync_peer();
        self.update_sync_peer(disconnect_sync_peer).await;
    }

    /// Drop the stalled sync peer's in-flight requests from both the
    /// per-peer and global maps so another peer may serve them.
    async fn clear_sync_peer_requests(&mut self) {
        let Some(sync_peer) = self.sync_peer.clone() else { return };
        let cleared = {
            let mut peer_states = self.peer_states.write().await;
            peer_states.get_mut(&sync_peer.id()).map(|state| {
                (
                    std::mem::take(&mut state.requested_txns),
                    std::mem::take(&mut state.requested_blocks),
                )
            })
        };
        if let Some((txns, blocks)) = cleared {
            for tx_hash in &txns {
                self.requested_txns.remove(tx_hash);
            }
            let mut requested_blocks = self.requested_blocks.write().await;
            for block_hash in &blocks {
                requested_blocks.remove(block_hash);
            }
        }
    }

    /// Disconnect a stalled sync peer only when it claims to have blocks we
    /// still need. At tip, peers that momentarily lag stay connected.
    fn should_dc_stalled_sync_peer(&self) -> bool {
        let Some(sync_peer) = &self.sync_peer else {
            return false;
        };
        let peer_height = sync_peer.last_block().max(sync_peer.starting_height());
        peer_height > self.chain.best_snapshot().height
    }

    /// Replace the current sync peer, optionally disconnecting it, and reset
    /// any headers-first prefetch state for the next peer.
    async fn update_sync_peer(&mut self, dc_sync_peer: bool) {
        let idle = self.last_progress_time.lock().await.elapsed();
        tracing::debug!("Updating sync peer, no progress for: {:?}", idle);

        if dc_sync_peer {
            if let Some(sync_peer) = &self.sync_peer {
                sync_peer.disconnect();
            }
        }

        if self.headers_first_mode {
            let best = self.chain.best_snapshot();
            self.reset_header_state(&best.hash, best.height);
        }

        self.unset_sync_peer();
        self.start_sync().await;
    }

    // ── Headers-first state ─────────────────────────────────────────────

    /// Reset the headers-first state to values appropriate for syncing from
    /// a new peer.
    fn reset_header_state(&mut self, newest_hash: &Hash256, newest_height: i32) {
        if self.utreexo_wn {
            tracing::info!("Not resetting header state on a worker node");
            return;
        }
        self.headers_first_mode = false;
        self.header_list.clear();
        self.start_header = None;

        // With a next checkpoint pending, seed the list with the latest
        // known block so the next downloaded header can prove it links.
        if self.next_checkpoint.is_some() {
            self.header_list.push_back(HeaderNode {
                height: newest_height,
                hash: *newest_hash,
            });
        }

        if self.utreexo_mn {
            let best = self.chain.best_snapshot();
            self.header_list.clear();
            self.header_list.push_back(HeaderNode {
                height: best.height,
                hash: best.hash,
            });
        }
    }

    /// The next checkpoint after the passed height, or None past the final
    /// checkpoint or when checkpoints are disabled.
    fn find_next_header_checkpoint(&self, height: i32) -> Option<Checkpoint> {
        let checkpoints = self.chain.checkpoints();
        let final_checkpoint = checkpoints.last()?;
        if height >= final_checkpoint.height {
            return None;
        }

        let mut next_checkpoint = *final_checkpoint;
        for checkpoint in checkpoints.iter().rev().skip(1) {
            if height >= checkpoint.height {
                break;
            }
            next_checkpoint = *checkpoint;
        }
        Some(next_checkpoint)
    }

    /// Whether the fetch cursor still points at an unrequested header.
    fn start_header_pending(&self) -> bool {
        match (self.start_header, self.header_list.back()) {
            (Some(cursor), Some(back)) => cursor <= back.height,
            _ => false,
        }
    }

    // ── Transaction handling ────────────────────────────────────────────

    async fn handle_tx(&mut self, tx: Arc<Transaction>, peer: Arc<Peer>) {
        {
            let peer_states = self.peer_states.read().await;
            if !peer_states.contains_key(&peer.id()) {
                tracing::warn!("Received tx message from unknown peer {}", peer);
                return;
            }
        }

        // Some wallets send transactions unsolicited instead of announcing
        // an inv first. The reference implementation permits it, so accept
        // unrequested transactions for interoperability.
        let tx_hash = tx.txid();

        // A hash we already rejected stays ignored, and silently: if it was
        // rejected before, this arrival was unsolicited.
        if self.rejected_txns.contains(&tx_hash) {
            tracing::debug!(
                "Ignoring unsolicited previously rejected transaction {} from {}",
                hash_to_hex(&tx_hash),
                peer
            );
            return;
        }

        let result = self
            .tx_pool
            .process_transaction(&tx, true, true, peer.id());

        // Either the pool knows the transaction now, or the insert failed
        // and we will retry on the next inv. Both ways, it is no longer in
        // flight.
        if let Some(state) = self.peer_states.write().await.get_mut(&peer.id()) {
            state.requested_txns.remove(&tx_hash);
        }
        self.requested_txns.remove(&tx_hash);

        match result {
            Ok(accepted_txs) => {
                self.peer_notifier.announce_new_transactions(&accepted_txs);
            }
            Err(err) => {
                // Do not request this transaction again until a new block
                // has been processed.
                limit_add(&mut self.rejected_txns, tx_hash, MAX_REJECTED_TXNS);

                if err.is_rule_error() {
                    tracing::debug!(
                        "Rejected transaction {} from {}: {}",
                        hash_to_hex(&tx_hash),
                        peer,
                        err
                    );
                } else {
                    tracing::error!(
                        "Failed to process transaction {}: {}",
                        hash_to_hex(&tx_hash),
                        err
                    );
                }

                let (code, reason) = err.to_reject_err();
                let _ = peer.push_reject_msg("tx", code, reason, tx_hash);
            }
        }
    }

    // ── Block / ublock handling ─────────────────────────────────────────

    /// Handle a block or ublock from a peer. The two flavors share the same
    /// procedure; only chain submission and follow-up request types differ.
    async fn handle_block(&mut self, block: AnyBlock, peer: Arc<Peer>) {
        let block_hash = block.hash();
        let kind = if block.is_utreexo() { "ublock" } else { "block" };

        let requested = {
            let peer_states = self.peer_states.read().await;
            let Some(state) = peer_states.get(&peer.id()) else {
                tracing::warn!("Received {} message from unknown peer {}", kind, peer);
                return;
            };
            state.requested_blocks.contains(&block_hash)
        };

        // If we did not ask for this block the peer is misbehaving, except
        // on regtest where duplicate blocks are intentionally replayed to
        // exercise the chain's duplicate handling.
        if !requested && !self.chain_params.is_regtest() {
            tracing::warn!(
                "Got unrequested {} {} from {} -- disconnecting",
                kind,
                hash_to_hex(&block_hash),
                peer
            );
            peer.disconnect();
            return;
        }

        // A compact-state node has no UTXO set to validate a bare block
        // against; only ublocks carry the needed proof.
        if self.utreexo_csn && !block.is_utreexo() {
            tracing::warn!(
                "Got a block without accumulator proof {} from {} -- ignoring",
                hash_to_hex(&block_hash),
                peer
            );
            return;
        }

        // In headers-first mode a block matching the front of the header
        // list is eligible for less validation: the headers already proved
        // it links up to the next checkpoint. The checkpoint entry itself
        // stays on the list so the next round of headers can link to it.
        let mut is_checkpoint_block = false;
        let mut behavior_flags = BehaviorFlags::NONE;
        if self.headers_first_mode {
            let front = self.header_list.front().copied();
            if let Some(front) = front {
                if front.hash == block_hash {
                    behavior_flags = BehaviorFlags::FAST_ADD;
                    if self.next_checkpoint.map_or(false, |cp| cp.hash == front.hash) {
                        is_checkpoint_block = true;
                    } else {
                        self.header_list.pop_front();
                    }
                }
            }
        }

        // Remove the block from the request maps. Either the chain knows
        // about it now, or the insert fails and the next inv retries it.
        if let Some(state) = self.peer_states.write().await.get_mut(&peer.id()) {
            state.requested_blocks.remove(&block_hash);
        }
        self.requested_blocks.write().await.remove(&block_hash);

        let result = match &block {
            AnyBlock::Plain(plain) => self.chain.process_block(plain, behavior_flags),
            AnyBlock::Utreexo(ublock) => self.chain.process_ublock(ublock, behavior_flags),
        };

        let is_orphan = match result {
            Ok(is_orphan) => is_orphan,
            Err(err) => {
                if err.is_rule_error() {
                    tracing::info!(
                        "Rejected {} {} from {}: {}",
                        kind,
                        hash_to_hex(&block_hash),
                        peer,
                        err
                    );
                } else {
                    tracing::error!(
                        "Failed to process {} {}: {}",
                        kind,
                        hash_to_hex(&block_hash),
                        err
                    );
                }
                if err.is_corruption() {
                    panic!("{}", err);
                }

                let (code, reason) = err.to_reject_err();
                let _ = peer.push_reject_msg(kind, code, reason, block_hash);
                return;
            }
        };

        // Meta-data about the block the peer is reporting, used to keep its
        // height current for future sync candidacy and to fan the update out
        // to other peers whose announcements we may have ignored.
        let mut height_update: Option<(Hash256, i32)> = None;

        if is_orphan {
            // Try to learn the peer's height from the orphan's coinbase,
            // which commits the height for block version 2 and later.
            let header = block.header();
            if should_have_serialized_block_height(header) {
                if let Some(coinbase) = block.transactions().first() {
                    match extract_coinbase_height(coinbase) {
                        Ok(cb_height) => {
                            tracing::debug!(
                                "Extracted height of {} from orphan block",
                                cb_height
                            );
                            height_update = Some((block_hash, cb_height));
                        }
                        Err(err) => {
                            tracing::warn!(
                                "Unable to extract height from coinbase tx: {}",
                                err
                            );
                        }
                    }
                }
            }

            // Request the missing ancestors back to the orphan root.
            let orphan_root = self
                .chain
                .get_orphan_root(&block_hash, block.is_utreexo());
            match self.chain.latest_block_locator() {
                Ok(locator) => {
                    let result = if block.is_utreexo() {
                        peer.push_get_ublocks_msg(locator, orphan_root)
                    } else {
                        peer.push_get_blocks_msg(locator, orphan_root)
                    };
                    if let Err(err) = result {
                        tracing::warn!("Failed to request orphan parents: {}", err);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "Failed to get block locator for the latest block: {}",
                        err
                    );
                }
            }
        } else {
            if self.sync_peer.as_ref().map(|p| p.id()) == Some(peer.id()) {
                *self.last_progress_time.lock().await = Instant::now();
            }

            let best = self.chain.best_snapshot();
            self.progress
                .log_block_height(&block_hash, best.height, block.transactions().len())
                .await;
            height_update = Some((best.hash, best.height));

            // A fresh block invalidates prior rejections.
            self.rejected_txns.clear();
        }

        // Update the peer's height, and tell the server to fan it out only
        // for orphans or once current, to avoid a spam of updates during the
        // initial download.
        if let Some((hash, height)) = height_update {
            if height != 0 {
                peer.update_last_block_height(height);
                if is_orphan || self.current() {
                    self.peer_notifier.update_peer_heights(&hash, height, peer.id());
                }
            }
        }

        if !self.headers_first_mode {
            // A quiet moment between blocks is a good time for the periodic
            // cache flush on compact-state nodes.
            if block.is_utreexo() && self.utreexo_csn {
                if let Err(err) = self.chain.flush_cached_state(FlushMode::Periodic) {
                    tracing::error!("Error while flushing the blockchain cache: {}", err);
                }
            }
            return;
        }

        // Headers-first: keep the request pipeline full until the
        // checkpoint block lands.
        if !is_checkpoint_block {
            let in_flight = {
                let peer_states = self.peer_states.read().await;
                peer_states
                    .get(&peer.id())
                    .map_or(0, |state| state.requested_blocks.len())
            };
            if self.start_header_pending() && in_flight < MIN_IN_FLIGHT_BLOCKS {
                self.fetch_header_blocks().await;
            }
            return;
        }

        // The checkpoint block landed. With another checkpoint ahead, fetch
        // the next round of headers from here to it.
        let Some(reached) = self.next_checkpoint else { return };
        self.next_checkpoint = self.find_next_header_checkpoint(reached.height);
        if let Some(next_checkpoint) = self.next_checkpoint {
            let locator = vec![reached.hash];
            if let Err(err) = peer.push_get_headers_msg(locator, next_checkpoint.hash) {
                tracing::warn!("Failed to send getheaders message to peer {}: {}", peer, err);
                return;
            }
            tracing::info!(
                "Downloading headers for blocks {} to {} from peer {}",
                reached.height + 1,
                next_checkpoint.height,
                peer
            );
            return;
        }

        // That was the final checkpoint: switch to normal mode and request
        // blocks from here to the end of the chain.
        self.headers_first_mode = false;
        self.header_list.clear();
        self.start_header = None;
        tracing::info!("Reached the final checkpoint -- switching to normal mode");
        let locator = vec![block_hash];
        let result = if block.is_utreexo() {
            peer.push_get_ublocks_msg(locator, ZERO_HASH)
        } else {
            peer.push_get_blocks_msg(locator, ZERO_HASH)
        };
        if let Err(err) = result {
            tracing::warn!("Failed to send getblocks message to peer {}: {}", peer, err);
        }
    }

    // ── Request dispatch ────────────────────────────────────────────────

    /// Request the next batch of blocks described by the header list from
    /// the sync peer.
    async fn fetch_header_blocks(&mut self) {
        let Some(cursor_start) = self.start_header else {
            tracing::warn!("fetch_header_blocks called with no start header");
            return;
        };
        let Some(sync_peer) = self.sync_peer.clone() else {
            tracing::warn!("fetch_header_blocks called with no sync peer");
            return;
        };

        let base_type = if self.utreexo_csn { InvType::UBlock } else { InvType::Block };
        let mut cursor = cursor_start;
        let mut inv_list = Vec::new();
        for node in self.header_list.iter() {
            if node.height < cursor_start {
                continue;
            }

            let mut iv = InvVect::new(base_type, node.hash);
            let have_inv = match self.have_inventory(&iv) {
                Ok(have) => have,
                Err(err) => {
                    tracing::warn!(
                        "Unexpected failure when checking for existing inventory during header block fetch: {}",
                        err
                    );
                    false
                }
            };
            if !have_inv {
                self.requested_blocks.write().await.insert(node.hash);
                if let Some(state) = self.peer_states.write().await.get_mut(&sync_peer.id()) {
                    state.requested_blocks.insert(node.hash);
                }

                // Witness-enabled peers must serve the full witness data.
                if sync_peer.is_witness_enabled() {
                    iv.inv_type = iv.inv_type.to_witness();
                }
                inv_list.push(iv);
            }

            cursor = node.height + 1;
            if inv_list.len() >= MAX_INV_PER_MSG {
                break;
            }
        }
        self.start_header = Some(cursor);

        if !inv_list.is_empty() {
            sync_peer.queue_message(Message::GetData(inv_list));
        }
    }

    /// Request the ublocks covering the root-hint range currently being
    /// verified on a main node, walking the header list cursor.
    async fn fetch_header_verify_ublocks(&mut self) {
        let Some(cursor_start) = self.start_header else {
            tracing::warn!("fetch_header_verify_ublocks called with no start header");
            return;
        };
        let Some(sync_peer) = self.sync_peer.clone() else {
            tracing::warn!("fetch_header_verify_ublocks called with no sync peer");
            return;
        };
        let Some(root_to_verify) = self.utreexo_root_to_verify.clone() else {
            tracing::warn!("fetch_header_verify_ublocks called with no root to verify");
            return;
        };

        let prev_root = self
            .chain
            .find_previous_utreexo_root_hint(root_to_verify.height);

        let mut cursor = cursor_start;
        let mut inv_list = Vec::new();
        for node in self.header_list.iter() {
            if node.height < cursor_start {
                continue;
            }

            // Only the blocks inside (previous root, root to verify] belong
            // to this range. The previous root is None for the very first
            // range, which starts from genesis.
            if let Some(prev_root) = &prev_root {
                if node.height <= prev_root.height {
                    cursor = node.height + 1;
                    continue;
                }
            }
            if node.height > root_to_verify.height {
                break;
            }

            let mut iv = InvVect::new(InvType::UBlock, node.hash);
            self.requested_blocks.write().await.insert(node.hash);
            if let Some(state) = self.peer_states.write().await.get_mut(&sync_peer.id()) {
                state.requested_blocks.insert(node.hash);
            }

            if sync_peer.is_witness_enabled() {
                iv.inv_type = if self.utreexo_csn {
                    InvType::WitnessUBlock
                } else {
                    InvType::WitnessBlock
                };
            }
            inv_list.push(iv);

            cursor = node.height + 1;
            if inv_list.len() >= MAX_INV_PER_MSG {
                break;
            }
        }
        self.start_header = Some(cursor);

        if !inv_list.is_empty() {
            sync_peer.queue_message(Message::GetData(inv_list));
        }
    }

    /// Request every ublock in (start, end] for parallel range verification.
    /// All blocks in the range are refetched for accumulator replay, so the
    /// chain's known-inventory is deliberately not consulted.
    async fn fetch_parallel_verify_ublocks(&mut self, start: i32, end: i32) {
        let Some(sync_peer) = self.sync_peer.clone() else {
            tracing::warn!("fetch_parallel_verify_ublocks called with no sync peer");
            return;
        };

        let mut inv_list = Vec::new();
        for node in self.header_list.iter() {
            if node.height <= start {
                continue;
            }
            if node.height > end {
                break;
            }

            let mut iv = InvVect::new(InvType::UBlock, node.hash);
            self.requested_blocks.write().await.insert(node.hash);
            if let Some(state) = self.peer_states.write().await.get_mut(&sync_peer.id()) {
                state.requested_blocks.insert(node.hash);
            }

            if sync_peer.is_witness_enabled() {
                iv.inv_type = if self.utreexo_csn {
                    InvType::WitnessUBlock
                } else {
                    InvType::WitnessBlock
                };
            }
            inv_list.push(iv);

            if inv_list.len() >= MAX_INV_PER_MSG {
                break;
            }
        }

        if !inv_list.is_empty() {
            sync_peer.queue_message(Message::GetData(inv_list));
        }
    }

    // ── Header handling ─────────────────────────────────────────────────

    /// Handle a headers message during a headers-first sync.
    async fn handle_headers(&mut self, headers: Vec<BlockHeader>, peer: Arc<Peer>) {
        {
            let peer_states = self.peer_states.read().await;
            if !peer_states.contains_key(&peer.id()) {
                tracing::warn!("Received headers message from unknown peer {}", peer);
                return;
            }
        }

        // The remote peer is misbehaving if we did not request headers.
        if !self.headers_first_mode {
            tracing::warn!(
                "Got {} unrequested headers from {} -- disconnecting",
                headers.len(),
                peer
            );
            peer.disconnect();
            return;
        }

        if headers.is_empty() {
            return;
        }

        let Some(next_checkpoint) = self.next_checkpoint else {
            tracing::warn!("Received headers with no next checkpoint to verify against");
            return;
        };

        // Each header must connect to the previous one; the header at the
        // checkpoint height must match the checkpoint hash.
        let mut received_checkpoint = false;
        let mut final_hash = ZERO_HASH;
        for header in &headers {
            let block_hash = header.block_hash();
            final_hash = block_hash;

            let Some(prev_node) = self.header_list.back().copied() else {
                tracing::warn!(
                    "Header list does not contain a previous element as expected -- disconnecting peer"
                );
                peer.disconnect();
                return;
            };

            if prev_node.hash != header.prev_block {
                tracing::warn!(
                    "Received block header that does not properly connect to the chain from peer {} -- disconnecting",
                    peer
                );
                peer.disconnect();
                return;
            }

            let node = HeaderNode {
                height: prev_node.height + 1,
                hash: block_hash,
            };
            self.header_list.push_back(node);
            if self.start_header.is_none() {
                self.start_header = Some(node.height);
            }

            if node.height == next_checkpoint.height {
                if node.hash == next_checkpoint.hash {
                    received_checkpoint = true;
                    tracing::info!(
                        "Verified downloaded block header against checkpoint at height {}/hash {}",
                        node.height,
                        hash_to_hex(&node.hash)
                    );
                } else {
                    tracing::warn!(
                        "Block header at height {}/hash {} from peer {} does NOT match expected checkpoint hash of {} -- disconnecting",
                        node.height,
                        hash_to_hex(&node.hash),
                        peer,
                        hash_to_hex(&next_checkpoint.hash)
                    );
                    peer.disconnect();
                    return;
                }
                break;
            }
        }

        // At a checkpoint, switch to fetching the blocks for all the headers
        // since the last one. The front entry only anchored the link check
        // and is already in the database, so drop it first.
        if received_checkpoint {
            self.header_list.pop_front();
            tracing::info!(
                "Received {} block headers: Fetching blocks",
                self.header_list.len()
            );
            self.progress.set_last_log_time(Instant::now()).await;
            self.fetch_header_blocks().await;
            return;
        }

        // Not at the checkpoint yet: request the next batch of headers,
        // starting from the latest one and ending at the checkpoint.
        let locator = vec![final_hash];
        if let Err(err) = peer.push_get_headers_msg(locator, next_checkpoint.hash) {
            tracing::warn!("Failed to send getheaders message to peer {}: {}", peer, err);
        }
    }

    /// Handle a headers message in the headers-only loop. Returns true once
    /// the header chain has reached the root hint being verified.
    async fn handle_only_headers(&mut self, headers: Vec<BlockHeader>, peer: Arc<Peer>) -> bool {
        {
            let peer_states = self.peer_states.read().await;
            if !peer_states.contains_key(&peer.id()) {
                tracing::warn!("Received headers message from unknown peer {}", peer);
                return false;
            }
        }

        let Some(root_to_verify) = self.utreexo_root_to_verify.clone() else {
            tracing::warn!("Received headers with no root hint to download towards");
            return false;
        };

        if let Err(err) =
            self.chain
                .process_headers(&headers, self.utreexo_start_root.as_ref(), BehaviorFlags::NONE)
        {
            tracing::warn!("Got invalid headers from {} -- disconnecting: {}", peer, err);
            peer.disconnect();
            return false;
        }

        let mut received_all_headers = false;
        let mut final_hash = ZERO_HASH;
        for header in &headers {
            let block_hash = header.block_hash();
            final_hash = block_hash;

            let Some(prev_node) = self.header_list.back().copied() else {
                tracing::warn!(
                    "Header list does not contain a previous element as expected -- disconnecting peer"
                );
                peer.disconnect();
                return false;
            };

            if prev_node.hash != header.prev_block {
                tracing::warn!(
                    "Received block header that does not properly connect to the chain from peer {} -- disconnecting",
                    peer
                );
                peer.disconnect();
                return false;
            }

            let node = HeaderNode {
                height: prev_node.height + 1,
                hash: block_hash,
            };
            self.header_list.push_back(node);
            if self.start_header.is_none() {
                self.start_header = Some(node.height);
            }

            if node.height == root_to_verify.height {
                received_all_headers = true;
                tracing::info!(
                    "Downloaded all headers to root being verified at height {}/hash {}",
                    node.height,
                    hash_to_hex(&node.hash)
                );
            }
        }

        if received_all_headers {
            return true;
        }

        let locator = vec![final_hash];
        if let Err(err) = peer.push_get_headers_msg(locator, ZERO_HASH) {
            tracing::warn!("Failed to send getheaders message to peer {}: {}", peer, err);
        }
        false
    }

    // ── Notfound handling ───────────────────────────────────────────────

    async fn handle_not_found(&mut self, not_found: Vec<InvVect>, peer: Arc<Peer>) {
        {
            let peer_states = self.peer_states.read().await;
            if !peer_states.contains_key(&peer.id()) {
                tracing::warn!("Received notfound message from unknown peer {}", peer);
                return;
            }
        }

        for inv in not_found {
            // Only drop hashes this peer actually had in flight.
            if inv.inv_type.is_block() || inv.inv_type.is_ublock() {
                let held = {
                    let mut peer_states = self.peer_states.write().await;
                    peer_states
                        .get_mut(&peer.id())
                        .map_or(false, |state| state.requested_blocks.remove(&inv.hash))
                };
                if held {
                    self.requested_blocks.write().await.remove(&inv.hash);
                }
            } else if inv.inv_type.is_tx() {
                let held = {
                    let mut peer_states = self.peer_states.write().await;
                    peer_states
                        .get_mut(&peer.id())
                        .map_or(false, |state| state.requested_txns.remove(&inv.hash))
                };
                if held {
                    self.requested_txns.remove(&inv.hash);
                }
            }
        }
    }

    /// Whether the inventory is already known, in any of the places it can
    /// be: the chain (main, side, or orphan), the mempool, or the UTXO set.
    fn have_inventory(&self, inv: &InvVect) -> Result<bool, ChainError> {
        if inv.inv_type.is_block() {
            return self.chain.have_block(&inv.hash);
        }
        if inv.inv_type.is_ublock() {
            return self.chain.have_ublock(&inv.hash);
        }
        if inv.inv_type.is_tx() {
            if self.tx_pool.have_transaction(&inv.hash) {
                return Ok(true);
            }

            // Best-effort check against the end of the main chain. Only the
            // first two outputs are checked: the vast majority of
            // transactions pay somebody and return change.
            for index in 0..2 {
                let out = crate::wire::OutPoint { hash: inv.hash, index };
                if let Some(entry) = self.chain.fetch_utxo_entry(&out)? {
                    if !entry.is_spent() {
                        return Ok(true);
                    }
                }
            }
            return Ok(false);
        }

        // Claim unsupported inventory is known to avoid requesting it.
        Ok(true)
    }

    // ── Inventory handling ──────────────────────────────────────────────

    /// Examine the inventory advertised by a peer and act accordingly.
    async fn handle_inv(&mut self, inv_vects: Vec<InvVect>, peer: Arc<Peer>) {
        {
            let peer_states = self.peer_states.read().await;
            if !peer_states.contains_key(&peer.id()) {
                tracing::warn!("Received inv message from unknown peer {}", peer);
                return;
            }
        }

        // Find the last block-type announcement, if any.
        let last_block = inv_vects
            .iter()
            .rposition(|iv| matches!(iv.inv_type, InvType::Block | InvType::UBlock));

        let is_sync_peer = self.sync_peer.as_ref().map(|p| p.id()) == Some(peer.id());

        // Remember the peer's newest announced block so accepted blocks can
        // later update the heights of peers whose invs we ignored.
        if let Some(last) = last_block {
            if !is_sync_peer || self.current() {
                peer.update_last_announced_block(&inv_vects[last].hash);
            }
        }

        // Ignore invs from non-sync peers while behind; it curbs fetching a
        // mass of orphans.
        if !is_sync_peer && !self.current() {
            return;
        }

        // A current chain plus an announcement of a block we already know
        // pins the peer's height exactly.
        if let Some(last) = last_block {
            if self.current() {
                if let Ok(height) = self.chain.block_height_by_hash(&inv_vects[last].hash) {
                    peer.update_last_block_height(height);
                }
            }
        }

        // Classify each vector: queue unknown inventory for request, chase
        // orphan ancestry for known orphans, and force progress when the
        // peer re-announces the final block of a long side chain.
        let mut new_requests = Vec::new();
        'inv_scan: for (i, iv) in inv_vects.iter().enumerate() {
            peer.add_known_inventory(*iv);

            // Inventory is meaningless noise while headers drive the sync.
            if self.headers_first_mode {
                continue;
            }

            let have_inv = match self.have_inventory(iv) {
                Ok(have) => have,
                Err(err) => {
                    tracing::warn!(
                        "Unexpected failure when checking for existing inventory during inv message processing: {}",
                        err
                    );
                    continue;
                }
            };

            if !have_inv {
                if iv.inv_type == InvType::Tx && self.rejected_txns.contains(&iv.hash) {
                    continue;
                }

                // Post-segwit we only download blocks from peers that can
                // provide the witness data.
                if !peer.is_witness_enabled() && iv.inv_type == InvType::Block {
                    continue;
                }

                new_requests.push(*iv);
                continue;
            }

            if iv.inv_type == InvType::Block {
                if self.utreexo_csn {
                    // A known orphan being re-announced means more parents
                    // are missing than fit one inventory message; walk back
                    // to the orphan root.
                    if self.chain.is_known_orphan(&iv.hash, true) {
                        let orphan_root = self.chain.get_orphan_root(&iv.hash, true);
                        match self.chain.latest_block_locator() {
                            Ok(locator) => {
                                let _ = peer.push_get_ublocks_msg(locator, orphan_root);
                            }
                            Err(err) => {
                                tracing::error!(
                                    "Failed to get block locator for the latest block: {}",
                                    err
                                );
                            }
                        }
                        continue;
                    }

                    // Already having the final advertised block means we sit
                    // on a long side chain; ask for what follows it.
                    if Some(i) == last_block {
                        let locator = self.chain.block_locator_from_hash(&iv.hash);
                        let _ = peer.push_get_ublocks_msg(locator, ZERO_HASH);
                    }
                    break 'inv_scan;
                }

                if self.chain.is_known_orphan(&iv.hash, false) {
                    let orphan_root = self.chain.get_orphan_root(&iv.hash, false);
                    match self.chain.latest_block_locator() {
                        Ok(locator) => {
                            let _ = peer.push_get_blocks_msg(locator, orphan_root);
                        }
                        Err(err) => {
                            tracing::error!(
                                "Failed to get block locator for the latest block: {}",
                                err
                            );
                        }
                    }
                    continue;
                }

                if Some(i) == last_block {
                    let locator = self.chain.block_locator_from_hash(&iv.hash);
                    let _ = peer.push_get_blocks_msg(locator, ZERO_HASH);
                }
            }

            if iv.inv_type == InvType::UBlock {
                if self.chain.is_known_orphan(&iv.hash, true) {
                    let orphan_root = self.chain.get_orphan_root(&iv.hash, true);
                    match self.chain.latest_block_locator() {
                        Ok(locator) => {
                            let _ = peer.push_get_ublocks_msg(locator, orphan_root);
                        }
                        Err(err) => {
                            tracing::error!(
                                "Failed to get block locator for the latest block: {}",
                                err
                            );
                        }
                    }
                    continue;
                }

                if Some(i) == last_block {
                    let locator = self.chain.block_locator_from_hash(&iv.hash);
                    let _ = peer.push_get_ublocks_msg(locator, ZERO_HASH);
                }
            }
        }

        // Drain the request queue into one getdata, deduplicating against
        // the global in-flight maps. Whatever does not fit waits for the
        // next inv.
        let mut getdata = Vec::new();
        {
            let mut peer_states = self.peer_states.write().await;
            let Some(state) = peer_states.get_mut(&peer.id()) else { return };
            state.request_queue.extend(new_requests);

            let mut queue: VecDeque<InvVect> = state.request_queue.drain(..).collect();
            while let Some(mut iv) = queue.pop_front() {
                if iv.inv_type.is_block() {
                    let mut requested_blocks = self.requested_blocks.write().await;
                    if !requested_blocks.contains(&iv.hash) {
                        limit_add(&mut requested_blocks, iv.hash, MAX_REQUESTED_BLOCKS);
                        limit_add(&mut state.requested_blocks, iv.hash, MAX_REQUESTED_BLOCKS);

                        if peer.is_witness_enabled() {
                            iv.inv_type = iv.inv_type.to_witness();
                        }
                        getdata.push(iv);
                    }
                } else if iv.inv_type.is_ublock() {
                    let mut requested_blocks = self.requested_blocks.write().await;
                    if !requested_blocks.contains(&iv.hash) {
                        limit_add(&mut requested_blocks, iv.hash, MAX_REQUESTED_BLOCKS);
                        limit_add(&mut state.requested_blocks, iv.hash, MAX_REQUESTED_BLOCKS);

                        if peer.is_witness_enabled() {
                            iv.inv_type = iv.inv_type.to_witness();
                        }
                        getdata.push(iv);
                    }
                } else if iv.inv_type.is_tx() {
                    if !self.requested_txns.contains(&iv.hash) {
                        limit_add(&mut self.requested_txns, iv.hash, MAX_REQUESTED_TXNS);
                        limit_add(&mut state.requested_txns, iv.hash, MAX_REQUESTED_TXNS);

                        if peer.is_witness_enabled() {
                            iv.inv_type = iv.inv_type.to_witness();
                        }
                        getdata.push(iv);
                    }
                }

                if getdata.len() >= MAX_INV_PER_MSG {
                    break;
                }
            }
            state.request_queue = queue.into_iter().collect();
        }

        if !getdata.is_empty() {
            peer.queue_message(Message::GetData(getdata));
        }
    }

    // ── Root-hint verification ──────────────────────────────────────────

    /// Accept a root hint for verification: seed a fresh accumulator view
    /// from the previous hint and kick off the range download.
    async fn handle_verify_root_hint(&mut self, root_hint: UtreexoRootHint) {
        let hints = self.chain.utreexo_root_hints();
        let start_root = find_previous_root_hint(root_hint.height, &hints);

        let start_view = match UtreexoViewpoint::from_root_hint(start_root.as_ref()) {
            Ok(view) => view,
            // The verifier cannot proceed without a seed view; the caller
            // restarts the range.
            Err(err) => panic!("failed to build the accumulator view: {}", err),
        };

        let start_height = start_root.as_ref().map_or(0, |root| root.height);
        self.u_tree_map.write().await.insert(
            start_height,
            Arc::new(UTreeState {
                view: Mutex::new(start_view),
                start_root,
                root_to_verify: root_hint.clone(),
            }),
        );

        self.validate_parallel_utreexo_root(start_height, root_hint.height)
            .await;
    }

    /// Select a sync peer serving at least `end_height` and start fetching
    /// the (start, end] ublock range for parallel verification.
    async fn validate_parallel_utreexo_root(&mut self, start_height: i32, end_height: i32) {
        // Root verification predates any deployment checks we could make
        // without a UTXO set; require witness-enabled peers outright.
        let Some(best_peer) = self.select_sync_peer(end_height, true).await else {
            tracing::warn!("No sync peer candidates available");
            return;
        };

        self.utreexo_root_verify_mode = true;
        self.headers_first_mode = true;

        if !self.chain_params.is_regtest() {
            self.progress.set_last_log_time(Instant::now()).await;
            self.set_sync_peer(Arc::clone(&best_peer));
            self.fetch_parallel_verify_ublocks(start_height, end_height)
                .await;
        }

        self.set_sync_peer(best_peer);
        *self.last_progress_time.lock().await = Instant::now();
    }

    /// Main-node root verification: fetch the range via the header cursor,
    /// downloading headers up to the root first when needed.
    async fn validate_utreexo_root(&mut self) {
        let Some(root_to_verify) = self.utreexo_root_to_verify.clone() else {
            tracing::warn!("No root hint to verify");
            return;
        };

        let Some(best_peer) = self
            .select_sync_peer(root_to_verify.height, true)
            .await
        else {
            tracing::warn!("No sync peer candidates available");
            return;
        };

        self.utreexo_root_verify_mode = true;
        self.headers_first_mode = true;

        let locator = match self.chain.latest_block_locator() {
            Ok(locator) => locator,
            Err(err) => {
                tracing::error!("Failed to get block locator for the latest block: {}", err);
                return;
            }
        };

        if !self.chain_params.is_regtest() {
            let have_headers = self
                .header_list
                .back()
                .map_or(false, |node| node.height >= root_to_verify.height);
            if have_headers {
                self.progress.set_last_log_time(Instant::now()).await;
                self.set_sync_peer(Arc::clone(&best_peer));
                self.fetch_header_verify_ublocks().await;
            } else {
                if let Err(err) = best_peer.push_get_headers_msg(locator, ZERO_HASH) {
                    tracing::warn!(
                        "Failed to send getheaders message to peer {}: {}",
                        best_peer,
                        err
                    );
                }
                let best = self.chain.best_snapshot();
                tracing::info!(
                    "Downloading headers for blocks {} to {} from peer {}",
                    best.height + 1,
                    root_to_verify.height,
                    best_peer
                );
            }
        }

        self.set_sync_peer(best_peer);
        *self.last_progress_time.lock().await = Instant::now();
    }

    fn verify_worker(&self) -> VerifyWorker {
        VerifyWorker {
            chain: Arc::clone(&self.chain),
            chain_params: Arc::clone(&self.chain_params),
            peer_notifier: Arc::clone(&self.peer_notifier),
            progress: self.progress.clone(),
            peer_states: Arc::clone(&self.peer_states),
            requested_blocks: Arc::clone(&self.requested_blocks),
            u_tree_map: Arc::clone(&self.u_tree_map),
            msg_tx: self.msg_tx.clone(),
            sync_peer_id: Arc::clone(&self.sync_peer_id),
            last_progress_time: Arc::clone(&self.last_progress_time),
        }
    }

    // ── Chain notifications ─────────────────────────────────────────────

    fn handle_chain_notification(&mut self, notification: Notification) {
        match notification {
            // Relay newly accepted blocks, but only once current: peers that
            // are current already know about it.
            Notification::BlockAccepted(block) => {
                if !self.current() {
                    return;
                }
                let iv = InvVect::new(InvType::Block, block.block_hash());
                self.peer_notifier.relay_inventory(iv, &block.header);
            }

            Notification::BlockConnected(block) => {
                // Compact-state nodes run without a mempool.
                if self.utreexo_csn {
                    return;
                }

                // Drop the connected block's transactions from the pool,
                // along with anything they double spend, and drain orphans
                // that became valid. Descendants of a confirmed transaction
                // stay: they are still valid.
                for tx in block.transactions().iter().skip(1) {
                    self.tx_pool.remove_transaction(tx, false);
                    self.tx_pool.remove_double_spends(tx);
                    self.tx_pool.remove_orphan(tx);
                    self.peer_notifier.transaction_confirmed(tx);
                    let accepted = self.tx_pool.process_orphans(tx);
                    self.peer_notifier.announce_new_transactions(&accepted);
                }

                if let (Some(fee_estimator), AnyBlock::Plain(plain)) =
                    (&self.fee_estimator, &block)
                {
                    // A failed registration leaves the estimator in a state
                    // it cannot recover from; start it over.
                    if let Err(err) = fee_estimator.register_block(plain) {
                        tracing::warn!("Failed to register block with fee estimator: {}", err);
                        fee_estimator.reset();
                    }
                }
            }

            Notification::BlockDisconnected(block) => {
                // Reinsert the disconnected block's transactions, dropping
                // any (and their dependents) the pool no longer accepts.
                for tx in block.transactions.iter().skip(1) {
                    if self.tx_pool.maybe_accept_transaction(tx, false, false).is_err() {
                        self.tx_pool.remove_transaction(tx, true);
                    }
                }

                if let Some(fee_estimator) = &self.fee_estimator {
                    fee_estimator.rollback(&block.block_hash());
                }
            }
        }
    }
}

/// Shared context for one parallel ublock verification task.
struct VerifyWorker {
    chain: Arc<dyn Chain>,
    chain_params: Arc<ChainParams>,
    peer_notifier: Arc<dyn PeerNotifier>,
    progress: BlockProgressLogger,
    peer_states: Arc<RwLock<HashMap<PeerId, PeerSyncState>>>,
    requested_blocks: Arc<RwLock<HashSet<Hash256>>>,
    u_tree_map: Arc<RwLock<HashMap<i32, Arc<UTreeState>>>>,
    msg_tx: mpsc::UnboundedSender<SyncMessage>,
    sync_peer_id: Arc<AtomicI32>,
    last_progress_time: Arc<Mutex<Instant>>,
}

impl VerifyWorker {
    async fn handle_ublock(
        self,
        ublock: Arc<UBlock>,
        peer: Arc<Peer>,
        done: Option<oneshot::Sender<()>>,
    ) {
        self.process_ublock(ublock, peer).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn process_ublock(&self, ublock: Arc<UBlock>, peer: Arc<Peer>) {
        let block_hash = ublock.block_hash();

        let requested = {
            let peer_states = self.peer_states.read().await;
            let Some(state) = peer_states.get(&peer.id()) else {
                tracing::warn!("Received ublock message from unknown peer {}", peer);
                return;
            };
            state.requested_blocks.contains(&block_hash)
        };
        // Unlike the normal sync path, an unrequested ublock here is only
        // logged: every block in the range must still be replayed into the
        // accumulator, so processing continues.
        if !requested && !self.chain_params.is_regtest() {
            tracing::warn!(
                "Got unrequested ublock {} from {}",
                hash_to_hex(&block_hash),
                peer
            );
        }

        if let Some(state) = self.peer_states.write().await.get_mut(&peer.id()) {
            state.requested_blocks.remove(&block_hash);
        }
        self.requested_blocks.write().await.remove(&block_hash);

        // The header chain was verified up front, so failures below mean
        // the range verification itself is broken. Panic and let the caller
        // restart the range.
        let block_height = match self.chain.lookup_node(&block_hash) {
            Ok(height) => height,
            Err(err) => panic!(
                "failed to look up ublock {}: {}",
                hash_to_hex(&block_hash),
                err
            ),
        };

        let search_height = self
            .chain
            .find_previous_utreexo_root_hint(block_height)
            .map_or(0, |root| root.height);

        let u_state = self.u_tree_map.read().await.get(&search_height).cloned();
        let Some(u_state) = u_state else {
            panic!(
                "no in-progress root verification covers block height {}",
                block_height
            );
        };

        // Apply the block to the range's accumulator view; on the range's
        // final block, compare roots before releasing the view.
        let finished = {
            let mut view = u_state.view.lock().await;
            let main_chain = match self.chain.process_header_ublock(
                &ublock,
                &mut view,
                BehaviorFlags::NONE,
            ) {
                Ok(main_chain) => main_chain,
                Err(err) => panic!(
                    "failed to process ublock {}: {}",
                    hash_to_hex(&block_hash),
                    err
                ),
            };
            if !main_chain {
                panic!(
                    "block {} is not part of the main chain",
                    hash_to_hex(&block_hash)
                );
            }

            if ublock.height == u_state.root_to_verify.height {
                Some(view.equal(&u_state.root_to_verify.roots))
            } else {
                None
            }
        };

        if let Some(validated) = finished {
            self.u_tree_map.write().await.remove(&search_height);
            if validated {
                tracing::trace!("Utreexo root verified at height {}", ublock.height);
            } else {
                tracing::warn!("Utreexo root invalid at height {}", ublock.height);
            }
            let _ = self.msg_tx.send(SyncMessage::ProcessedRootHint(ProcessedRootHint {
                validated,
                height: ublock.height,
            }));
            return;
        }

        if peer.id() == self.sync_peer_id.load(Ordering::Relaxed) {
            *self.last_progress_time.lock().await = Instant::now();
        }

        self.progress
            .log_block_height(&block_hash, ublock.height, ublock.block.transactions.len())
            .await;

        let best = self.chain.best_snapshot();
        peer.update_last_block_height(best.height);
        if best.height != 0 && self.current().await {
            self.peer_notifier
                .update_peer_heights(&best.hash, best.height, peer.id());
        }
    }

    async fn current(&self) -> bool {
        if !self.chain.is_current() {
            return false;
        }
        let sync_peer_id = self.sync_peer_id.load(Ordering::Relaxed);
        if sync_peer_id == 0 {
            return true;
        }
        let last_block = {
            let peer_states = self.peer_states.read().await;
            peer_states
                .get(&sync_peer_id)
                .map(|state| state.peer.last_block())
        };
        match last_block {
            Some(last_block) => self.chain.best_snapshot().height >= last_block,
            None => true,
        }
    }
}
