use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use crate::wire::{
    Hash256, InvVect, Message, RejectCode, SERVICE_NODE_WITNESS,
};

pub type PeerId = i32;

/// Bound on the per-peer cache of inventory we know the peer has seen.
const MAX_KNOWN_INVENTORY: usize = 1000;

/// A connected remote peer as the sync manager sees it. The transport lives
/// elsewhere; outbound messages are fire-and-forget submissions onto the
/// peer's send queue.
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    services: u64,
    user_agent: String,
    starting_height: i32,
    last_block: AtomicI32,
    last_announced_block: Mutex<Option<Hash256>>,
    known_inventory: Mutex<HashSet<InvVect>>,
    disconnected: AtomicBool,
    msg_tx: mpsc::UnboundedSender<Message>,
}

impl Peer {
    /// Create a peer handle together with the receiving end of its outbound
    /// queue. The transport layer (or a test harness) drains the receiver.
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        services: u64,
        starting_height: i32,
        user_agent: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let peer = Self {
            id,
            addr,
            services,
            user_agent: user_agent.into(),
            starting_height,
            last_block: AtomicI32::new(starting_height),
            last_announced_block: Mutex::new(None),
            known_inventory: Mutex::new(HashSet::new()),
            disconnected: AtomicBool::new(false),
            msg_tx,
        };
        (peer, msg_rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn services(&self) -> u64 {
        self.services
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn starting_height(&self) -> i32 {
        self.starting_height
    }

    pub fn last_block(&self) -> i32 {
        self.last_block.load(Ordering::Relaxed)
    }

    pub fn is_witness_enabled(&self) -> bool {
        self.services & SERVICE_NODE_WITNESS == SERVICE_NODE_WITNESS
    }

    /// Record a newer height for the peer. Heights never move backward.
    pub fn update_last_block_height(&self, height: i32) {
        self.last_block.fetch_max(height, Ordering::Relaxed);
    }

    pub fn update_last_announced_block(&self, hash: &Hash256) {
        if let Ok(mut last) = self.last_announced_block.lock() {
            *last = Some(*hash);
        }
    }

    pub fn last_announced_block(&self) -> Option<Hash256> {
        self.last_announced_block.lock().ok().and_then(|last| *last)
    }

    /// Remember inventory the peer has announced so we avoid re-relaying it.
    pub fn add_known_inventory(&self, inv: InvVect) {
        if let Ok(mut known) = self.known_inventory.lock() {
            if known.len() + 1 > MAX_KNOWN_INVENTORY {
                if let Some(victim) = known.iter().next().copied() {
                    known.remove(&victim);
                }
            }
            known.insert(inv);
        }
    }

    pub fn has_known_inventory(&self, inv: &InvVect) -> bool {
        self.known_inventory
            .lock()
            .map(|known| known.contains(inv))
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Relaxed)
    }

    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::Relaxed) {
            tracing::debug!("Disconnecting peer {}", self);
        }
    }

    /// Submit a message to the peer's send queue. Fire-and-forget; the
    /// transport drains the queue asynchronously.
    pub fn queue_message(&self, msg: Message) {
        if !self.is_connected() {
            return;
        }
        if self.msg_tx.send(msg).is_err() {
            tracing::debug!("Send queue for peer {} is gone", self);
        }
    }

    pub fn push_get_headers_msg(&self, locator: Vec<Hash256>, stop_hash: Hash256) -> Result<()> {
        self.push(Message::GetHeaders { locator, stop_hash })
    }

    pub fn push_get_blocks_msg(&self, locator: Vec<Hash256>, stop_hash: Hash256) -> Result<()> {
        self.push(Message::GetBlocks { locator, stop_hash })
    }

    pub fn push_get_ublocks_msg(&self, locator: Vec<Hash256>, stop_hash: Hash256) -> Result<()> {
        self.push(Message::GetUBlocks { locator, stop_hash })
    }

    pub fn push_reject_msg(
        &self,
        message: impl Into<String>,
        code: RejectCode,
        reason: String,
        hash: Hash256,
    ) -> Result<()> {
        self.push(Message::Reject {
            message: message.into(),
            code,
            reason,
            hash,
        })
    }

    fn push(&self, msg: Message) -> Result<()> {
        if !self.is_connected() {
            bail!("peer {} is disconnected", self);
        }
        if self.msg_tx.send(msg).is_err() {
            bail!("send queue for peer {} is gone", self);
        }
        Ok(())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (peer {})", self.addr, self.id)
    }
}
