mod common;

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Duration;

use common::*;
use copse::chain::Network;
use copse::manager::{Config, SyncManager};
use copse::wire::{InvType, InvVect, Message, SERVICE_NODE_NETWORK, SERVICE_NODE_WITNESS};

/// Scenario: the sync peer advertises 1000 blocks, delivers five, then goes
/// quiet. Past the three-minute stall window the sampler must disconnect it
/// (its reported height exceeds our tip) and, with nobody else to sync
/// from, leave the manager without a sync peer.
#[tokio::test(start_paused = true)]
async fn stalled_sync_peer_is_disconnected_and_replaced() {
    init_tracing();
    let chain = Arc::new(MockChain::new(Network::Mainnet, 1000));
    let pool = Arc::new(MockTxPool::new(false));
    let notifier = Arc::new(MockNotifier::new());
    let manager = SyncManager::new(Config {
        peer_notifier: Arc::clone(&notifier) as _,
        chain: Arc::clone(&chain) as _,
        tx_pool: Arc::clone(&pool) as _,
        chain_params: Arc::clone(&chain.params),
        fee_estimator: None,
        disable_checkpoints: true,
        utreexo_csn: false,
        utreexo_mn: false,
        utreexo_wn: false,
        utreexo_root_verify_mode: false,
        utreexo_start_root: None,
    });
    manager.start();

    let (peer, mut peer_rx) = make_peer(1, 1000, SERVICE_NODE_NETWORK | SERVICE_NODE_WITNESS);
    manager.new_peer(Arc::clone(&peer));
    assert_eq!(manager.sync_peer_id().await, 1);
    assert!(matches!(
        peer_rx.try_recv(),
        Ok(Message::GetBlocks { .. })
    ));

    let blocks = build_chain(5, false);
    let invs: Vec<InvVect> = blocks
        .iter()
        .map(|block| InvVect::new(InvType::Block, block.block_hash()))
        .collect();
    manager.queue_inv(invs, Arc::clone(&peer));
    for block in &blocks {
        let (done_tx, done_rx) = oneshot::channel();
        manager.queue_block(Arc::new(block.clone()), Arc::clone(&peer), done_tx);
        done_rx.await.unwrap();
    }
    assert_eq!(chain.tip_height(), 5);
    assert!(peer.is_connected());

    // Jump past the stall threshold; the next sampler tick fires with no
    // progress recorded for well over three minutes.
    tokio::time::advance(Duration::from_secs(211)).await;

    // Round trips force the loop through the pending tick; the select
    // between the tick and the reply is unordered, so give it a few tries.
    for _ in 0..50 {
        if !peer.is_connected() {
            break;
        }
        manager.sync_peer_id().await;
    }
    assert!(!peer.is_connected());

    // The server notices the dropped connection and reports the peer done;
    // with no other candidates the manager ends up without a sync peer.
    manager.done_peer(Arc::clone(&peer));
    assert_eq!(manager.sync_peer_id().await, 0);

    manager.stop().await;
}

/// A sync peer that stalls while we already match its height keeps its
/// connection: disconnecting is reserved for peers that still owe us
/// blocks.
#[tokio::test(start_paused = true)]
async fn stalled_peer_at_our_height_stays_connected() {
    init_tracing();
    let chain = Arc::new(MockChain::new(Network::Mainnet, 0));
    let pool = Arc::new(MockTxPool::new(false));
    let notifier = Arc::new(MockNotifier::new());
    let manager = SyncManager::new(Config {
        peer_notifier: Arc::clone(&notifier) as _,
        chain: Arc::clone(&chain) as _,
        tx_pool: Arc::clone(&pool) as _,
        chain_params: Arc::clone(&chain.params),
        fee_estimator: None,
        disable_checkpoints: true,
        utreexo_csn: false,
        utreexo_mn: false,
        utreexo_wn: false,
        utreexo_root_verify_mode: false,
        utreexo_start_root: None,
    });
    manager.start();

    // Starting height and last block both 0, exactly our tip.
    let (peer, _peer_rx) = make_peer(1, 0, SERVICE_NODE_NETWORK | SERVICE_NODE_WITNESS);
    manager.new_peer(Arc::clone(&peer));
    assert_eq!(manager.sync_peer_id().await, 1);

    tokio::time::advance(Duration::from_secs(211)).await;
    for _ in 0..20 {
        manager.sync_peer_id().await;
    }

    // Still connected, and re-selected as sync peer since it remains the
    // only candidate.
    assert!(peer.is_connected());
    assert_eq!(manager.sync_peer_id().await, 1);

    manager.stop().await;
}
