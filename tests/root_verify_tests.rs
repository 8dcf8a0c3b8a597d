mod common;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

use common::*;
use copse::chain::Network;
use copse::manager::{Config, SyncManager};
use copse::peer::Peer;
use copse::utreexo::UtreexoRootHint;
use copse::wire::{
    InvType, Message, UBlock, SERVICE_NODE_NETWORK, SERVICE_NODE_UTREEXO, SERVICE_NODE_WITNESS,
    ZERO_HASH,
};

fn root_hint(height: i32) -> UtreexoRootHint {
    UtreexoRootHint {
        height,
        roots: vec![height_hash(height)],
        num_leaves: height as u64,
    }
}

async fn feed_ublock(manager: &SyncManager, ublock: &UBlock, peer: &Arc<Peer>) {
    let (done_tx, done_rx) = oneshot::channel();
    manager.queue_ublock(Arc::new(ublock.clone()), Arc::clone(peer), done_tx);
    done_rx.await.expect("ublock worker reply dropped");
}

/// Scenario: two root hints at heights 1000 and 2000. Each range gets its
/// own accumulator view seeded from the previous root; each range reports
/// its verification result once the range's final ublock lands.
#[tokio::test]
async fn two_root_hint_ranges_verify_independently() {
    init_tracing();
    let hints = vec![root_hint(1000), root_hint(2000)];

    let blocks = build_chain(2000, false);
    let ublocks = ublocks_from(&blocks, 1);

    let mut chain = MockChain::new(Network::Mainnet, i32::MAX);
    chain.root_hints = hints.clone();
    {
        let mut heights = chain.heights_by_hash.lock().unwrap();
        for ublock in &ublocks {
            heights.insert(ublock.block_hash(), ublock.height);
        }
    }
    let chain = Arc::new(chain);
    let pool = Arc::new(MockTxPool::new(false));
    let notifier = Arc::new(MockNotifier::new());

    let manager = SyncManager::new(Config {
        peer_notifier: Arc::clone(&notifier) as _,
        chain: Arc::clone(&chain) as _,
        tx_pool: Arc::clone(&pool) as _,
        chain_params: Arc::clone(&chain.params),
        fee_estimator: None,
        disable_checkpoints: true,
        utreexo_csn: true,
        utreexo_mn: false,
        utreexo_wn: false,
        utreexo_root_verify_mode: true,
        utreexo_start_root: None,
    });

    // The header chain was downloaded up front; hand it to the verifier.
    let mut nodes = vec![copse::manager::HeaderNode { height: 0, hash: GENESIS_HASH }];
    nodes.extend(ublocks.iter().map(|ublock| copse::manager::HeaderNode {
        height: ublock.height,
        hash: ublock.block_hash(),
    }));
    manager.set_header_list(nodes);

    let (verified_tx, mut verified_rx) = mpsc::unbounded_channel();
    manager.start_parallel_u_root_verify(verified_tx);

    let (peer, mut peer_rx) = make_peer(
        1,
        2000,
        SERVICE_NODE_NETWORK | SERVICE_NODE_WITNESS | SERVICE_NODE_UTREEXO,
    );
    manager.new_peer(Arc::clone(&peer));

    // Both ranges request their ublocks as soon as the hints land.
    manager.queue_u_root_hint(hints[0].clone()).await;
    match expect_msg(&mut peer_rx).await {
        Message::GetData(list) => {
            assert_eq!(list.len(), 1000);
            assert!(list.iter().all(|iv| iv.inv_type == InvType::WitnessUBlock));
        }
        other => panic!("expected getdata for the first range, got {:?}", other),
    }

    manager.queue_u_root_hint(hints[1].clone()).await;
    match expect_msg(&mut peer_rx).await {
        Message::GetData(list) => {
            assert_eq!(list.len(), 1000);
            assert_eq!(list[0].hash, ublocks[1000].block_hash());
        }
        other => panic!("expected getdata for the second range, got {:?}", other),
    }

    // Interleave the two ranges; each applies to its own view.
    for i in 0..1000 {
        feed_ublock(&manager, &ublocks[i], &peer).await;
        feed_ublock(&manager, &ublocks[1000 + i], &peer).await;
    }

    let mut results = Vec::new();
    for _ in 0..2 {
        let result = tokio::time::timeout(Duration::from_secs(30), verified_rx.recv())
            .await
            .expect("timed out waiting for a verification report")
            .expect("verified channel closed");
        results.push(result);
    }
    assert!(results.iter().all(|result| result.validated));
    let mut heights: Vec<i32> = results.iter().map(|result| result.height).collect();
    heights.sort_unstable();
    assert_eq!(heights, vec![1000, 2000]);

    manager.stop().await;
}

/// The headers-only loop downloads batches of headers until the chain
/// reaches the root hint's height, then signals completion.
#[tokio::test]
async fn headers_download_completes_at_the_root_hint_height() {
    init_tracing();
    let blocks = build_chain(10, false);
    let chain = Arc::new(MockChain::new(Network::Mainnet, i32::MAX));
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
        utreexo_mn: true,
        utreexo_wn: false,
        utreexo_root_verify_mode: true,
        utreexo_start_root: None,
    });

    let (done_tx, done_rx) = oneshot::channel();
    manager.start_headers_download(root_hint(10), done_tx);

    let (peer, mut peer_rx) = make_peer(1, 20, SERVICE_NODE_NETWORK | SERVICE_NODE_WITNESS);
    manager.new_peer(Arc::clone(&peer));

    match expect_msg(&mut peer_rx).await {
        Message::GetHeaders { locator, stop_hash } => {
            assert_eq!(locator, vec![GENESIS_HASH]);
            assert_eq!(stop_hash, ZERO_HASH);
        }
        other => panic!("expected getheaders, got {:?}", other),
    }

    // A partial batch leaves the loop asking for more from the last header.
    let first_batch: Vec<_> = blocks[..5].iter().map(|block| block.header).collect();
    manager.queue_headers(first_batch, Arc::clone(&peer));
    match expect_msg(&mut peer_rx).await {
        Message::GetHeaders { locator, stop_hash } => {
            assert_eq!(locator, vec![blocks[4].block_hash()]);
            assert_eq!(stop_hash, ZERO_HASH);
        }
        other => panic!("expected a follow-up getheaders, got {:?}", other),
    }

    // The rest of the headers reach the target height and finish the loop.
    let second_batch: Vec<_> = blocks[5..].iter().map(|block| block.header).collect();
    manager.queue_headers(second_batch, Arc::clone(&peer));

    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("timed out waiting for the headers download to finish")
        .expect("headers download loop dropped its completion signal");

    manager.stop().await;
}
