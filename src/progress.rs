use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::wire::{hash_to_hex, Hash256};

const LOG_INTERVAL: Duration = Duration::from_secs(10);

struct Inner {
    received_blocks: u64,
    received_txs: u64,
    last_log_time: Instant,
}

/// Accumulates block-processing progress and emits one summary line per
/// ten-second window so a long initial sync stays legible in the logs.
#[derive(Clone)]
pub struct BlockProgressLogger {
    action: &'static str,
    inner: Arc<Mutex<Inner>>,
}

impl BlockProgressLogger {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            inner: Arc::new(Mutex::new(Inner {
                received_blocks: 0,
                received_txs: 0,
                last_log_time: Instant::now(),
            })),
        }
    }

    /// Record one processed block and log the accumulated window if it is
    /// due.
    pub async fn log_block_height(&self, hash: &Hash256, height: i32, num_txs: usize) {
        let mut inner = self.inner.lock().await;
        inner.received_blocks += 1;
        inner.received_txs += num_txs as u64;

        let since_last = inner.last_log_time.elapsed();
        if since_last < LOG_INTERVAL {
            return;
        }

        let block_word = if inner.received_blocks == 1 { "block" } else { "blocks" };
        let tx_word = if inner.received_txs == 1 { "transaction" } else { "transactions" };
        tracing::info!(
            "{} {} {} in the last {:.2}s ({} {}, height {}, hash {})",
            self.action,
            inner.received_blocks,
            block_word,
            since_last.as_secs_f64(),
            inner.received_txs,
            tx_word,
            height,
            hash_to_hex(hash)
        );

        inner.received_blocks = 0;
        inner.received_txs = 0;
        inner.last_log_time = Instant::now();
    }

    /// Restart the window, typically when a fetch burst begins so the first
    /// summary is not dominated by idle time.
    pub async fn set_last_log_time(&self, time: Instant) {
        self.inner.lock().await.last_log_time = time;
    }
}
