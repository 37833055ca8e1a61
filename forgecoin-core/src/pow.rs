//! Proof-of-Work: candidate assembly and the cooperative nonce search.
//!
//! The target predicate is "the block hash begins with `difficulty` hex
//! zeros". The async search yields to the scheduler and checks a
//! preemption flag every `MINE_YIELD_INTERVAL` attempts so a mining node
//! keeps servicing its sockets and can abandon a round the moment a
//! competing block extends the tip.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::constants::MINE_YIELD_INTERVAL;
use crate::types::{Block, Transaction};

/// Whether `hash` starts with `difficulty` hex zero characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let prefix = difficulty as usize;
    hash.len() >= prefix && hash.as_bytes()[..prefix].iter().all(|&b| b == b'0')
}

/// Assembles an unmined candidate: the coinbase paying
/// `block_reward + sum(fees)` followed by the selected transactions.
pub fn create_block(
    index: u64,
    transactions: Vec<Transaction>,
    previous_hash: String,
    miner_address: &str,
    difficulty: u32,
    block_reward: f64,
    timestamp: f64,
) -> Block {
    let total_fees: f64 = transactions.iter().map(|tx| tx.fee).sum();
    let coinbase = Transaction::coinbase(miner_address, block_reward + total_fees, timestamp);
    let mut all = Vec::with_capacity(transactions.len() + 1);
    all.push(coinbase);
    all.extend(transactions);
    Block::new(index, all, previous_hash, timestamp, difficulty, miner_address)
}

/// Searches nonces from the block's current value until the hash meets
/// the difficulty target. Returns `true` on success, `false` when the
/// preemption flag was raised. Yields every `MINE_YIELD_INTERVAL`
/// attempts.
pub async fn mine_block(block: &mut Block, stop: &AtomicBool) -> bool {
    let mut attempts: u64 = 0;
    loop {
        if block.meets_target() {
            info!(
                "mined block #{} nonce={} after {} attempts",
                block.index, block.nonce, attempts
            );
            return true;
        }
        if stop.load(Ordering::Relaxed) {
            debug!(
                "mining of block #{} preempted after {} attempts",
                block.index, attempts
            );
            return false;
        }
        block.nonce += 1;
        block.hash = block.compute_hash();
        attempts += 1;
        if attempts % MINE_YIELD_INTERVAL == 0 {
            debug!("mining block #{}: {} attempts", block.index, attempts);
            tokio::task::yield_now().await;
        }
    }
}

/// Blocking variant of the nonce search, for tests and helpers that do
/// not run under a scheduler.
pub fn solve(mut block: Block) -> Block {
    while !block.meets_target() {
        block.nonce += 1;
        block.hash = block.compute_hash();
    }
    block
}
