/// Reserved sender address of block-reward transactions.
pub const COINBASE_SENDER: &str = "COINBASE";

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Fixed genesis timestamp so every node derives an identical genesis block.
pub const GENESIS_TIMESTAMP: f64 = 1_700_000_000.0;

/// Default number of leading hex zeros a block hash must carry.
pub const DEFAULT_DIFFICULTY: u32 = 2;

/// Default coinbase subsidy, before fees.
pub const DEFAULT_BLOCK_REWARD: f64 = 50.0;

/// Maximum number of mempool transactions selected into one block.
pub const MAX_BLOCK_TXS: usize = 100;

/// Nonce attempts between cooperative yields of the mining loop.
pub const MINE_YIELD_INTERVAL: u64 = 100_000;
