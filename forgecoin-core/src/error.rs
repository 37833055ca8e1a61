use thiserror::Error;

/// Errors produced by block and chain validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error("height mismatch: expected index {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("previous_hash does not match the current tip")]
    ParentMismatch,
    #[error("proof of work does not meet difficulty {0}")]
    BadPow(u32),
    #[error("merkle root does not match block transactions")]
    BadMerkle,
    #[error("invalid transaction signature")]
    BadSignature,
    #[error("bad nonce for {sender}: expected {expected}, got {got}")]
    BadNonce {
        sender: String,
        expected: u64,
        got: u64,
    },
    #[error("insufficient balance for {sender}: have {have}, need {need}")]
    InsufficientBalance {
        sender: String,
        have: f64,
        need: f64,
    },
    #[error("bad coinbase: {0}")]
    BadCoinbase(String),
    #[error("candidate chain does not share our genesis")]
    GenesisMismatch,
    #[error("candidate chain is not longer than the current chain")]
    NotLonger,
    #[error("malformed transaction: {0}")]
    BadTransaction(String),
    #[error("malformed block: {0}")]
    BadBlock(String),
}

/// Reasons a transaction is refused by the mempool.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    Duplicate,
    #[error("invalid transaction signature")]
    BadSignature,
    #[error("nonce {got} is below account nonce {current}")]
    StaleNonce { current: u64, got: u64 },
    #[error("conflicting transaction for sender nonce {0}")]
    Conflict(u64),
    #[error("malformed transaction: {0}")]
    Malformed(String),
}
