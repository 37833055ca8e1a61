//! Core chain logic for the Forge Coin simulation.
//!
//! This crate holds everything a node needs that is independent of the
//! network: the transaction and block data model, the Merkle engine, the
//! account ledger with fork resolution, the mempool and the Proof-of-Work
//! search. The networking and orchestration layers live in
//! `forgecoin-node`.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod mempool;
pub mod merkle;
pub mod pow;
pub mod types;

pub use error::{ChainError, MempoolError};
pub use ledger::{Account, AccountView, Ledger};
pub use mempool::Mempool;
pub use types::{Block, Transaction};

/// Current wall-clock time as seconds since the Unix epoch.
pub fn unix_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
