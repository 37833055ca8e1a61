//! Transaction and block types shared by every component.
//!
//! Hash preimages are canonical compact JSON with a fixed field order, so
//! serde struct-field order below is load-bearing: `txid` covers
//! `{sender, receiver, amount, fee, nonce, timestamp}` and the block hash
//! covers `{index, previous_hash, merkle_root, timestamp, nonce,
//! difficulty, miner_address}`.

use serde::{Deserialize, Serialize};

use crate::constants::{COINBASE_SENDER, GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP};
use crate::crypto::{mac_hex, sha256_hex, verify_mac};
use crate::error::ChainError;
use crate::merkle;

/// A transfer between two accounts, or a coinbase reward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
    pub fee: f64,
    /// Per-sender sequence number; must equal the sender's account nonce.
    pub nonce: u64,
    /// Seconds since the Unix epoch at creation time.
    pub timestamp: f64,
    /// Keyed MAC over the txid; empty for coinbase transactions.
    #[serde(default)]
    pub signature: String,
    pub txid: String,
}

/// Canonical hash preimage of a transaction. Field order is the wire contract.
#[derive(Serialize)]
struct TxPreimage<'a> {
    sender: &'a str,
    receiver: &'a str,
    amount: f64,
    fee: f64,
    nonce: u64,
    timestamp: f64,
}

impl Transaction {
    /// Creates an unsigned transaction and fills in its txid.
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        amount: f64,
        fee: f64,
        nonce: u64,
        timestamp: f64,
    ) -> Self {
        let mut tx = Transaction {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            fee,
            nonce,
            timestamp,
            signature: String::new(),
            txid: String::new(),
        };
        tx.txid = tx.compute_txid();
        tx
    }

    /// Creates the reward transaction for a mined block.
    pub fn coinbase(miner: impl Into<String>, reward: f64, timestamp: f64) -> Self {
        Transaction::new(COINBASE_SENDER, miner, reward, 0.0, 0, timestamp)
    }

    /// Hash of the canonical serialization of everything except the signature.
    pub fn compute_txid(&self) -> String {
        let preimage = TxPreimage {
            sender: &self.sender,
            receiver: &self.receiver,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            timestamp: self.timestamp,
        };
        sha256_hex(&serde_json::to_string(&preimage).unwrap_or_default())
    }

    /// Signs the transaction with the sender's key material.
    pub fn sign(&mut self, key: &str) {
        self.signature = mac_hex(key, &self.txid);
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender == COINBASE_SENDER
    }

    /// Verifies the keyed MAC against the sender address.
    pub fn verify_signature(&self) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        verify_mac(&self.sender, &self.txid, &self.signature)
    }

    /// Structural validation, independent of any account state.
    pub fn check_well_formed(&self) -> Result<(), ChainError> {
        if !self.amount.is_finite() || !self.fee.is_finite() {
            return Err(ChainError::BadTransaction(
                "amount and fee must be finite".into(),
            ));
        }
        if self.amount < 0.0 {
            return Err(ChainError::BadTransaction("amount cannot be negative".into()));
        }
        if self.fee < 0.0 {
            return Err(ChainError::BadTransaction("fee cannot be negative".into()));
        }
        if self.sender == self.receiver {
            return Err(ChainError::BadTransaction(
                "sender and receiver must differ".into(),
            ));
        }
        if self.txid != self.compute_txid() {
            return Err(ChainError::BadTransaction("txid does not match contents".into()));
        }
        if self.is_coinbase() {
            if !self.signature.is_empty() {
                return Err(ChainError::BadTransaction(
                    "coinbase must be unsigned".into(),
                ));
            }
            if self.nonce != 0 || self.fee != 0.0 {
                return Err(ChainError::BadTransaction(
                    "coinbase must carry nonce 0 and no fee".into(),
                ));
            }
        } else {
            if self.amount <= 0.0 {
                return Err(ChainError::BadTransaction("amount must be positive".into()));
            }
            if !self.verify_signature() {
                return Err(ChainError::BadSignature);
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} amount={} fee={} nonce={}",
            self.sender, self.receiver, self.amount, self.fee, self.nonce
        )
    }
}

/// One block of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    /// Ordered transactions; the first entry of a non-genesis block is the coinbase.
    pub transactions: Vec<Transaction>,
    pub timestamp: f64,
    /// Proof-of-Work nonce, varied by the miner.
    pub nonce: u64,
    /// Required number of leading hex zeros of `hash`.
    pub difficulty: u32,
    pub merkle_root: String,
    /// Recipient of the coinbase reward.
    pub miner_address: String,
    pub hash: String,
}

/// Canonical hash preimage of a block header. Field order is the wire contract.
#[derive(Serialize)]
struct HeaderPreimage<'a> {
    index: u64,
    previous_hash: &'a str,
    merkle_root: &'a str,
    timestamp: f64,
    nonce: u64,
    difficulty: u32,
    miner_address: &'a str,
}

impl Block {
    /// Builds a block at nonce 0 with its Merkle root and hash filled in.
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: impl Into<String>,
        timestamp: f64,
        difficulty: u32,
        miner_address: impl Into<String>,
    ) -> Self {
        let merkle_root = merkle::merkle_root(&transactions);
        let mut block = Block {
            index,
            previous_hash: previous_hash.into(),
            transactions,
            timestamp,
            nonce: 0,
            difficulty,
            merkle_root,
            miner_address: miner_address.into(),
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The fixed genesis block every node starts from.
    pub fn genesis(difficulty: u32) -> Self {
        Block::new(
            0,
            Vec::new(),
            GENESIS_PREVIOUS_HASH,
            GENESIS_TIMESTAMP,
            difficulty,
            "",
        )
    }

    /// Hash of the canonical header serialization.
    pub fn compute_hash(&self) -> String {
        let preimage = HeaderPreimage {
            index: self.index,
            previous_hash: &self.previous_hash,
            merkle_root: &self.merkle_root,
            timestamp: self.timestamp,
            nonce: self.nonce,
            difficulty: self.difficulty,
            miner_address: &self.miner_address,
        };
        sha256_hex(&serde_json::to_string(&preimage).unwrap_or_default())
    }

    /// Whether `hash` meets the block's own difficulty target.
    pub fn meets_target(&self) -> bool {
        crate::pow::meets_difficulty(&self.hash, self.difficulty)
    }

    /// Sum of fees over non-coinbase transactions.
    pub fn total_fees(&self) -> f64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.fee)
            .sum()
    }

    /// Structural validation: header integrity, Proof-of-Work, Merkle root
    /// and per-transaction well-formedness. State-dependent checks (nonces,
    /// balances, coinbase amount) belong to the ledger.
    pub fn check_well_formed(&self) -> Result<(), ChainError> {
        if self.hash != self.compute_hash() {
            return Err(ChainError::BadBlock("hash does not match header".into()));
        }
        // Genesis is fixed and exempt from the PoW predicate.
        if self.index > 0 && !self.meets_target() {
            return Err(ChainError::BadPow(self.difficulty));
        }
        if self.merkle_root != merkle::merkle_root(&self.transactions) {
            return Err(ChainError::BadMerkle);
        }
        if self.index == 0 {
            if !self.transactions.is_empty() {
                return Err(ChainError::BadBlock("genesis carries no transactions".into()));
            }
            return Ok(());
        }
        match self.transactions.first() {
            Some(first) if first.is_coinbase() => {}
            _ => {
                return Err(ChainError::BadCoinbase(
                    "first transaction must be the coinbase".into(),
                ))
            }
        }
        if self.transactions.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(ChainError::BadCoinbase("more than one coinbase".into()));
        }
        for tx in &self.transactions {
            tx.check_well_formed()?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block #{} ({} txs, hash {})",
            self.index,
            self.transactions.len(),
            &self.hash[..16.min(self.hash.len())]
        )
    }
}
