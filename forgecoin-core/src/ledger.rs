//! The replicated account ledger: canonical chain, derived balances and
//! fork resolution by the longest-chain rule.
//!
//! Account state is never stored independently; it is the replay of the
//! chain from genesis. `append` and `replace_chain` both validate against
//! a scratch copy first, so a rejected block or candidate chain leaves
//! the ledger untouched.

use std::collections::{HashMap, HashSet};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;
use crate::types::{Block, Transaction};

/// Balance and next-expected nonce of one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balance: f64,
    pub nonce: u64,
}

/// A point-in-time view of every account, replayable transaction by
/// transaction. The mempool clones one of these to select transactions
/// against a virtual state.
#[derive(Debug, Clone, Default)]
pub struct AccountView {
    accounts: HashMap<String, Account>,
}

impl AccountView {
    pub fn balance_of(&self, address: &str) -> f64 {
        self.accounts.get(address).map_or(0.0, |a| a.balance)
    }

    pub fn nonce_of(&self, address: &str) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.nonce)
    }

    /// Checks a transaction against this view: structure, signature,
    /// exact nonce and sufficient balance. Coinbase passes the state
    /// checks unconditionally; its amount is validated by the ledger.
    pub fn can_apply(&self, tx: &Transaction) -> Result<(), ChainError> {
        tx.check_well_formed()?;
        if tx.is_coinbase() {
            return Ok(());
        }
        let expected = self.nonce_of(&tx.sender);
        if tx.nonce != expected {
            return Err(ChainError::BadNonce {
                sender: tx.sender.clone(),
                expected,
                got: tx.nonce,
            });
        }
        let have = self.balance_of(&tx.sender);
        let need = tx.amount + tx.fee;
        if have < need {
            return Err(ChainError::InsufficientBalance {
                sender: tx.sender.clone(),
                have,
                need,
            });
        }
        Ok(())
    }

    /// Applies a transaction assumed to have passed `can_apply`.
    pub fn apply(&mut self, tx: &Transaction) {
        if !tx.is_coinbase() {
            let sender = self.accounts.entry(tx.sender.clone()).or_default();
            sender.balance -= tx.amount + tx.fee;
            sender.nonce = tx.nonce + 1;
        }
        let receiver = self.accounts.entry(tx.receiver.clone()).or_default();
        receiver.balance += tx.amount;
    }
}

/// The canonical chain plus the account state derived from it.
#[derive(Debug, Clone)]
pub struct Ledger {
    chain: Vec<Block>,
    state: AccountView,
    difficulty: u32,
    block_reward: f64,
}

impl Ledger {
    /// A fresh ledger holding only the fixed genesis block.
    pub fn new(difficulty: u32, block_reward: f64) -> Self {
        Ledger {
            chain: vec![Block::genesis(difficulty)],
            state: AccountView::default(),
            difficulty,
            block_reward,
        }
    }

    pub fn tip(&self) -> &Block {
        // The chain always holds at least genesis.
        &self.chain[self.chain.len() - 1]
    }

    /// Index of the tip block; 0 for a genesis-only chain.
    pub fn height(&self) -> u64 {
        self.tip().index
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn block_reward(&self) -> f64 {
        self.block_reward
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// The most recent `n` blocks, tip last.
    pub fn recent_blocks(&self, n: usize) -> Vec<Block> {
        let start = self.chain.len().saturating_sub(n);
        self.chain[start..].to_vec()
    }

    /// Blocks from `from_index` (clamped to the chain) through the tip.
    pub fn blocks_from(&self, from_index: u64) -> Vec<Block> {
        let start = (from_index as usize).min(self.chain.len().saturating_sub(1));
        self.chain[start..].to_vec()
    }

    pub fn balance_of(&self, address: &str) -> f64 {
        self.state.balance_of(address)
    }

    pub fn nonce_of(&self, address: &str) -> u64 {
        self.state.nonce_of(address)
    }

    pub fn account_view(&self) -> &AccountView {
        &self.state
    }

    pub fn can_apply(&self, tx: &Transaction) -> Result<(), ChainError> {
        self.state.can_apply(tx)
    }

    /// Whether a transaction id is committed anywhere in the chain.
    pub fn contains_txid(&self, txid: &str) -> bool {
        self.chain
            .iter()
            .any(|b| b.transactions.iter().any(|tx| tx.txid == txid))
    }

    /// Validates `block` against this ledger's tip and state, then checks
    /// its coinbase amount and replays its transactions on a scratch view.
    fn check_block(&self, block: &Block) -> Result<AccountView, ChainError> {
        block.check_well_formed()?;
        if block.difficulty != self.difficulty {
            return Err(ChainError::BadPow(self.difficulty));
        }
        let expected = self.height() + 1;
        if block.index != expected {
            return Err(ChainError::HeightMismatch {
                expected,
                got: block.index,
            });
        }
        if block.previous_hash != self.tip().hash {
            return Err(ChainError::ParentMismatch);
        }
        let reward = self.block_reward + block.total_fees();
        let coinbase_amount = block
            .transactions
            .first()
            .map(|tx| tx.amount)
            .unwrap_or_default();
        if (coinbase_amount - reward).abs() > f64::EPSILON * reward.max(1.0) {
            return Err(ChainError::BadCoinbase(format!(
                "reward {coinbase_amount} does not equal block_reward + fees = {reward}"
            )));
        }
        let mut scratch = self.state.clone();
        for tx in &block.transactions {
            scratch.can_apply(tx)?;
            scratch.apply(tx);
        }
        Ok(scratch)
    }

    /// Appends a block extending the tip. Rejection is total: on error the
    /// chain and account state are unchanged.
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        let next_state = self.check_block(&block)?;
        info!(
            "appended {} mined by {} ({} txs)",
            block,
            block.miner_address,
            block.transactions.len()
        );
        self.chain.push(block);
        self.state = next_state;
        Ok(())
    }

    /// Validates a whole chain from genesis on a scratch state, returning
    /// the resulting account view.
    pub fn validate_chain(
        chain: &[Block],
        difficulty: u32,
        block_reward: f64,
    ) -> Result<AccountView, ChainError> {
        let Some(genesis) = chain.first() else {
            return Err(ChainError::BadBlock("chain is empty".into()));
        };
        if *genesis != Block::genesis(difficulty) {
            return Err(ChainError::GenesisMismatch);
        }
        let mut scratch = Ledger {
            chain: vec![genesis.clone()],
            state: AccountView::default(),
            difficulty,
            block_reward,
        };
        for block in &chain[1..] {
            scratch.append(block.clone())?;
        }
        Ok(scratch.state)
    }

    /// Replaces the chain with a strictly longer valid candidate sharing
    /// our genesis. Returns the non-coinbase transactions of the discarded
    /// suffix that are not committed in the new chain, so the caller can
    /// offer them back to the mempool. Ties keep the current chain.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> Result<Vec<Transaction>, ChainError> {
        if candidate.len() <= self.chain.len() {
            return Err(ChainError::NotLonger);
        }
        if candidate.first().map(|b| &b.hash) != Some(&self.chain[0].hash) {
            return Err(ChainError::GenesisMismatch);
        }
        let state = Self::validate_chain(&candidate, self.difficulty, self.block_reward)?;

        let committed: HashSet<&str> = candidate
            .iter()
            .flat_map(|b| b.transactions.iter())
            .map(|tx| tx.txid.as_str())
            .collect();
        let fork_point = self
            .chain
            .iter()
            .zip(candidate.iter())
            .take_while(|(ours, theirs)| ours.hash == theirs.hash)
            .count();
        let displaced: Vec<Transaction> = self.chain[fork_point..]
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter(|tx| !tx.is_coinbase() && !committed.contains(tx.txid.as_str()))
            .cloned()
            .collect();

        info!(
            "replacing chain at height {} with candidate at height {} ({} displaced txs)",
            self.height(),
            candidate[candidate.len() - 1].index,
            displaced.len()
        );
        self.chain = candidate;
        self.state = state;
        Ok(displaced)
    }
}

impl std::fmt::Display for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chain height {} tip {}",
            self.height(),
            &self.tip().hash[..16]
        )
    }
}
