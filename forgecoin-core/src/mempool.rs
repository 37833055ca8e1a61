//! Pending-transaction pool with per-sender nonce ordering.
//!
//! The pool holds transactions that are not yet committed. A transaction
//! whose nonce sits above the sender's contiguous run is kept but stays
//! ineligible for selection until the gap closes, so reordered arrivals
//! are not lost.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::error::MempoolError;
use crate::ledger::AccountView;
use crate::types::Transaction;

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    /// Arrival order, used as the final selection tie-breaker.
    seq: u64,
}

/// In-memory set of pending transactions, keyed by txid with a per-sender
/// nonce index.
#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<String, MempoolEntry>,
    /// sender -> nonce -> txid. One slot per (sender, nonce) pair.
    by_sender: HashMap<String, BTreeMap<u64, String>>,
    next_seq: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    /// Admits a transaction. Rejects duplicates, bad signatures, nonces
    /// already consumed by the account, and conflicts for an occupied
    /// (sender, nonce) slot. Future nonces are admitted but stay
    /// ineligible for `take` until the gap closes.
    pub fn add(&mut self, tx: Transaction, view: &AccountView) -> Result<(), MempoolError> {
        if self.entries.contains_key(&tx.txid) {
            return Err(MempoolError::Duplicate);
        }
        if tx.is_coinbase() {
            return Err(MempoolError::Malformed("coinbase cannot be relayed".into()));
        }
        tx.check_well_formed().map_err(|e| match e {
            crate::error::ChainError::BadSignature => MempoolError::BadSignature,
            other => MempoolError::Malformed(other.to_string()),
        })?;
        let current = view.nonce_of(&tx.sender);
        if tx.nonce < current {
            return Err(MempoolError::StaleNonce {
                current,
                got: tx.nonce,
            });
        }
        let slots = self.by_sender.entry(tx.sender.clone()).or_default();
        if slots.contains_key(&tx.nonce) {
            return Err(MempoolError::Conflict(tx.nonce));
        }
        slots.insert(tx.nonce, tx.txid.clone());
        debug!("mempool add {} ({})", tx.txid, tx);
        self.entries.insert(
            tx.txid.clone(),
            MempoolEntry {
                tx,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        Ok(())
    }

    /// Removes a transaction, returning it if present.
    pub fn remove(&mut self, txid: &str) -> Option<Transaction> {
        let entry = self.entries.remove(txid)?;
        if let Some(slots) = self.by_sender.get_mut(&entry.tx.sender) {
            slots.remove(&entry.tx.nonce);
            if slots.is_empty() {
                self.by_sender.remove(&entry.tx.sender);
            }
        }
        Some(entry.tx)
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_sender.clear();
    }

    /// Selects up to `max_n` applicable transactions against a virtual
    /// copy of `view`. Ordered by sender nonce ascending, then fee
    /// descending, then arrival ascending; selecting a transaction
    /// advances the sender's nonce and debits its balance within the
    /// round, so several transactions from one sender can be picked.
    pub fn take(&self, max_n: usize, view: &AccountView) -> Vec<Transaction> {
        let mut virtual_view = view.clone();
        let mut selected = Vec::new();
        while selected.len() < max_n {
            let mut best: Option<&MempoolEntry> = None;
            for (sender, slots) in &self.by_sender {
                let Some(txid) = slots.get(&virtual_view.nonce_of(sender)) else {
                    continue;
                };
                let Some(entry) = self.entries.get(txid) else {
                    continue;
                };
                let need = entry.tx.amount + entry.tx.fee;
                if virtual_view.balance_of(sender) < need {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(current) => match entry.tx.fee.partial_cmp(&current.tx.fee) {
                        Some(std::cmp::Ordering::Greater) => true,
                        Some(std::cmp::Ordering::Equal) => entry.seq < current.seq,
                        _ => false,
                    },
                };
                if better {
                    best = Some(entry);
                }
            }
            let Some(entry) = best else { break };
            virtual_view.apply(&entry.tx);
            selected.push(entry.tx.clone());
        }
        selected
    }

    /// Offers displaced transactions back to the pool after a chain
    /// replacement, keeping only the ones still applicable against the
    /// rebuilt state (nonce and balance permitting). Rejections are
    /// silent.
    pub fn reapply(&mut self, txs: Vec<Transaction>, view: &AccountView) {
        for tx in txs {
            if view.balance_of(&tx.sender) < tx.amount + tx.fee {
                debug!("dropping displaced tx {}: sender can no longer fund it", tx.txid);
                continue;
            }
            if let Err(reason) = self.add(tx, view) {
                debug!("dropping displaced tx: {reason}");
            }
        }
    }

    /// Evicts transactions that became permanently invalid: nonce below
    /// the sender's account nonce. Called after every chain change.
    pub fn prune(&mut self, view: &AccountView) {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.tx.nonce < view.nonce_of(&e.tx.sender))
            .map(|e| e.tx.txid.clone())
            .collect();
        for txid in stale {
            debug!("pruning stale tx {txid}");
            self.remove(&txid);
        }
    }
}
