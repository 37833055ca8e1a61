//! Merkle tree over an ordered transaction list.
//!
//! Leaves are transaction ids (the hash of each transaction's canonical
//! serialization). An odd node at any level is paired with itself. The
//! root of an empty list is the hash of the empty string, matching the
//! `merkle_root` of the genesis block.

use crate::crypto::sha256_hex;
use crate::types::Transaction;

/// Which side of the pair a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof: the sibling hash and its side.
pub type ProofStep = (String, Side);

/// Binary Merkle tree retaining every level for proof generation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` is the leaves; the last level holds the single root.
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Builds the tree over the transactions' ids.
    pub fn from_transactions(txs: &[Transaction]) -> Self {
        Self::from_leaves(txs.iter().map(|tx| tx.txid.clone()).collect())
    }

    /// Builds the tree over pre-hashed leaves.
    pub fn from_leaves(leaves: Vec<String>) -> Self {
        if leaves.is_empty() {
            return MerkleTree { levels: Vec::new() };
        }
        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(sha256_hex(&format!("{left}{right}")));
            }
            levels.push(next);
        }
        MerkleTree { levels }
    }

    /// The Merkle root; hash of the empty string for an empty tree.
    pub fn root(&self) -> String {
        match self.levels.last().and_then(|level| level.first()) {
            Some(root) => root.clone(),
            None => sha256_hex(""),
        }
    }

    /// Inclusion proof for the leaf at `index`, or `None` if out of range.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        let leaves = self.levels.first()?;
        if index >= leaves.len() {
            return None;
        }
        let mut steps = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            if position % 2 == 0 {
                // Sibling on the right; an unpaired node is its own sibling.
                let sibling = level.get(position + 1).unwrap_or(&level[position]);
                steps.push((sibling.clone(), Side::Right));
            } else {
                steps.push((level[position - 1].clone(), Side::Left));
            }
            position /= 2;
        }
        Some(steps)
    }

    /// Replays a proof from `leaf` and compares against `expected_root`.
    pub fn verify(leaf: &str, proof: &[ProofStep], expected_root: &str) -> bool {
        let mut current = leaf.to_string();
        for (sibling, side) in proof {
            current = match side {
                Side::Left => sha256_hex(&format!("{sibling}{current}")),
                Side::Right => sha256_hex(&format!("{current}{sibling}")),
            };
        }
        current == expected_root
    }
}

/// Root over a transaction list without keeping the tree around.
pub fn merkle_root(txs: &[Transaction]) -> String {
    MerkleTree::from_transactions(txs).root()
}
