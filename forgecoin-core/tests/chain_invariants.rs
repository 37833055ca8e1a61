//! Cross-module invariants: PoW and Merkle integrity of accepted blocks,
//! balance and nonce safety under replay, proof round-trips and the
//! fork-resolution contract.

use forgecoin_core::merkle::{MerkleTree, Side};
use forgecoin_core::{pow, ChainError, Ledger, Mempool, Transaction};

const DIFFICULTY: u32 = 1;
const REWARD: f64 = 50.0;

fn signed(sender: &str, receiver: &str, amount: f64, fee: f64, nonce: u64) -> Transaction {
    let mut tx = Transaction::new(sender, receiver, amount, fee, nonce, 1_000.0);
    tx.sign(sender);
    tx
}

fn mine_on(ledger: &mut Ledger, miner: &str, txs: Vec<Transaction>) {
    let block = pow::solve(pow::create_block(
        ledger.height() + 1,
        txs,
        ledger.tip().hash.clone(),
        miner,
        ledger.difficulty(),
        ledger.block_reward(),
        1_000.0,
    ));
    ledger.append(block).expect("mined block must append");
}

#[test]
fn accepted_blocks_satisfy_pow_and_merkle() {
    let mut ledger = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut ledger, "node0", vec![]);
    let tx = signed("node0", "node1", 10.0, 0.5, 0);
    mine_on(&mut ledger, "node1", vec![tx]);

    for block in ledger.chain().iter().filter(|b| b.index > 0) {
        assert!(
            pow::meets_difficulty(&block.hash, block.difficulty),
            "block #{} violates the difficulty target",
            block.index
        );
        assert_eq!(
            block.merkle_root,
            forgecoin_core::merkle::merkle_root(&block.transactions),
            "block #{} has a stale merkle root",
            block.index
        );
        assert_eq!(block.hash, block.compute_hash());
    }
}

#[test]
fn replay_never_goes_negative_and_nonces_are_contiguous() {
    let mut ledger = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut ledger, "node0", vec![]);
    mine_on(&mut ledger, "node0", vec![]);
    let spend_most = signed("node0", "node1", 95.0, 1.0, 0);
    mine_on(&mut ledger, "node1", vec![spend_most]);
    let pass_along = signed("node1", "node2", 80.0, 0.0, 0);
    let keep_some = signed("node0", "node2", 2.0, 0.0, 1);
    mine_on(&mut ledger, "node2", vec![pass_along, keep_some]);

    // Replaying the full chain on a scratch state must succeed, and the
    // final balances must be non-negative everywhere.
    let state = Ledger::validate_chain(ledger.chain(), DIFFICULTY, REWARD)
        .expect("a chain the ledger built must validate");
    for address in ["node0", "node1", "node2"] {
        assert!(state.balance_of(address) >= 0.0);
    }

    // Committed nonces per sender form 0..n with no gaps.
    for sender in ["node0", "node1"] {
        let mut nonces: Vec<u64> = ledger
            .chain()
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter(|tx| tx.sender == sender)
            .map(|tx| tx.nonce)
            .collect();
        nonces.sort_unstable();
        let expected: Vec<u64> = (0..nonces.len() as u64).collect();
        assert_eq!(nonces, expected, "nonce gap for {sender}");
        assert_eq!(ledger.nonce_of(sender), nonces.len() as u64);
    }
}

#[test]
fn replace_chain_contract_matches_validate_chain() {
    let mut ours = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut ours, "node0", vec![]);

    // Equal length: refused.
    let mut even = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut even, "node1", vec![]);
    assert_eq!(
        ours.replace_chain(even.chain().to_vec()),
        Err(ChainError::NotLonger)
    );

    // Longer but corrupted: refused, chain untouched.
    let mut longer = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut longer, "node1", vec![]);
    mine_on(&mut longer, "node1", vec![]);
    let mut corrupted = longer.chain().to_vec();
    corrupted[2].transactions[0].amount = 9_999.0;
    let before = ours.tip().hash.clone();
    assert!(ours.replace_chain(corrupted).is_err());
    assert_eq!(ours.tip().hash, before);

    // Longer and valid: accepted, and the rebuilt account state equals
    // the scratch state computed by validation.
    let candidate = longer.chain().to_vec();
    let scratch = Ledger::validate_chain(&candidate, DIFFICULTY, REWARD).unwrap();
    ours.replace_chain(candidate).unwrap();
    for address in ["node0", "node1"] {
        assert_eq!(ours.balance_of(address), scratch.balance_of(address));
        assert_eq!(ours.nonce_of(address), scratch.nonce_of(address));
    }
}

#[test]
fn displaced_transactions_flow_back_through_the_mempool() {
    let mut ledger = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut ledger, "node0", vec![]);
    let tx = signed("node0", "node1", 10.0, 0.5, 0);
    mine_on(&mut ledger, "node0", vec![tx.clone()]);

    let mut rival = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut rival, "node2", vec![]);
    mine_on(&mut rival, "node2", vec![]);
    mine_on(&mut rival, "node2", vec![]);

    let displaced = ledger.replace_chain(rival.chain().to_vec()).unwrap();
    assert_eq!(displaced, vec![tx.clone()]);

    // After the reorg node0 owns nothing on the new chain, so the
    // displaced transfer is no longer fundable and must not re-enter.
    let mut mempool = Mempool::new();
    mempool.reapply(displaced, ledger.account_view());
    assert!(!mempool.contains(&tx.txid));
    assert_eq!(mempool.size(), 0);
}

#[test]
fn block_inclusion_proof_round_trip() {
    // A block with seven transactions, as a dashboard would verify it.
    let mut ledger = Ledger::new(DIFFICULTY, REWARD);
    mine_on(&mut ledger, "node0", vec![]);
    mine_on(&mut ledger, "node0", vec![]);
    let txs: Vec<Transaction> = (0..6)
        .map(|n| signed("node0", "node1", 1.0, 0.0, n))
        .collect();
    mine_on(&mut ledger, "node1", txs);

    let block = ledger.tip();
    assert_eq!(block.transactions.len(), 7);

    let tree = MerkleTree::from_transactions(&block.transactions);
    assert_eq!(tree.root(), block.merkle_root);

    let proof = tree.proof(3).expect("index 3 is in range");
    assert_eq!(proof.len(), 3, "ceil(log2(7)) sibling hashes");
    let leaf = &block.transactions[3].txid;
    assert!(MerkleTree::verify(leaf, &proof, &block.merkle_root));

    let mut tampered = proof.clone();
    tampered[1].1 = match tampered[1].1 {
        Side::Left => Side::Right,
        Side::Right => Side::Left,
    };
    assert!(!MerkleTree::verify(leaf, &tampered, &block.merkle_root));
}
