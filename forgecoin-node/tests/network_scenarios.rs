//! End-to-end scenarios over real TCP: propagation, partitions, crashes,
//! double-spends and resynchronization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use forgecoin_core::{unix_time, Transaction};
use forgecoin_node::{Node, NodeConfig, NodeError};

const DIFFICULTY: u32 = 2;
const BLOCK_REWARD: f64 = 50.0;

async fn spawn_nodes(count: usize) -> Vec<Arc<Node>> {
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let mut config = NodeConfig::new(format!("node{i}"), "127.0.0.1", 0);
        config.difficulty = DIFFICULTY;
        config.block_reward = BLOCK_REWARD;
        let node = Node::new(config);
        node.start().await.expect("node failed to start");
        nodes.push(node);
    }
    nodes
}

fn port_of(node: &Arc<Node>) -> u16 {
    node.network().listen_port().expect("node is not listening")
}

async fn connect_ring(nodes: &[Arc<Node>]) {
    for i in 0..nodes.len() {
        let next = &nodes[(i + 1) % nodes.len()];
        nodes[i]
            .connect_to_peer("127.0.0.1", port_of(next))
            .await
            .expect("ring connect failed");
    }
}

async fn connect_mesh(nodes: &[Arc<Node>]) {
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            nodes[i]
                .connect_to_peer("127.0.0.1", port_of(&nodes[j]))
                .await
                .expect("mesh connect failed");
        }
    }
}

async fn shutdown(nodes: &[Arc<Node>]) {
    for node in nodes {
        let _ = node.stop().await;
    }
}

/// Polls `predicate` until it holds or the deadline passes.
async fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

fn transfer(sender: &str, receiver: &str, amount: f64, fee: f64, nonce: u64) -> Transaction {
    let mut tx = Transaction::new(sender, receiver, amount, fee, nonce, unix_time());
    tx.sign(sender);
    tx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn basic_propagation_over_a_ring() {
    let nodes = spawn_nodes(4).await;
    connect_ring(&nodes).await;

    // node0 mines the first block and everyone follows.
    nodes[0].mine_once().await.expect("node0 failed to mine");
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| n.height() == 1))
        .await,
        "block #1 did not propagate to the whole ring"
    );
    assert_eq!(nodes[0].balance_of("node0"), BLOCK_REWARD);

    // A transfer gossips into every mempool.
    let tx = transfer("node0", "node1", 10.0, 0.5, 0);
    let txid = tx.txid.clone();
    nodes[0].submit_transaction(tx).expect("tx refused");
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| n.mempool_contains(&txid)))
        .await,
        "transaction did not reach every mempool"
    );

    // node1 mines it; the whole ring converges on height 2.
    nodes[1].mine_once().await.expect("node1 failed to mine");
    let tip = nodes[1].tip_hash();
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| n.height() == 2 && n.tip_hash() == tip))
        .await,
        "ring did not converge on height 2"
    );

    for node in &nodes {
        assert_eq!(node.balance_of("node0"), 39.5);
        assert_eq!(node.balance_of("node1"), 60.5);
        assert_eq!(node.balance_of("node2"), 0.0);
        assert_eq!(node.balance_of("node3"), 0.0);
        assert!(node.chain_contains(&txid));
    }
    assert!(
        wait_until(Duration::from_secs(5), || nodes
            .iter()
            .all(|n| !n.mempool_contains(&txid)))
        .await,
        "committed transaction lingered in a mempool"
    );

    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partition_and_heal_converges_on_longest_chain() {
    let nodes = spawn_nodes(4).await;
    connect_mesh(&nodes).await;

    // Shared starter block so node0 has funds to orphan later.
    nodes[0].mine_once().await.expect("starter block failed");
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| n.height() == 1))
        .await
    );

    // Partition {node0, node1} from {node2, node3}: 100% drop on every
    // boundary-crossing link, in both directions.
    let groups: [&[usize]; 2] = [&[0, 1], &[2, 3]];
    for &a in groups[0] {
        for &b in groups[1] {
            nodes[a].network().set_link_drop(nodes[b].node_id(), 1.0);
            nodes[b].network().set_link_drop(nodes[a].node_id(), 1.0);
        }
    }

    // The small side commits a transfer, the large side just out-mines it.
    let tx = transfer("node0", "node1", 10.0, 0.5, 0);
    let txid = tx.txid.clone();
    nodes[0].submit_transaction(tx).expect("tx refused");
    assert!(
        wait_until(Duration::from_secs(5), || nodes[1].mempool_contains(&txid)).await,
        "tx did not reach the partition partner"
    );
    nodes[0].mine_once().await.expect("node0 side failed to mine");
    assert!(nodes[0].chain_contains(&txid));

    for _ in 0..3 {
        nodes[2].mine_once().await.expect("node2 side failed to mine");
    }
    assert!(
        wait_until(Duration::from_secs(10), || nodes[3].height() == 4).await,
        "node3 did not follow its partition side"
    );
    assert_eq!(nodes[0].height(), 2);
    assert!(
        !nodes[2].chain_contains(&txid),
        "partition leaked the transaction"
    );

    // Heal and resynchronize.
    for node in &nodes {
        node.network().clear_link_drops();
    }
    for node in &nodes {
        node.sync_with_peers();
    }

    let tip = nodes[2].tip_hash();
    assert!(
        wait_until(Duration::from_secs(15), || nodes
            .iter()
            .all(|n| n.height() == 4 && n.tip_hash() == tip))
        .await,
        "network did not converge after healing"
    );

    // The orphaned transfer returns to the mempools that lost it; the
    // orphaned coinbase does not resurface anywhere.
    assert!(
        wait_until(Duration::from_secs(5), || nodes[0].mempool_contains(&txid)).await,
        "displaced transaction did not re-enter node0's mempool"
    );
    for node in &nodes {
        assert!(!node.chain_contains(&txid));
        assert_eq!(node.balance_of("node2"), 3.0 * BLOCK_REWARD);
    }

    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_and_resync_catches_up() {
    let nodes = spawn_nodes(4).await;
    connect_ring(&nodes).await;

    nodes[1].mine_once().await.expect("warm-up block failed");
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| n.height() == 1))
        .await
    );

    nodes[1].crash().await.expect("crash failed");
    assert!(nodes[1].network().peer_ids().is_empty());

    // The survivors keep mining; the ring routes around the hole.
    for round in 0..3 {
        let miner = &nodes[[0, 2, 3][round % 3]];
        miner.mine_once().await.expect("survivor failed to mine");
        let target = miner.height();
        assert!(
            wait_until(Duration::from_secs(10), || {
                [0, 2, 3].iter().all(|&i| nodes[i].height() == target)
            })
            .await,
            "survivors diverged at round {round}"
        );
    }
    assert_eq!(nodes[1].height(), 1, "a crashed node must not advance");

    // Restart: redial and pull the missed suffix.
    nodes[1].restart().await.expect("restart failed");
    let tip = nodes[0].tip_hash();
    assert!(
        wait_until(Duration::from_secs(15), || nodes[1].height() == 4
            && nodes[1].tip_hash() == tip)
        .await,
        "restarted node did not catch up"
    );

    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_spend_commits_exactly_one() {
    let nodes = spawn_nodes(3).await;
    connect_mesh(&nodes).await;

    // Fund node0 with two coinbase rewards.
    for _ in 0..2 {
        nodes[0].mine_once().await.expect("funding block failed");
    }
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| n.height() == 2))
        .await
    );
    assert_eq!(nodes[0].balance_of("node0"), 100.0);

    // Two conflicting spends of the same nonce, submitted at different
    // nodes.
    let tx_a = transfer("node0", "node1", 80.0, 0.0, 0);
    let tx_b = transfer("node0", "node2", 80.0, 0.0, 0);
    let id_a = tx_a.txid.clone();
    let id_b = tx_b.txid.clone();
    nodes[0].submit_transaction(tx_a).expect("tx_a refused at node0");
    nodes[2].submit_transaction(tx_b).expect("tx_b refused at node2");

    // Every mempool holds exactly one of the pair.
    assert!(
        wait_until(Duration::from_secs(10), || nodes.iter().all(|n| {
            n.mempool_contains(&id_a) != n.mempool_contains(&id_b)
        }))
        .await,
        "some mempool holds both or neither of the conflicting pair"
    );

    // The next block settles it network-wide.
    nodes[1].mine_once().await.expect("settlement block failed");
    let tip = nodes[1].tip_hash();
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| n.height() == 3 && n.tip_hash() == tip))
        .await,
        "network did not converge after settlement"
    );

    for node in &nodes {
        let committed_a = node.chain_contains(&id_a);
        let committed_b = node.chain_contains(&id_b);
        assert!(
            committed_a != committed_b,
            "exactly one of the conflicting transactions must commit"
        );
    }
    // The loser is evicted everywhere once its nonce goes stale.
    assert!(
        wait_until(Duration::from_secs(10), || nodes
            .iter()
            .all(|n| !n.mempool_contains(&id_a) && !n.mempool_contains(&id_b)))
        .await,
        "stale double-spend lingered in a mempool"
    );

    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_mining_commits_pending_transactions() {
    let mut config = NodeConfig::new("node0", "127.0.0.1", 0);
    config.difficulty = DIFFICULTY;
    let node0 = Node::new(config);
    node0.start().await.expect("node0 failed to start");

    let mut config = NodeConfig::new("node1", "127.0.0.1", 0);
    config.difficulty = DIFFICULTY;
    config.auto_mine = true;
    let node1 = Node::new(config);
    node1.start().await.expect("node1 failed to start");

    node0
        .connect_to_peer("127.0.0.1", port_of(&node1))
        .await
        .expect("connect failed");

    node0.mine_once().await.expect("funding block failed");
    assert!(wait_until(Duration::from_secs(10), || node1.height() == 1).await);

    // The gossiped transaction flips node1's mempool to non-empty, which
    // triggers a mining round without any explicit call.
    let tx = transfer("node0", "node1", 5.0, 0.25, 0);
    let txid = tx.txid.clone();
    node0.submit_transaction(tx).expect("tx refused");

    assert!(
        wait_until(Duration::from_secs(15), || node0.chain_contains(&txid)
            && node0.height() == 2)
        .await,
        "auto-mined block never reached the submitter"
    );
    assert!(!node1.mempool_contains(&txid));

    let nodes = [node0, node1];
    shutdown(&nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_misuse_is_an_error_without_side_effects() {
    let nodes = spawn_nodes(1).await;
    let node = &nodes[0];

    assert!(matches!(
        node.start().await,
        Err(NodeError::AlreadyRunning)
    ));
    node.stop().await.expect("stop failed");
    assert!(matches!(node.stop().await, Err(NodeError::NotRunning)));
    assert!(matches!(node.crash().await, Err(NodeError::NotRunning)));

    // The ledger survived the whole dance.
    assert_eq!(node.height(), 0);
    node.restart().await.expect("restart after stop failed");
    assert_eq!(node.height(), 0);
    let _ = node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delay_injection_slows_but_does_not_lose_messages() {
    let nodes = spawn_nodes(2).await;
    nodes[0]
        .connect_to_peer("127.0.0.1", port_of(&nodes[1]))
        .await
        .expect("connect failed");

    nodes[1].network().set_delay_ms(150);
    nodes[0].mine_once().await.expect("mining failed");

    let before = Instant::now();
    assert!(
        wait_until(Duration::from_secs(10), || nodes[1].height() == 1).await,
        "delayed block never arrived"
    );
    assert!(
        before.elapsed() >= Duration::from_millis(100),
        "delay injection had no effect"
    );

    shutdown(&nodes).await;
}
