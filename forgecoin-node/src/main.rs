//! Demo driver: an in-process network of nodes that mines starter funds,
//! gossips transactions and converges on one chain.

use clap::Parser;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::sync::Arc;
use std::time::Duration;

use forgecoin_core::{unix_time, Transaction};
use forgecoin_node::{Node, NodeConfig};

/// Forge Coin network demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the ring
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Transactions submitted from the first node
    #[arg(long, default_value_t = 3)]
    transactions: usize,

    /// Bootstrap mining rounds per node
    #[arg(long, default_value_t = 2)]
    mining_rounds: usize,

    /// Leading hex zeros required of block hashes
    #[arg(long, default_value_t = 2)]
    difficulty: u32,

    /// Set logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    Builder::new()
        .filter_level(args.log_level)
        .target(Target::Stdout)
        .init();

    if args.nodes < 2 {
        return Err("the demo needs at least two nodes".into());
    }

    // Create and start the nodes on ephemeral ports.
    let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let mut config = NodeConfig::new(format!("node{i}"), "127.0.0.1", 0);
        config.difficulty = args.difficulty;
        let node = Node::new(config);
        node.start().await?;
        nodes.push(node);
    }

    // Ring topology.
    for i in 0..nodes.len() {
        let next = &nodes[(i + 1) % nodes.len()];
        let port = next
            .network()
            .listen_port()
            .ok_or("peer listener is not up")?;
        nodes[i].connect_to_peer("127.0.0.1", port).await?;
    }
    println!("network of {} nodes established", nodes.len());

    // Bootstrap the economy: every node mines empty blocks for coinbase
    // rewards.
    for round in 0..args.mining_rounds {
        for node in &nodes {
            if node.mine_once().await.is_some() {
                println!(
                    "round {}: {} mined block #{}",
                    round + 1,
                    node.node_id(),
                    node.height()
                );
            }
            wait_for_height(&nodes, Duration::from_secs(10)).await?;
        }
    }

    // Gossip transactions from node0 to its neighbours.
    let sender = nodes[0].node_id().to_string();
    for n in 0..args.transactions {
        let receiver = nodes[(n % (nodes.len() - 1)) + 1].node_id().to_string();
        let nonce = n as u64;
        let mut tx =
            Transaction::new(sender.clone(), receiver.clone(), 1.0, 0.1, nonce, unix_time());
        tx.sign(&sender);
        match nodes[0].submit_transaction(tx) {
            Ok(()) => println!("submitted tx {n}: {sender} -> {receiver}"),
            Err(reason) => println!("tx {n} refused: {reason}"),
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // One more block commits them.
    nodes[1].mine_once().await;
    wait_for_height(&nodes, Duration::from_secs(10)).await?;

    println!("\nfinal state:");
    for node in &nodes {
        let status = node.status();
        println!(
            "  {}: height={} balance={:.1} mempool={} peers={}",
            status.node_id,
            status.height,
            status.balance,
            status.mempool_size,
            status.peer_ids.len()
        );
    }

    for node in &nodes {
        node.stop().await?;
    }
    println!("clean shutdown");
    Ok(())
}

/// Waits until every node reports the same height and tip.
async fn wait_for_height(
    nodes: &[Arc<Node>],
    deadline: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = std::time::Instant::now();
    loop {
        let tip = nodes[0].tip_hash();
        if nodes.iter().all(|n| n.tip_hash() == tip) {
            return Ok(());
        }
        if start.elapsed() > deadline {
            return Err("nodes failed to converge".into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
