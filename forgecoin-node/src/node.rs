//! The node orchestrator: lifecycle, message routing, chain sync and
//! mining control.
//!
//! A node owns its ledger, mempool and orphan buffer; the transport owns
//! the peer table and send queues and hands decoded messages over a
//! channel. One dispatch task drains that channel, so all state
//! mutations are serialized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use forgecoin_core::constants::{DEFAULT_BLOCK_REWARD, DEFAULT_DIFFICULTY, MAX_BLOCK_TXS};
use forgecoin_core::{pow, unix_time, Block, Ledger, Mempool, MempoolError, Transaction};

use crate::transport::{GossipNetwork, Inbound, NetError};
use crate::wire::Payload;

/// Window a chain-sync request gets before the orphan is retried against
/// another peer.
pub const SYNC_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Bound on distinct parents held in the orphan buffer.
const ORPHAN_BUFFER_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is already running")]
    AlreadyRunning,
    #[error("node is not running")]
    NotRunning,
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Down,
    Starting,
    Up,
    Stopping,
}

/// Construction parameters for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    /// Listening port; 0 binds an ephemeral port.
    pub port: u16,
    pub difficulty: u32,
    pub block_reward: f64,
    /// Recipient of this node's coinbase rewards.
    pub miner_address: String,
    /// Mine automatically whenever applicable transactions are pending.
    pub auto_mine: bool,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let node_id = node_id.into();
        NodeConfig {
            miner_address: node_id.clone(),
            node_id,
            host: host.into(),
            port,
            difficulty: DEFAULT_DIFFICULTY,
            block_reward: DEFAULT_BLOCK_REWARD,
            auto_mine: false,
        }
    }
}

/// Read-only snapshot served to dashboards and tests.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub height: u64,
    pub tip_hash: String,
    pub balance: f64,
    pub mempool_size: usize,
    pub peer_ids: Vec<String>,
    pub is_mining: bool,
}

/// Blocks whose parent is not yet known, indexed by `previous_hash`.
#[derive(Debug, Default)]
struct OrphanBuffer {
    by_parent: HashMap<String, Vec<Block>>,
    arrival: Vec<String>,
}

impl OrphanBuffer {
    fn insert(&mut self, block: Block) {
        let parent = block.previous_hash.clone();
        let children = self.by_parent.entry(parent.clone()).or_insert_with(|| {
            self.arrival.push(parent.clone());
            Vec::new()
        });
        if children.iter().any(|b| b.hash == block.hash) {
            return;
        }
        children.push(block);
        if self.by_parent.len() > ORPHAN_BUFFER_CAPACITY {
            let oldest = self.arrival.remove(0);
            self.by_parent.remove(&oldest);
        }
    }

    fn take_children(&mut self, parent_hash: &str) -> Vec<Block> {
        let children = self.by_parent.remove(parent_hash).unwrap_or_default();
        if !children.is_empty() {
            self.arrival.retain(|p| p != parent_hash);
        }
        children
    }
}

/// A complete blockchain node.
pub struct Node {
    /// Self-handle for the tasks the node spawns.
    me: Weak<Node>,
    config: NodeConfig,
    ledger: Mutex<Ledger>,
    mempool: Mutex<Mempool>,
    orphans: Mutex<OrphanBuffer>,
    network: GossipNetwork,
    state: Mutex<LifecycleState>,
    mining: AtomicBool,
    mine_stop: Arc<AtomicBool>,
    miner_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let network =
            GossipNetwork::new(config.node_id.as_str(), config.host.as_str(), config.port);
        Arc::new_cyclic(|me| Node {
            me: me.clone(),
            ledger: Mutex::new(Ledger::new(config.difficulty, config.block_reward)),
            mempool: Mutex::new(Mempool::new()),
            orphans: Mutex::new(OrphanBuffer::default()),
            network,
            state: Mutex::new(LifecycleState::Down),
            mining: AtomicBool::new(false),
            mine_stop: Arc::new(AtomicBool::new(false)),
            miner_task: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network(&self) -> &GossipNetwork {
        &self.network
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    fn is_up(&self) -> bool {
        self.lifecycle() == LifecycleState::Up
    }

    /// Opens the listener, spawns the dispatch task and redials every
    /// previously known peer, asking each for anything beyond our tip.
    pub async fn start(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Down {
                return Err(NodeError::AlreadyRunning);
            }
            *state = LifecycleState::Starting;
        }
        let mut inbound = match self.network.start().await {
            Ok(rx) => rx,
            Err(e) => {
                *self.state.lock().unwrap() = LifecycleState::Down;
                return Err(e.into());
            }
        };

        if let Some(node) = self.me.upgrade() {
            tokio::spawn(async move {
                while let Some(message) = inbound.recv().await {
                    node.dispatch(message);
                }
            });
        }
        *self.state.lock().unwrap() = LifecycleState::Up;
        info!("node {} is up", self.config.node_id);

        let height = self.ledger.lock().unwrap().height();
        for (peer_id, host, port) in self.network.known_peers() {
            match self.network.connect(&host, port).await {
                Ok(id) => {
                    let _ = self
                        .network
                        .send_to(&id, Payload::GetChain { from_index: height });
                }
                Err(e) => debug!("redial of {peer_id} failed: {e}"),
            }
        }
        Ok(())
    }

    /// Graceful shutdown: preempts the miner, waits for it, then tears
    /// down the transport. Ledger and mempool stay in memory.
    pub async fn stop(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Up {
                return Err(NodeError::NotRunning);
            }
            *state = LifecycleState::Stopping;
        }
        self.mine_stop.store(true, Ordering::Relaxed);
        let task = self.miner_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.network.shutdown().await;
        *self.state.lock().unwrap() = LifecycleState::Down;
        info!("node {} stopped", self.config.node_id);
        Ok(())
    }

    /// Immediate failure: sockets closed and tasks dropped with no drain.
    /// In-memory ledger and mempool survive for the restart.
    pub async fn crash(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Up {
                return Err(NodeError::NotRunning);
            }
            *state = LifecycleState::Down;
        }
        self.mine_stop.store(true, Ordering::Relaxed);
        let task = self.miner_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
        }
        self.mining.store(false, Ordering::Relaxed);
        self.network.shutdown().await;
        warn!("node {} crashed", self.config.node_id);
        Ok(())
    }

    /// Re-enters `Starting` after a crash; redials known peers and issues
    /// `GET_CHAIN(height)` to each so the missed suffix is recovered.
    pub async fn restart(&self) -> Result<(), NodeError> {
        info!("node {} restarting", self.config.node_id);
        self.start().await
    }

    /// Dials a peer and immediately asks for anything beyond our tip.
    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<String, NodeError> {
        let peer_id = self.network.connect(host, port).await?;
        let height = self.ledger.lock().unwrap().height();
        let _ = self
            .network
            .send_to(&peer_id, Payload::GetChain { from_index: height });
        Ok(peer_id)
    }

    /// Asks every connected peer for anything beyond our tip. Used by the
    /// fault façade after healing a partition.
    pub fn sync_with_peers(&self) {
        let height = self.ledger.lock().unwrap().height();
        for peer_id in self.network.peer_ids() {
            let _ = self
                .network
                .send_to(&peer_id, Payload::GetChain { from_index: height });
        }
    }

    /// Validates a locally submitted transaction, admits it to the
    /// mempool and gossips it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), MempoolError> {
        let view = self.ledger.lock().unwrap().account_view().clone();
        self.mempool.lock().unwrap().add(tx.clone(), &view)?;
        info!("{} accepted local tx {}", self.config.node_id, tx.txid);
        self.network.broadcast(Payload::NewTx { tx });
        self.maybe_auto_mine();
        Ok(())
    }

    /// Runs a single mining round to completion, unless preempted.
    /// Returns the mined block once it has been appended and gossiped.
    pub async fn mine_once(&self) -> Option<Block> {
        if self.mining.swap(true, Ordering::SeqCst) {
            debug!("{} is already mining", self.config.node_id);
            return None;
        }
        self.mine_stop.store(false, Ordering::Relaxed);
        let mined = self.mine_round().await;
        self.mining.store(false, Ordering::SeqCst);
        mined
    }

    /// Status snapshot for the observer surface.
    pub fn status(&self) -> NodeStatus {
        let ledger = self.ledger.lock().unwrap();
        NodeStatus {
            node_id: self.config.node_id.clone(),
            height: ledger.height(),
            tip_hash: ledger.tip().hash.clone(),
            balance: ledger.balance_of(&self.config.miner_address),
            mempool_size: self.mempool.lock().unwrap().size(),
            peer_ids: self.network.peer_ids(),
            is_mining: self.mining.load(Ordering::Relaxed),
        }
    }

    /// The most recent `n` blocks, tip last.
    pub fn recent_blocks(&self, n: usize) -> Vec<Block> {
        self.ledger.lock().unwrap().recent_blocks(n)
    }

    pub fn balance_of(&self, address: &str) -> f64 {
        self.ledger.lock().unwrap().balance_of(address)
    }

    pub fn height(&self) -> u64 {
        self.ledger.lock().unwrap().height()
    }

    pub fn tip_hash(&self) -> String {
        self.ledger.lock().unwrap().tip().hash.clone()
    }

    pub fn mempool_size(&self) -> usize {
        self.mempool.lock().unwrap().size()
    }

    pub fn mempool_contains(&self, txid: &str) -> bool {
        self.mempool.lock().unwrap().contains(txid)
    }

    /// Whether a transaction is committed anywhere in the local chain.
    pub fn chain_contains(&self, txid: &str) -> bool {
        self.ledger.lock().unwrap().contains_txid(txid)
    }

    // ---- message handling ----

    fn dispatch(&self, message: Inbound) {
        if !self.is_up() {
            return;
        }
        match message.payload {
            Payload::NewTx { tx } => self.handle_new_tx(tx),
            Payload::NewBlock { block } => self.handle_new_block(&message.from_peer, block),
            Payload::GetChain { from_index } => {
                self.handle_get_chain(&message.from_peer, from_index)
            }
            Payload::ChainResponse { blocks } => {
                self.handle_chain_response(&message.from_peer, blocks)
            }
            Payload::Hello { .. } => {}
        }
    }

    fn handle_new_tx(&self, tx: Transaction) {
        let view = self.ledger.lock().unwrap().account_view().clone();
        match self.mempool.lock().unwrap().add(tx, &view) {
            Ok(()) => self.maybe_auto_mine(),
            // Validation failures are recovered locally and never echoed.
            Err(reason) => debug!("{} refused tx: {reason}", self.config.node_id),
        }
    }

    fn handle_new_block(&self, from_peer: &str, block: Block) {
        let mut ledger = self.ledger.lock().unwrap();
        let height = ledger.height();
        if block.index == height + 1 && block.previous_hash == ledger.tip().hash {
            match ledger.append(block) {
                Ok(()) => {
                    drop(ledger);
                    self.after_chain_change();
                }
                Err(reason) => {
                    warn!("{} rejected block: {reason}", self.config.node_id)
                }
            }
        } else if block.index > height + 1 {
            drop(ledger);
            debug!(
                "{} buffering orphan #{} (local height {height})",
                self.config.node_id, block.index
            );
            let target = block.index;
            self.orphans.lock().unwrap().insert(block);
            let _ = self
                .network
                .send_to(from_peer, Payload::GetChain { from_index: height });
            self.schedule_sync_retry(from_peer.to_string(), target);
        } else {
            // Same height or below: first-seen wins until a chain exchange
            // proves a strictly longer fork.
            debug!(
                "{} ignoring block #{} at or below height {height}",
                self.config.node_id, block.index
            );
        }
    }

    fn handle_get_chain(&self, from_peer: &str, from_index: u64) {
        let ledger = self.ledger.lock().unwrap();
        // A requester that is behind gets the linking suffix (with one
        // overlapping block); anyone else needs the genesis-rooted chain
        // to be able to run a replacement.
        let blocks = if from_index == 0 || from_index > ledger.height() {
            ledger.chain().to_vec()
        } else {
            ledger.blocks_from(from_index)
        };
        drop(ledger);
        let _ = self
            .network
            .send_to(from_peer, Payload::ChainResponse { blocks });
    }

    fn handle_chain_response(&self, from_peer: &str, blocks: Vec<Block>) {
        let Some(first) = blocks.first() else { return };
        if first.index == 0 {
            let mut ledger = self.ledger.lock().unwrap();
            match ledger.replace_chain(blocks) {
                Ok(displaced) => {
                    let view = ledger.account_view().clone();
                    drop(ledger);
                    let mut mempool = self.mempool.lock().unwrap();
                    mempool.reapply(displaced, &view);
                    drop(mempool);
                    self.after_chain_change();
                }
                Err(reason) => {
                    debug!("{} kept current chain: {reason}", self.config.node_id)
                }
            }
            return;
        }

        let mut appended = false;
        let lagging = {
            let mut ledger = self.ledger.lock().unwrap();
            for block in blocks.iter() {
                if block.index == ledger.height() + 1
                    && block.previous_hash == ledger.tip().hash
                {
                    match ledger.append(block.clone()) {
                        Ok(()) => appended = true,
                        Err(reason) => {
                            debug!("{} stopped applying suffix: {reason}", self.config.node_id);
                            break;
                        }
                    }
                }
            }
            blocks.last().map(|b| b.index).unwrap_or(0) > ledger.height()
        };
        if appended {
            self.after_chain_change();
        } else if lagging {
            // Divergent suffix from a taller peer; fetch the whole chain.
            let _ = self
                .network
                .send_to(from_peer, Payload::GetChain { from_index: 0 });
        }
    }

    /// Housekeeping after every successful append or replacement:
    /// preempt the miner, evict committed and stale mempool entries,
    /// reattach orphans and keep auto-mining going.
    fn after_chain_change(&self) {
        self.mine_stop.store(true, Ordering::Relaxed);

        let view = self.ledger.lock().unwrap().account_view().clone();
        self.mempool.lock().unwrap().prune(&view);

        loop {
            let tip_hash = self.ledger.lock().unwrap().tip().hash.clone();
            let children = self.orphans.lock().unwrap().take_children(&tip_hash);
            if children.is_empty() {
                break;
            }
            let mut attached = false;
            for child in children {
                let mut ledger = self.ledger.lock().unwrap();
                let is_next = child.index == ledger.height() + 1
                    && child.previous_hash == ledger.tip().hash;
                if is_next && ledger.append(child).is_ok() {
                    attached = true;
                }
            }
            if !attached {
                break;
            }
            let view = self.ledger.lock().unwrap().account_view().clone();
            self.mempool.lock().unwrap().prune(&view);
        }

        self.maybe_auto_mine();
    }

    /// Kicks off a background mining round when auto-mining is on and
    /// work is pending.
    fn maybe_auto_mine(&self) {
        if !self.config.auto_mine || !self.is_up() {
            return;
        }
        if self.mempool.lock().unwrap().is_empty() {
            return;
        }
        if self.mining.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(node) = self.me.upgrade() else {
            self.mining.store(false, Ordering::SeqCst);
            return;
        };
        self.mine_stop.store(false, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            let _ = node.mine_round().await;
            node.mining.store(false, Ordering::SeqCst);
            // More work may have arrived while we were searching.
            node.maybe_auto_mine();
        });
        *self.miner_task.lock().unwrap() = Some(task);
    }

    /// One full mining round: assemble a candidate, search for a nonce,
    /// then append and gossip the result if the chain has not moved.
    async fn mine_round(&self) -> Option<Block> {
        let mut block = {
            let ledger = self.ledger.lock().unwrap();
            let transactions = self
                .mempool
                .lock()
                .unwrap()
                .take(MAX_BLOCK_TXS, ledger.account_view());
            pow::create_block(
                ledger.height() + 1,
                transactions,
                ledger.tip().hash.clone(),
                &self.config.miner_address,
                ledger.difficulty(),
                ledger.block_reward(),
                unix_time(),
            )
        };
        info!(
            "{} mining block #{} with {} txs",
            self.config.node_id,
            block.index,
            block.transactions.len() - 1
        );
        if !pow::mine_block(&mut block, &self.mine_stop).await {
            debug!("{} abandoned block #{}", self.config.node_id, block.index);
            return None;
        }

        let appended = {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.height() + 1 != block.index {
                debug!(
                    "{} discarding stale block #{}",
                    self.config.node_id, block.index
                );
                false
            } else {
                match ledger.append(block.clone()) {
                    Ok(()) => true,
                    Err(reason) => {
                        warn!(
                            "{} could not append own block: {reason}",
                            self.config.node_id
                        );
                        false
                    }
                }
            }
        };
        if !appended {
            return None;
        }

        let view = self.ledger.lock().unwrap().account_view().clone();
        self.mempool.lock().unwrap().prune(&view);
        self.network.broadcast(Payload::NewBlock {
            block: block.clone(),
        });
        Some(block)
    }

    /// If the chain has not reached `target_index` within the response
    /// window, retry the sync against some other peer.
    fn schedule_sync_retry(&self, asked_peer: String, target_index: u64) {
        let Some(node) = self.me.upgrade() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(SYNC_RETRY_WINDOW).await;
            if !node.is_up() {
                return;
            }
            let height = node.ledger.lock().unwrap().height();
            if height >= target_index {
                return;
            }
            let peers = node.network.peer_ids();
            let fallback = peers
                .iter()
                .find(|p| **p != asked_peer)
                .or_else(|| peers.first());
            if let Some(peer) = fallback {
                debug!("{} retrying chain sync via {peer}", node.config.node_id);
                let _ = node
                    .network
                    .send_to(peer, Payload::GetChain { from_index: height });
            }
        });
    }
}
