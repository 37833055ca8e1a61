//! Gossip transport over TCP.
//!
//! Each connection exchanges a HELLO handshake, then carries
//! length-prefixed JSON frames. Inbound frames run through the fault
//! hooks (drop, delay) and the orchestrator queue; flooded kinds
//! (NEW_TX, NEW_BLOCK) additionally pass the LRU seen-set and fan out
//! to every peer except the one they arrived on, while chain-sync
//! traffic stays point-to-point. Each peer has a bounded outbound queue
//! drained by its own writer task, so one slow peer never stalls the
//! rest.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use lru::LruCache;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

use forgecoin_core::unix_time;

use crate::wire::{self, Frame, Payload, WireError};

/// Bound on the duplicate-suppression set.
pub const SEEN_CACHE_CAPACITY: usize = 10_000;

/// Bound on each peer's outbound queue.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Deadline for outbound connects and for the HELLO exchange.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot of one entry of the live peer table.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub host: String,
    pub listen_port: u16,
    /// Seconds since epoch of the last frame from this peer.
    pub last_seen: f64,
}

/// A message handed from the transport to the orchestrator.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Peer the frame arrived on (the immediate sender, not the origin).
    pub from_peer: String,
    /// Node that originated the message.
    pub origin_id: String,
    pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("peer did not complete the HELLO handshake")]
    BadHandshake,
    #[error("transport is already running")]
    AlreadyRunning,
    #[error("transport is not running")]
    NotRunning,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

/// Bounded per-peer outbound queue. Overflow policy by kind: NEW_TX
/// displaces the oldest pending NEW_TX, CHAIN_RESPONSE drops the new
/// message (a re-request is cheap), anything else displaces the oldest
/// entry.
#[derive(Default)]
struct SendQueue {
    frames: Mutex<VecDeque<Frame>>,
    notify: Notify,
}

impl SendQueue {
    fn push(&self, frame: Frame) {
        {
            let mut frames = self.frames.lock().unwrap();
            if frames.len() >= SEND_QUEUE_CAPACITY {
                match frame.payload {
                    Payload::NewTx { .. } => {
                        let oldest_tx = frames
                            .iter()
                            .position(|f| matches!(f.payload, Payload::NewTx { .. }));
                        match oldest_tx {
                            Some(i) => {
                                frames.remove(i);
                            }
                            None => {
                                frames.pop_front();
                            }
                        }
                    }
                    Payload::ChainResponse { .. } => return,
                    _ => {
                        frames.pop_front();
                    }
                }
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Frame> {
        self.frames.lock().unwrap().pop_front()
    }
}

struct Peer {
    /// Distinguishes connections so a stale task cannot evict a successor.
    conn_id: u64,
    addr: (String, u16),
    queue: Arc<SendQueue>,
    last_seen: f64,
}

/// Handles live only while the transport is started.
struct Running {
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: broadcast::Sender<()>,
    listener_task: tokio::task::JoinHandle<()>,
    port: u16,
}

struct NetInner {
    node_id: String,
    host: String,
    requested_port: u16,
    peers: Mutex<HashMap<String, Peer>>,
    /// Every peer address ever learned; survives crash/restart for redial.
    known: Mutex<HashMap<String, (String, u16)>>,
    seen: Mutex<LruCache<String, ()>>,
    drop_probability: Mutex<f64>,
    link_drops: Mutex<HashMap<String, f64>>,
    delay_ms: AtomicU64,
    next_conn_id: AtomicU64,
    running: Mutex<Option<Running>>,
}

/// The node's gossip endpoint. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct GossipNetwork {
    inner: Arc<NetInner>,
}

impl GossipNetwork {
    /// Builds a stopped transport. `port` 0 binds an ephemeral port.
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        GossipNetwork {
            inner: Arc::new(NetInner {
                node_id: node_id.into(),
                host: host.into(),
                requested_port: port,
                peers: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
                seen: Mutex::new(LruCache::new(
                    NonZeroUsize::new(SEEN_CACHE_CAPACITY).unwrap(),
                )),
                drop_probability: Mutex::new(0.0),
                link_drops: Mutex::new(HashMap::new()),
                delay_ms: AtomicU64::new(0),
                next_conn_id: AtomicU64::new(0),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Binds the listener and starts accepting peers. Returns the channel
    /// of inbound messages for the orchestrator. The seen-set is reset so
    /// a restarted node does not suppress post-restart traffic.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<Inbound>, NetError> {
        if self.inner.running.lock().unwrap().is_some() {
            return Err(NetError::AlreadyRunning);
        }
        let listener =
            TcpListener::bind((self.inner.host.as_str(), self.inner.requested_port)).await?;
        let port = listener.local_addr()?.port();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        self.inner.seen.lock().unwrap().clear();

        let inner = Arc::clone(&self.inner);
        let accept_inbound = inbound_tx.clone();
        let accept_shutdown = shutdown_tx.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let inner = Arc::clone(&inner);
                        let inbound = accept_inbound.clone();
                        let shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                accept_handshake(inner, stream, addr.ip().to_string(), inbound, shutdown)
                                    .await
                            {
                                debug!("inbound handshake failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }
        });

        *self.inner.running.lock().unwrap() = Some(Running {
            inbound: inbound_tx,
            shutdown: shutdown_tx,
            listener_task,
            port,
        });
        info!("{} listening on {}:{}", self.inner.node_id, self.inner.host, port);
        Ok(inbound_rx)
    }

    /// Actual listening port, once started.
    pub fn listen_port(&self) -> Option<u16> {
        self.inner.running.lock().unwrap().as_ref().map(|r| r.port)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().unwrap().is_some()
    }

    /// Tears down the listener and every peer session. Fault settings and
    /// the known-peer table survive for the next start.
    pub async fn shutdown(&self) {
        let running = self.inner.running.lock().unwrap().take();
        let Some(running) = running else { return };
        let _ = running.shutdown.send(());
        running.listener_task.abort();
        self.inner.peers.lock().unwrap().clear();
        info!("{} transport stopped", self.inner.node_id);
    }

    /// Dials a peer, performs the HELLO exchange and registers the session.
    /// Returns the peer's id.
    pub async fn connect(&self, host: &str, port: u16) -> Result<String, NetError> {
        let (inbound, shutdown) = {
            let running = self.inner.running.lock().unwrap();
            let running = running.as_ref().ok_or(NetError::NotRunning)?;
            (running.inbound.clone(), running.shutdown.clone())
        };
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| NetError::ConnectTimeout)??;

        let listen_port = self.listen_port().ok_or(NetError::NotRunning)?;
        let hello = Frame {
            payload: Payload::Hello {
                peer_id: self.inner.node_id.clone(),
                listen_port,
            },
            origin_id: self.inner.node_id.clone(),
        };
        wire::write_frame(&mut stream, &hello).await?;
        let reply = timeout(CONNECT_TIMEOUT, wire::read_frame(&mut stream))
            .await
            .map_err(|_| NetError::ConnectTimeout)??;
        let Payload::Hello { peer_id, .. } = reply.payload else {
            return Err(NetError::BadHandshake);
        };

        register_peer(
            &self.inner,
            peer_id.clone(),
            (host.to_string(), port),
            stream,
            inbound,
            shutdown,
        );
        info!("{} connected to peer {peer_id} at {host}:{port}", self.inner.node_id);
        Ok(peer_id)
    }

    /// Sends to every connected peer, marking the digest as seen so the
    /// network does not echo our own message back into the orchestrator.
    pub fn broadcast(&self, payload: Payload) {
        self.note_seen(&payload);
        let frame = Frame {
            payload,
            origin_id: self.inner.node_id.clone(),
        };
        fan_out(&self.inner, &frame, None);
    }

    /// Sends to a single peer. Unlike `broadcast`, nothing is marked in
    /// the seen-set: directed messages do not echo back.
    pub fn send_to(&self, peer_id: &str, payload: Payload) -> Result<(), NetError> {
        let frame = Frame {
            payload,
            origin_id: self.inner.node_id.clone(),
        };
        let peers = self.inner.peers.lock().unwrap();
        let peer = peers
            .get(peer_id)
            .ok_or_else(|| NetError::UnknownPeer(peer_id.to_string()))?;
        peer.queue.push(frame);
        Ok(())
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.peers.lock().unwrap().keys().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().unwrap().len()
    }

    /// Snapshot of the live peer table.
    pub fn peer_info(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, peer)| PeerInfo {
                peer_id: id.clone(),
                host: peer.addr.0.clone(),
                listen_port: peer.addr.1,
                last_seen: peer.last_seen,
            })
            .collect()
    }

    /// Every `(peer_id, host, listen_port)` this transport has ever
    /// learned, for redial after a restart.
    pub fn known_peers(&self) -> Vec<(String, String, u16)> {
        self.inner
            .known
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (host, port))| (id.clone(), host.clone(), *port))
            .collect()
    }

    /// Fault hook: probability in `[0, 1]` of dropping each inbound frame.
    pub fn set_drop_probability(&self, p: f64) {
        *self.inner.drop_probability.lock().unwrap() = p.clamp(0.0, 1.0);
    }

    /// Fault hook: per-peer drop probability, layered over the node-wide
    /// one. The partition façade installs these on boundary-crossing links.
    pub fn set_link_drop(&self, peer_id: &str, p: f64) {
        if p <= 0.0 {
            self.inner.link_drops.lock().unwrap().remove(peer_id);
        } else {
            self.inner
                .link_drops
                .lock()
                .unwrap()
                .insert(peer_id.to_string(), p.clamp(0.0, 1.0));
        }
    }

    pub fn clear_link_drops(&self) {
        self.inner.link_drops.lock().unwrap().clear();
    }

    /// Fault hook: fixed delay applied to each inbound frame.
    pub fn set_delay_ms(&self, ms: u64) {
        self.inner.delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Marks a payload as seen; returns `true` if it was already known.
    fn note_seen(&self, payload: &Payload) -> bool {
        self.inner
            .seen
            .lock()
            .unwrap()
            .put(payload.digest(), ())
            .is_some()
    }
}

/// Registers a peer session and spawns its reader and writer tasks.
/// An existing session under the same id is replaced.
fn register_peer(
    inner: &Arc<NetInner>,
    peer_id: String,
    addr: (String, u16),
    stream: TcpStream,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: broadcast::Sender<()>,
) {
    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let queue = Arc::new(SendQueue::default());
    let (read_half, write_half) = stream.into_split();

    inner.peers.lock().unwrap().insert(
        peer_id.clone(),
        Peer {
            conn_id,
            addr: addr.clone(),
            queue: Arc::clone(&queue),
            last_seen: unix_time(),
        },
    );
    inner.known.lock().unwrap().insert(peer_id.clone(), addr);

    tokio::spawn(run_reader(
        Arc::clone(inner),
        peer_id.clone(),
        conn_id,
        read_half,
        inbound,
        shutdown.subscribe(),
    ));
    tokio::spawn(run_writer(
        Arc::clone(inner),
        peer_id,
        conn_id,
        queue,
        write_half,
        shutdown.subscribe(),
    ));
}

/// Completes the server side of the HELLO exchange.
async fn accept_handshake(
    inner: Arc<NetInner>,
    mut stream: TcpStream,
    peer_host: String,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: broadcast::Sender<()>,
) -> Result<(), NetError> {
    let first = timeout(CONNECT_TIMEOUT, wire::read_frame(&mut stream))
        .await
        .map_err(|_| NetError::ConnectTimeout)??;
    let Payload::Hello { peer_id, listen_port } = first.payload else {
        return Err(NetError::BadHandshake);
    };

    let our_port = inner
        .running
        .lock()
        .unwrap()
        .as_ref()
        .map(|r| r.port)
        .ok_or(NetError::NotRunning)?;
    let reply = Frame {
        payload: Payload::Hello {
            peer_id: inner.node_id.clone(),
            listen_port: our_port,
        },
        origin_id: inner.node_id.clone(),
    };
    wire::write_frame(&mut stream, &reply).await?;

    info!("{} accepted peer {peer_id} from {peer_host}", inner.node_id);
    register_peer(
        &inner,
        peer_id,
        (peer_host, listen_port),
        stream,
        inbound,
        shutdown,
    );
    Ok(())
}

/// Queues a frame to every peer except `exclude`.
fn fan_out(inner: &Arc<NetInner>, frame: &Frame, exclude: Option<&str>) {
    let peers = inner.peers.lock().unwrap();
    for (peer_id, peer) in peers.iter() {
        if Some(peer_id.as_str()) == exclude {
            continue;
        }
        peer.queue.push(frame.clone());
    }
}

async fn run_reader(
    inner: Arc<NetInner>,
    peer_id: String,
    conn_id: u64,
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Inbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            frame = wire::read_frame(&mut reader) => match frame {
                Ok(frame) => process_inbound(&inner, &peer_id, frame, &inbound).await,
                Err(WireError::Io(e)) => {
                    debug!("read from {peer_id} failed: {e}");
                    break;
                }
                Err(e) => {
                    // Malformed, unknown or oversize frame: protocol error,
                    // close the connection.
                    warn!("protocol error from {peer_id}: {e}");
                    break;
                }
            }
        }
    }
    remove_peer(&inner, &peer_id, conn_id);
}

/// The inbound pipeline: drop, delay, dedup, dispatch, re-gossip.
async fn process_inbound(
    inner: &Arc<NetInner>,
    from_peer: &str,
    frame: Frame,
    inbound: &mpsc::UnboundedSender<Inbound>,
) {
    if let Some(peer) = inner.peers.lock().unwrap().get_mut(from_peer) {
        peer.last_seen = unix_time();
    }
    // HELLO is handshake-only; it never travels the gossip pipeline.
    if matches!(frame.payload, Payload::Hello { .. }) {
        return;
    }

    let drop_p = {
        let global = *inner.drop_probability.lock().unwrap();
        let link = inner
            .link_drops
            .lock()
            .unwrap()
            .get(from_peer)
            .copied()
            .unwrap_or(0.0);
        global.max(link)
    };
    if drop_p > 0.0 && rand::random::<f64>() < drop_p {
        debug!("{} dropped a {} from {from_peer}", inner.node_id, frame.payload.kind());
        return;
    }

    let delay = inner.delay_ms.load(Ordering::Relaxed);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    // Flooded kinds run through the seen-set and fan back out; chain-sync
    // requests and responses are point-to-point and idempotent, so a
    // repeat must reach the orchestrator instead of being swallowed.
    let flooded = matches!(
        frame.payload,
        Payload::NewTx { .. } | Payload::NewBlock { .. }
    );
    if flooded {
        let duplicate = inner
            .seen
            .lock()
            .unwrap()
            .put(frame.payload.digest(), ())
            .is_some();
        if duplicate {
            return;
        }
    }

    let _ = inbound.send(Inbound {
        from_peer: from_peer.to_string(),
        origin_id: frame.origin_id.clone(),
        payload: frame.payload.clone(),
    });

    if flooded {
        fan_out(inner, &frame, Some(from_peer));
    }
}

async fn run_writer(
    inner: Arc<NetInner>,
    peer_id: String,
    conn_id: u64,
    queue: Arc<SendQueue>,
    mut writer: OwnedWriteHalf,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        match queue.pop() {
            Some(frame) => {
                if let Err(e) = wire::write_frame(&mut writer, &frame).await {
                    debug!("write to {peer_id} failed: {e}");
                    break;
                }
            }
            None => {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = queue.notify.notified() => {}
                }
            }
        }
    }
    remove_peer(&inner, &peer_id, conn_id);
}

/// Evicts a peer record, but only for the connection that owned it.
fn remove_peer(inner: &Arc<NetInner>, peer_id: &str, conn_id: u64) {
    let mut peers = inner.peers.lock().unwrap();
    if peers.get(peer_id).is_some_and(|p| p.conn_id == conn_id) {
        peers.remove(peer_id);
        info!("{} lost peer {peer_id}", inner.node_id);
    }
}
