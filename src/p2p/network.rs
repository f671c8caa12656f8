//! TCP transport: listener, per-peer connections and maintenance loops
//!
//! Every connection starts with a handshake in both directions. Afterwards
//! one task reads lines from the peer while any task may write through the
//! peer's writer mutex.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::identity::ChainIdentity;
use super::peer::{PeerManager, PeerStore, MAX_KNOWN_PEERS};
use super::protocol::*;
use super::sync::{BusyBackoff, ForkWalk, SyncState, WalkStep};
use super::{NodeHandler, PeerError};
use crate::config::NodeConfig;
use crate::consensus::Block;
use crate::constants::MAX_BLOCKS_PER_BATCH;
use crate::crypto::Hash;
use crate::metrics::Metrics;
use crate::node::BlockBroadcaster;

/// Pause before serving each range so RPC keeps its share of the lock
const SERVE_DELAY: Duration = Duration::from_millis(5);

/// Re-sends of an unanswered range request before the peer is left alone
const MAX_RANGE_RETRIES: u32 = 3;

/// Network settings
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_addr: SocketAddr,
    pub node_name: String,
    pub identity: ChainIdentity,
    /// Peers dialled at startup
    pub bootstrap: Vec<String>,
    pub ibd_max_concurrent: usize,
    pub max_known_peers: usize,
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
    pub redial_interval: Duration,
    pub gossip_interval: Duration,
    pub handshake_timeout: Duration,
    /// Wait for a `BlocksBatch` before re-sending the request
    pub range_timeout: Duration,
    /// Disconnected peers unseen this long are forgotten
    pub stale_peer_timeout: Duration,
}

impl NetworkConfig {
    pub fn new(listen_addr: SocketAddr, identity: ChainIdentity) -> Self {
        Self {
            listen_addr,
            node_name: "archivas-node".to_string(),
            identity,
            bootstrap: Vec::new(),
            ibd_max_concurrent: 4,
            max_known_peers: MAX_KNOWN_PEERS,
            ping_interval: Duration::from_secs(15),
            peer_timeout: Duration::from_secs(45),
            redial_interval: Duration::from_secs(10),
            gossip_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            range_timeout: Duration::from_secs(30),
            stale_peer_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_node_config(config: &NodeConfig) -> Self {
        let mut bootstrap = config.peers.clone();
        if bootstrap.is_empty() {
            bootstrap.extend(config.network.default_seeds.iter().map(|s| s.to_string()));
        }
        Self {
            node_name: config.node_name.clone(),
            bootstrap,
            ibd_max_concurrent: config.ibd_max_concurrent,
            ping_interval: config.ping_interval,
            peer_timeout: config.peer_timeout,
            ..Self::new(config.p2p_addr, ChainIdentity::from_config(config))
        }
    }
}

/// Connected peer as reported on `/peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub addr: String,
    pub node_name: String,
    pub height: u64,
    pub outbound: bool,
}

/// Outstanding `RequestBlocks` to one peer
#[derive(Debug, Clone, Copy)]
struct PendingRange {
    from_height: u64,
    sent_at: Instant,
    retries: u32,
}

struct PeerConn {
    addr: String,
    node_name: String,
    outbound: bool,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    last_pong: Mutex<Instant>,
    height: AtomicU64,
    /// A range request chain is running against this peer
    syncing: AtomicBool,
    pending_range: Mutex<Option<PendingRange>>,
    backoff: Mutex<BusyBackoff>,
    closed: Notify,
}

impl PeerConn {
    fn new(addr: String, node_name: String, outbound: bool, writer: OwnedWriteHalf) -> Self {
        Self {
            addr,
            node_name,
            outbound,
            writer: tokio::sync::Mutex::new(writer),
            last_pong: Mutex::new(Instant::now()),
            height: AtomicU64::new(0),
            syncing: AtomicBool::new(false),
            pending_range: Mutex::new(None),
            backoff: Mutex::new(BusyBackoff::default()),
            closed: Notify::new(),
        }
    }

    async fn send(&self, msg: &Message) -> Result<(), PeerError> {
        let line = msg.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        Ok(())
    }

    fn observe_height(&self, height: u64) {
        self.height.fetch_max(height, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.notify_one();
    }

    fn summary(&self) -> PeerSummary {
        PeerSummary {
            addr: self.addr.clone(),
            node_name: self.node_name.clone(),
            height: self.height.load(Ordering::Relaxed),
            outbound: self.outbound,
        }
    }
}

/// Read one newline-terminated line of at most `limit` bytes
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> Result<(), PeerError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader).take(limit as u64 + 1).read_until(b'\n', buf).await?;
    if n == 0 {
        return Err(PeerError::Closed);
    }
    if buf.len() > limit {
        return Err(PeerError::LineTooLong(limit));
    }
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

struct Inner {
    config: NetworkConfig,
    handler: Arc<dyn NodeHandler>,
    metrics: Arc<Metrics>,
    store: Option<PeerStore>,
    conns: RwLock<HashMap<String, Arc<PeerConn>>>,
    manager: Mutex<PeerManager>,
    sync: Mutex<SyncState>,
    walks: Mutex<HashMap<String, ForkWalk>>,
    inflight: AtomicUsize,
    nonce: AtomicU64,
}

/// Handle to the P2P layer; cheap to clone
#[derive(Clone)]
pub struct Network {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("listen_addr", &self.inner.config.listen_addr)
            .finish()
    }
}

impl Network {
    pub fn new(
        config: NetworkConfig,
        handler: Arc<dyn NodeHandler>,
        metrics: Arc<Metrics>,
        store: Option<PeerStore>,
    ) -> Self {
        let mut manager = PeerManager::new(config.max_known_peers);
        manager.add_peers(config.bootstrap.iter().map(String::as_str));
        if let Some(store) = &store {
            let stored = store.load();
            let added = manager.add_peers(stored.iter().map(|r| r.addr.as_str()));
            if added > 0 {
                info!("[p2p] loaded {} peers from store", added);
            }
        }
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                metrics,
                store,
                conns: RwLock::new(HashMap::new()),
                manager: Mutex::new(manager),
                sync: Mutex::new(SyncState::new()),
                walks: Mutex::new(HashMap::new()),
                inflight: AtomicUsize::new(0),
                nonce: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the listener, dial known peers and start maintenance
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr, PeerError> {
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let local = listener.local_addr()?;
        self.inner.manager.lock().set_local(local.to_string());
        info!("[p2p] listening on {}", local);

        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().maintenance());
        self.redial().await;
        Ok(local)
    }

    /// Dial `addr` and complete the handshake
    pub async fn connect(&self, addr: &str) -> Result<(), PeerError> {
        if self.inner.manager.lock().is_banned(addr) {
            return Err(PeerError::InvalidHandshake(format!("{} is banned", addr)));
        }
        if self.inner.conns.read().await.contains_key(addr) {
            return Ok(());
        }
        {
            let mut manager = self.inner.manager.lock();
            manager.add_peer(addr);
            manager.peer_connecting(addr);
        }

        let dial = tokio::time::timeout(self.inner.config.handshake_timeout, TcpStream::connect(addr)).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.inner.manager.lock().connection_failed(addr);
                return Err(e.into());
            }
            Err(_) => {
                self.inner.manager.lock().connection_failed(addr);
                return Err(PeerError::Timeout);
            }
        };

        let (conn, reader) = match self.handshake(stream, addr.to_string(), true).await {
            Ok(v) => v,
            Err(e) => {
                let banned = self.inner.manager.lock().is_banned(addr);
                if !banned {
                    self.inner.manager.lock().connection_failed(addr);
                }
                return Err(e);
            }
        };
        if let Some(store) = &self.inner.store {
            store.save(addr, unix_now());
        }
        tokio::spawn(self.clone().read_loop(conn, reader));
        Ok(())
    }

    pub async fn peer_summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self.inner.conns.read().await.values().map(|c| c.summary()).collect();
        out.sort_by(|a, b| a.addr.cmp(&b.addr));
        out
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.inner.manager.lock().known_addrs()
    }

    pub fn is_banned(&self, addr: &str) -> bool {
        self.inner.manager.lock().is_banned(addr)
    }

    /// Ask every peer for its tip; peers ahead of us get a range request
    pub async fn request_status(&self) {
        for conn in self.connections().await {
            if let Err(e) = conn.send(&Message::GetStatus).await {
                debug!("[p2p] status request to {} failed: {}", conn.addr, e);
            }
        }
    }

    /// Announce a block to every peer except `except`
    pub async fn relay(&self, height: u64, hash: Hash, except: &str) {
        let msg = Message::NewBlock(NewBlockPayload { height, hash });
        for conn in self.connections().await {
            if conn.addr == except {
                continue;
            }
            if let Err(e) = conn.send(&msg).await {
                debug!("[p2p] announce to {} failed: {}", conn.addr, e);
                conn.close();
            }
        }
    }

    async fn connections(&self) -> Vec<Arc<PeerConn>> {
        self.inner.conns.read().await.values().cloned().collect()
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let addr = remote.to_string();
                    if self.is_banned(&addr) {
                        debug!("[p2p] refusing banned {}", addr);
                        continue;
                    }
                    let net = self.clone();
                    tokio::spawn(async move {
                        match net.handshake(stream, addr.clone(), false).await {
                            Ok((conn, reader)) => net.read_loop(conn, reader).await,
                            Err(e) => debug!("[p2p] inbound {} dropped: {}", addr, e),
                        }
                    });
                }
                Err(e) => {
                    warn!("[p2p] accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        addr: String,
        outbound: bool,
    ) -> Result<(Arc<PeerConn>, BufReader<OwnedReadHalf>), PeerError> {
        let config = &self.inner.config;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let ours = Message::Handshake(config.identity.handshake(&config.node_name));
        write.write_all(&ours.encode()?).await?;

        let mut line = Vec::new();
        tokio::time::timeout(config.handshake_timeout, read_line(&mut reader, &mut line, MAX_LINE_BYTES))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let theirs = match Message::decode(&line)? {
            Message::Handshake(h) => h,
            other => {
                return Err(PeerError::InvalidHandshake(format!(
                    "expected handshake, got {}",
                    other.command()
                )))
            }
        };
        if let Err(e) = config.identity.check(&theirs) {
            warn!("[p2p] rejecting {} ({}): {}", addr, theirs.node_name, e);
            self.inner.manager.lock().ban_peer(&addr, &e.to_string());
            return Err(e);
        }

        let conn = Arc::new(PeerConn::new(addr.clone(), theirs.node_name.clone(), outbound, write));
        {
            let mut conns = self.inner.conns.write().await;
            if let Some(old) = conns.insert(addr.clone(), conn.clone()) {
                old.close();
            }
            self.inner.metrics.peers.set(conns.len() as u64);
        }
        if outbound {
            self.inner.manager.lock().peer_connected(&addr, &theirs.node_name);
        }
        info!(
            "[p2p] connected {} name={} version={}",
            addr, theirs.node_name, theirs.node_version
        );
        conn.send(&Message::GetStatus).await?;
        Ok((conn, reader))
    }

    async fn read_loop(self, conn: Arc<PeerConn>, mut reader: BufReader<OwnedReadHalf>) {
        let mut line = Vec::new();
        loop {
            let read = tokio::select! {
                r = read_line(&mut reader, &mut line, MAX_LINE_BYTES) => r,
                _ = conn.closed.notified() => break,
            };
            match read {
                Ok(()) => match Message::decode(&line) {
                    Ok(msg) => {
                        let command = msg.command();
                        if let Err(e) = self.handle(&conn, msg).await {
                            if matches!(e, PeerError::Io(_)) {
                                warn!("[p2p] write to {} failed: {}", conn.addr, e);
                                break;
                            }
                            debug!("[p2p] {} from {}: {}", command, conn.addr, e);
                        }
                    }
                    Err(e) => warn!("[p2p] dropping message from {}: {}", conn.addr, e),
                },
                Err(PeerError::Closed) => break,
                Err(e) => {
                    warn!("[p2p] closing {}: {}", conn.addr, e);
                    break;
                }
            }
        }
        self.disconnect(&conn).await;
    }

    async fn disconnect(&self, conn: &Arc<PeerConn>) {
        {
            let mut conns = self.inner.conns.write().await;
            if conns.get(&conn.addr).map_or(false, |c| Arc::ptr_eq(c, conn)) {
                conns.remove(&conn.addr);
            }
            self.inner.metrics.peers.set(conns.len() as u64);
        }
        self.inner.manager.lock().peer_disconnected(&conn.addr);
        self.inner.walks.lock().remove(&conn.addr);
        let _ = conn.writer.lock().await.shutdown().await;
        info!("[p2p] disconnected {}", conn.addr);
    }

    async fn handle(&self, conn: &Arc<PeerConn>, msg: Message) -> Result<(), PeerError> {
        match msg {
            Message::Handshake(_) => Err(PeerError::Protocol("duplicate handshake".into())),
            Message::Ping(p) => conn.send(&Message::Pong(p)).await,
            Message::Pong(_) => {
                *conn.last_pong.lock() = Instant::now();
                Ok(())
            }
            Message::NewBlock(p) => self.on_new_block(conn, p).await,
            Message::GetBlock(p) => match self.inner.handler.block_at(p.height) {
                Some(block) => {
                    conn.send(&Message::BlockData(BlockDataPayload {
                        height: p.height,
                        block,
                    }))
                    .await
                }
                None => Ok(()),
            },
            Message::BlockData(p) => self.on_block_data(conn, p.block).await,
            Message::GetStatus => {
                let (height, hash) = self.inner.handler.tip();
                conn.send(&Message::Status(StatusPayload { height, hash })).await
            }
            Message::Status(p) => {
                conn.observe_height(p.height);
                self.request_if_behind(conn, p.height).await
            }
            Message::GossipPeers(p) => {
                self.on_gossip(conn, p);
                Ok(())
            }
            Message::RequestBlocks(p) => {
                let net = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    if let Err(e) = net.serve_range(&conn, p).await {
                        debug!("[ibd] serving {} failed: {}", conn.addr, e);
                    }
                });
                Ok(())
            }
            Message::BlocksBatch(p) => self.on_batch(conn, p).await,
        }
    }

    async fn on_new_block(&self, conn: &Arc<PeerConn>, p: NewBlockPayload) -> Result<(), PeerError> {
        conn.observe_height(p.height);
        let local = self.inner.handler.local_height();
        if p.height == local + 1 {
            self.inner.sync.lock().want(p.height);
            conn.send(&Message::GetBlock(GetBlockPayload { height: p.height })).await
        } else if p.height > local + 1 {
            self.request_range(conn, local + 1).await
        } else {
            Ok(())
        }
    }

    async fn on_block_data(&self, conn: &Arc<PeerConn>, block: Block) -> Result<(), PeerError> {
        let awaiting = self.inner.walks.lock().get(&conn.addr).and_then(ForkWalk::awaiting);
        if awaiting == Some(block.height) {
            let walk = self.inner.walks.lock().remove(&conn.addr);
            if let Some(walk) = walk {
                return self.push_walk(conn, walk, block).await;
            }
        }

        let (local, tip_hash) = self.inner.handler.tip();
        if block.height == local + 1 && block.prev_hash == tip_hash {
            let (height, hash) = (block.height, block.hash());
            self.apply_block(block).await?;
            self.drain_queue().await;
            self.relay(height, hash, &conn.addr).await;
            Ok(())
        } else if block.height > local + 1 {
            self.inner.sync.lock().queue(block);
            self.request_range(conn, local + 1).await
        } else if self.inner.handler.block_hash_at(block.height) == Some(block.hash()) {
            Ok(())
        } else {
            debug!("[p2p] block {} from {} does not link, walking back", block.height, conn.addr);
            self.push_walk(conn, ForkWalk::new(conn.addr.clone()), block).await
        }
    }

    async fn push_walk(&self, conn: &Arc<PeerConn>, mut walk: ForkWalk, block: Block) -> Result<(), PeerError> {
        let local = self.inner.handler.local_height();
        let handler = self.inner.handler.clone();
        let step = walk.push(block, local, |h| handler.block_hash_at(h));
        match step {
            Ok(WalkStep::Request(height)) => {
                self.inner.walks.lock().insert(conn.addr.clone(), walk);
                conn.send(&Message::GetBlock(GetBlockPayload { height })).await
            }
            Ok(WalkStep::Complete(branch)) => {
                let fork = branch.first().map_or(0, |b| b.height.saturating_sub(1));
                info!(
                    "[reorg] branch of {} blocks from {} links at height {}",
                    branch.len(),
                    conn.addr,
                    fork
                );
                let handler = self.inner.handler.clone();
                let imported = tokio::task::spawn_blocking(move || handler.import_branch(branch))
                    .await
                    .map_err(|e| PeerError::Protocol(format!("import task failed: {}", e)))?;
                match imported {
                    Ok(()) => {
                        let (height, hash) = self.inner.handler.tip();
                        self.inner.sync.lock().prune(height);
                        self.relay(height, hash, &conn.addr).await;
                        self.request_if_behind(conn, conn.height.load(Ordering::Relaxed)).await
                    }
                    Err(e) => {
                        warn!("[reorg] branch from {} refused: {}", conn.addr, e);
                        Ok(())
                    }
                }
            }
            Err(e) => {
                warn!("[reorg] abandoning fork walk with {}: {}", conn.addr, e);
                Ok(())
            }
        }
    }

    async fn apply_block(&self, block: Block) -> Result<(), PeerError> {
        let handler = self.inner.handler.clone();
        let height = block.height;
        let result = tokio::task::spawn_blocking(move || handler.verify_and_apply_block(block))
            .await
            .map_err(|e| PeerError::Protocol(format!("apply task failed: {}", e)))?;
        if let Err(e) = result {
            warn!("[p2p] block {} rejected: {}", height, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply queued out-of-order blocks that now continue the tip
    async fn drain_queue(&self) {
        loop {
            let local = self.inner.handler.local_height();
            let ready = self.inner.sync.lock().drain_ready(local);
            if ready.is_empty() {
                return;
            }
            for block in ready {
                if self.apply_block(block).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn request_if_behind(&self, conn: &Arc<PeerConn>, peer_height: u64) -> Result<(), PeerError> {
        let local = self.inner.handler.local_height();
        if peer_height > local {
            self.request_range(conn, local + 1).await
        } else {
            Ok(())
        }
    }

    /// Start a range request chain unless one is already running
    async fn request_range(&self, conn: &Arc<PeerConn>, from_height: u64) -> Result<(), PeerError> {
        if conn.syncing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sent = self.send_range_request(conn, from_height).await;
        if sent.is_err() {
            conn.syncing.store(false, Ordering::Release);
        }
        sent
    }

    async fn send_range_request(&self, conn: &Arc<PeerConn>, from_height: u64) -> Result<(), PeerError> {
        self.write_range_request(conn, from_height).await?;
        *conn.pending_range.lock() = Some(PendingRange {
            from_height,
            sent_at: Instant::now(),
            retries: 0,
        });
        Ok(())
    }

    async fn write_range_request(&self, conn: &Arc<PeerConn>, from_height: u64) -> Result<(), PeerError> {
        debug!("[ibd] requesting from {} at {}", conn.addr, from_height);
        self.inner.metrics.ibd_requested_batches.inc();
        conn.send(&Message::RequestBlocks(RequestBlocksPayload {
            from_height,
            max_blocks: MAX_BLOCKS_PER_BATCH,
        }))
        .await
    }

    /// Re-send range requests that went unanswered for `range_timeout`;
    /// after `MAX_RANGE_RETRIES` the peer's sync chain is dropped
    async fn retry_stalled_ranges(&self) {
        let timeout = self.inner.config.range_timeout;
        for conn in self.connections().await {
            let resend = {
                let mut pending = conn.pending_range.lock();
                match *pending {
                    Some(p) if p.sent_at.elapsed() >= timeout => {
                        if p.retries >= MAX_RANGE_RETRIES {
                            *pending = None;
                            None
                        } else {
                            *pending = Some(PendingRange {
                                sent_at: Instant::now(),
                                retries: p.retries + 1,
                                ..p
                            });
                            Some(p)
                        }
                    }
                    _ => continue,
                }
            };
            match resend {
                Some(p) => {
                    warn!(
                        "[ibd] no batch from {} for range {} after {:?}, retry {}/{}",
                        conn.addr,
                        p.from_height,
                        timeout,
                        p.retries + 1,
                        MAX_RANGE_RETRIES
                    );
                    if let Err(e) = self.write_range_request(&conn, p.from_height).await {
                        debug!("[ibd] retry to {} failed: {}", conn.addr, e);
                        conn.pending_range.lock().take();
                        conn.syncing.store(false, Ordering::Release);
                    }
                }
                None => {
                    warn!("[ibd] {} never answered range requests, giving up", conn.addr);
                    conn.syncing.store(false, Ordering::Release);
                }
            }
        }
    }

    async fn serve_range(&self, conn: &Arc<PeerConn>, req: RequestBlocksPayload) -> Result<(), PeerError> {
        let inflight = self.inner.inflight.fetch_add(1, Ordering::AcqRel);
        if inflight >= self.inner.config.ibd_max_concurrent {
            self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
            let tip = self.inner.handler.local_height();
            debug!("[ibd] busy, refusing range {} for {}", req.from_height, conn.addr);
            return conn
                .send(&Message::BlocksBatch(BlocksBatchPayload::busy(req.from_height, tip)))
                .await;
        }
        self.inner.metrics.ibd_inflight.set(inflight as u64 + 1);

        let result = self.send_range(conn, req).await;

        let remaining = self.inner.inflight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.inner.metrics.ibd_inflight.set(remaining as u64);
        result
    }

    async fn send_range(&self, conn: &Arc<PeerConn>, req: RequestBlocksPayload) -> Result<(), PeerError> {
        tokio::time::sleep(SERVE_DELAY).await;
        let max = req.max_blocks.min(MAX_BLOCKS_PER_BATCH);
        let from = req.from_height;
        let handler = self.inner.handler.clone();
        let (blocks, tip) = tokio::task::spawn_blocking(move || handler.blocks_range(from, max))
            .await
            .map_err(|e| PeerError::Protocol(format!("range task failed: {}", e)))?;
        let eof = blocks.last().map_or(true, |b| b.height >= tip);
        debug!("[ibd] serving {} blocks from {} to {}", blocks.len(), from, conn.addr);
        conn.send(&Message::BlocksBatch(BlocksBatchPayload {
            from_height: from,
            count: blocks.len() as u32,
            blocks,
            tip_height: tip,
            eof,
        }))
        .await
    }

    async fn on_batch(&self, conn: &Arc<PeerConn>, batch: BlocksBatchPayload) -> Result<(), PeerError> {
        conn.pending_range.lock().take();
        if batch.is_busy() {
            let delay = conn.backoff.lock().next_delay();
            match delay {
                Some(delay) => {
                    self.inner.metrics.ibd_backoff_seconds.add(delay.as_secs());
                    debug!("[ibd] {} busy, retrying in {:?}", conn.addr, delay);
                    let net = self.clone();
                    let conn = conn.clone();
                    let from = batch.from_height;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if net.send_range_request(&conn, from).await.is_err() {
                            conn.syncing.store(false, Ordering::Release);
                        }
                    });
                }
                None => {
                    warn!("[ibd] {} stayed busy, giving up on this range", conn.addr);
                    conn.backoff.lock().reset();
                    conn.syncing.store(false, Ordering::Release);
                }
            }
            return Ok(());
        }

        conn.backoff.lock().reset();
        conn.observe_height(batch.tip_height);
        self.inner.metrics.ibd_received_batches.inc();

        let (mut local, mut tip_hash) = self.inner.handler.tip();
        let mut applied = 0u64;
        let mut stalled = false;
        for block in batch.blocks {
            if block.height <= local {
                continue;
            }
            if block.height != local + 1 {
                warn!(
                    "[ibd] batch from {} jumps from {} to {}, truncating",
                    conn.addr, local, block.height
                );
                stalled = true;
                break;
            }
            if block.prev_hash != tip_hash {
                stalled = true;
                conn.syncing.store(false, Ordering::Release);
                self.push_walk(conn, ForkWalk::new(conn.addr.clone()), block).await?;
                break;
            }
            let hash = block.hash();
            if self.apply_block(block).await.is_err() {
                stalled = true;
                break;
            }
            local += 1;
            tip_hash = hash;
            applied += 1;
        }
        self.inner.metrics.ibd_blocks_applied.add(applied);

        if applied > 0 {
            self.inner.sync.lock().prune(local);
            self.drain_queue().await;
            let (height, hash) = self.inner.handler.tip();
            info!("[ibd] applied {} blocks from {}, height {}/{}", applied, conn.addr, height, batch.tip_height);
            self.relay(height, hash, &conn.addr).await;
        }

        let local = self.inner.handler.local_height();
        if !stalled && local < batch.tip_height {
            self.send_range_request(conn, local + 1).await
        } else {
            conn.syncing.store(false, Ordering::Release);
            Ok(())
        }
    }

    fn on_gossip(&self, conn: &Arc<PeerConn>, p: GossipPeersPayload) {
        if p.net_id != self.inner.config.identity.network_id {
            warn!("[p2p] ignoring peer gossip from {} for network {}", conn.addr, p.net_id);
            return;
        }
        let added = self.inner.manager.lock().add_peers(p.addrs.iter().map(String::as_str));
        if added > 0 {
            debug!("[p2p] learned {} peers from {}", added, conn.addr);
        }
    }

    async fn maintenance(self) {
        let config = &self.inner.config;
        let mut ping = tokio::time::interval(config.ping_interval);
        let mut redial = tokio::time::interval(config.redial_interval);
        let mut gossip = tokio::time::interval(config.gossip_interval);
        let mut ranges = tokio::time::interval((config.range_timeout / 2).max(Duration::from_millis(50)));
        for timer in [&mut ping, &mut redial, &mut gossip, &mut ranges] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // the first tick of an interval completes immediately
        ping.tick().await;
        redial.tick().await;
        gossip.tick().await;
        ranges.tick().await;

        loop {
            tokio::select! {
                _ = ping.tick() => self.ping_peers().await,
                _ = redial.tick() => self.redial().await,
                _ = gossip.tick() => self.gossip_peers().await,
                _ = ranges.tick() => self.retry_stalled_ranges().await,
            }
        }
    }

    async fn ping_peers(&self) {
        let nonce = self.inner.nonce.fetch_add(1, Ordering::Relaxed);
        let timeout = self.inner.config.peer_timeout;
        for conn in self.connections().await {
            let idle = conn.last_pong.lock().elapsed();
            if idle > timeout {
                warn!("[p2p] no pong from {} for {:?}, disconnecting", conn.addr, idle);
                conn.close();
                continue;
            }
            if let Err(e) = conn.send(&Message::Ping(PingPayload { nonce })).await {
                debug!("[p2p] ping to {} failed: {}", conn.addr, e);
                conn.close();
            }
        }
    }

    async fn redial(&self) {
        let targets = {
            let mut manager = self.inner.manager.lock();
            let dropped = manager.remove_stale_peers(self.inner.config.stale_peer_timeout);
            if dropped > 0 {
                debug!(
                    "[p2p] forgot {} dead peers, known={} connected={}",
                    dropped,
                    manager.known_count(),
                    manager.connected_count()
                );
            }
            manager.peers_to_dial()
        };
        let connected: HashSet<String> = self.inner.conns.read().await.keys().cloned().collect();
        for addr in targets.into_iter().filter(|a| !connected.contains(a)) {
            let net = self.clone();
            tokio::spawn(async move {
                if let Err(e) = net.connect(&addr).await {
                    debug!("[p2p] dial {} failed: {}", addr, e);
                }
            });
        }
    }

    async fn gossip_peers(&self) {
        let addrs = self.inner.manager.lock().known_addrs();
        if addrs.is_empty() {
            return;
        }
        let msg = Message::GossipPeers(GossipPeersPayload {
            addrs,
            seen_at: unix_now(),
            net_id: self.inner.config.identity.network_id,
        });
        for conn in self.connections().await {
            if let Err(e) = conn.send(&msg).await {
                debug!("[p2p] gossip to {} failed: {}", conn.addr, e);
            }
        }
    }
}

impl BlockBroadcaster for Network {
    fn broadcast_new_block(&self, height: u64, hash: Hash) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => return,
        };
        let net = self.clone();
        handle.spawn(async move { net.relay(height, hash, "").await });
    }
}
