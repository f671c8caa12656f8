//! Peer management
//!
//! Known peers, connection state, failure counts and bans, plus the
//! best-effort on-disk peer store.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::storage::ChainDb;

/// Known-peer cap
pub const MAX_KNOWN_PEERS: usize = 20;

/// Dial attempts before a peer is left alone
const MAX_FAILED_ATTEMPTS: u32 = 5;

/// Peer connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    /// Handshake complete
    Connected,
    /// Failed identity check or misbehaved; never redialled
    Banned,
}

/// Information about a peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: String,
    pub state: PeerState,
    pub last_seen: Instant,
    pub failed_attempts: u32,
    pub node_name: String,
    pub ban_reason: Option<String>,
}

impl PeerInfo {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            state: PeerState::Disconnected,
            last_seen: Instant::now(),
            failed_attempts: 0,
            node_name: String::new(),
            ban_reason: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Peer manager
#[derive(Debug)]
pub struct PeerManager {
    peers: HashMap<String, PeerInfo>,
    connected: HashSet<String>,
    max_known: usize,
    /// Hosts banned on any port
    banned_ips: HashSet<IpAddr>,
    /// Our own listen address, never dialled
    local: Option<String>,
}

fn host_ip(addr: &str) -> Option<IpAddr> {
    addr.parse::<SocketAddr>().ok().map(|a| a.ip())
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new(MAX_KNOWN_PEERS)
    }
}

impl PeerManager {
    pub fn new(max_known: usize) -> Self {
        Self {
            peers: HashMap::new(),
            connected: HashSet::new(),
            max_known,
            banned_ips: HashSet::new(),
            local: None,
        }
    }

    pub fn set_local(&mut self, addr: impl Into<String>) {
        self.local = Some(addr.into());
    }

    /// Remember `addr`; false when full, already known or our own address
    pub fn add_peer(&mut self, addr: &str) -> bool {
        if self.peers.contains_key(addr) || self.local.as_deref() == Some(addr) {
            return false;
        }
        if self.peers.len() >= self.max_known {
            debug!("[p2p] known-peer cap reached, dropping {}", addr);
            return false;
        }
        self.peers.insert(addr.to_string(), PeerInfo::new(addr));
        true
    }

    pub fn add_peers<'a>(&mut self, addrs: impl IntoIterator<Item = &'a str>) -> usize {
        addrs.into_iter().filter(|a| self.add_peer(a)).count()
    }

    pub fn peer_connecting(&mut self, addr: &str) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Connecting;
        }
    }

    /// Mark peer as connected after a good handshake
    pub fn peer_connected(&mut self, addr: &str, node_name: &str) {
        let peer = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerInfo::new(addr));
        peer.state = PeerState::Connected;
        peer.node_name = node_name.to_string();
        peer.failed_attempts = 0;
        peer.touch();
        self.connected.insert(addr.to_string());
    }

    pub fn peer_disconnected(&mut self, addr: &str) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if peer.state != PeerState::Banned {
                peer.state = PeerState::Disconnected;
            }
        }
        self.connected.remove(addr);
    }

    pub fn connection_failed(&mut self, addr: &str) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.state = PeerState::Disconnected;
            peer.failed_attempts += 1;
        }
    }

    /// Ban regardless of whether the peer was known
    ///
    /// Socket addresses ban the whole host, so a reconnect from a fresh
    /// ephemeral port is still refused.
    pub fn ban_peer(&mut self, addr: &str, reason: &str) {
        if let Some(ip) = host_ip(addr) {
            self.banned_ips.insert(ip);
        }
        let peer = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| PeerInfo::new(addr));
        peer.state = PeerState::Banned;
        peer.ban_reason = Some(reason.to_string());
        self.connected.remove(addr);
    }

    pub fn is_banned(&self, addr: &str) -> bool {
        if host_ip(addr).map_or(false, |ip| self.banned_ips.contains(&ip)) {
            return true;
        }
        self.peers
            .get(addr)
            .map_or(false, |p| p.state == PeerState::Banned)
    }

    /// Known, unconnected, unbanned peers worth dialling
    pub fn peers_to_dial(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Disconnected && p.failed_attempts < MAX_FAILED_ATTEMPTS)
            .map(|p| p.addr.clone())
            .collect()
    }

    /// Addresses worth gossiping: everything not banned
    pub fn known_addrs(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.state != PeerState::Banned)
            .map(|p| p.addr.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn known_count(&self) -> usize {
        self.peers.len()
    }

    /// Forget disconnected peers that used up their dial attempts or were
    /// not seen within `timeout`; returns how many were dropped
    pub fn remove_stale_peers(&mut self, timeout: Duration) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, p| {
            p.state != PeerState::Disconnected
                || (p.failed_attempts < MAX_FAILED_ATTEMPTS && !p.is_stale(timeout))
        });
        before - self.peers.len()
    }
}

/// Persisted peer record under `peer:<addr>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub addr: String,
    pub last_seen: i64,
    pub net_id: u64,
}

/// Best-effort persistence of known peers; the in-memory manager wins
#[derive(Debug, Clone)]
pub struct PeerStore {
    db: ChainDb,
    net_id: u64,
}

impl PeerStore {
    pub fn new(db: ChainDb, net_id: u64) -> Self {
        Self { db, net_id }
    }

    pub fn save(&self, addr: &str, last_seen: i64) {
        let record = PeerRecord {
            addr: addr.to_string(),
            last_seen,
            net_id: self.net_id,
        };
        if let Err(e) = self.db.save_peer(addr, &record) {
            debug!("[p2p] peer store write failed for {}: {}", addr, e);
        }
    }

    /// Stored peers of our network, newest first
    pub fn load(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = match self.db.load_peers() {
            Ok(r) => r,
            Err(e) => {
                debug!("[p2p] peer store unreadable: {}", e);
                return Vec::new();
            }
        };
        records.retain(|r| r.net_id == self.net_id);
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        records
    }
}
