//! Kademlia-style discovery service (§4.D): the UDP message loop, ping/pong
//! liveness, find-node/neighbors, iterative lookup, bootstrap and table
//! maintenance. Generalizes the shape of `Discv4` (one dedicated I/O task,
//! a side-car for outstanding request bookkeeping) to the
//! `NodeId`/`RoutingTable` types in this crate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{self, primitive, DiscoveryDatagram, ParseError};
use crate::metrics::Metrics;
use crate::reputation::ReputationStore;
use crate::routing::{InsertOutcome, RoutingTable};
use crate::types::{Endpoint, NodeId, NodeLiveness, NodeRecord, ReputationDelta};

pub const ALPHA: usize = 3;
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);
pub const LOOKUP_ROUND_TIMEOUT: Duration = Duration::from_secs(5);
pub const SOFT_CAP: usize = 2_000;
pub const HARD_CAP: usize = 3_000;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery UDP socket: {0}")]
    Bind(std::io::Error),
    #[error("socket send failed: {0}")]
    Send(std::io::Error),
    #[error("lookup for this target is already in progress")]
    LookupInFlight,
    #[error("bootstrap failed: no seed answered within the timeout")]
    BootstrapFailed,
}

struct PendingPing {
    responder: tokio::sync::oneshot::Sender<()>,
}

/// Parsed discovery message bodies, tagged by the wire code in `codec.rs`.
#[derive(Debug, Clone)]
enum Message {
    Ping {
        from: Endpoint,
        to: Endpoint,
        nonce: u64,
        network_id: u32,
        network_version: u8,
        timestamp: u64,
    },
    Pong {
        nonce: u64,
        timestamp: u64,
    },
    FindNode {
        from: NodeId,
        target: NodeId,
        timestamp: u64,
    },
    Neighbors {
        nodes: Vec<Endpoint>,
        timestamp: u64,
    },
}

fn encode_endpoint(buf: &mut BytesMut, e: &Endpoint) {
    primitive::put_bytes(buf, e.node_id.as_bytes());
    primitive::put_bytes(buf, &ip_to_bytes(e.ip));
    primitive::put_short(buf, e.udp_port);
    primitive::put_short(buf, e.tcp_port);
}

fn decode_endpoint(buf: &mut BytesMut) -> Result<Endpoint, ParseError> {
    let id_bytes = primitive::get_bytes(buf, "endpoint.node_id")?;
    if id_bytes.len() != 20 {
        return Err(ParseError::Truncated("endpoint.node_id"));
    }
    let mut id = [0u8; 20];
    id.copy_from_slice(&id_bytes);
    let ip_bytes = primitive::get_bytes(buf, "endpoint.ip")?;
    let ip = bytes_to_ip(&ip_bytes)?;
    let udp_port = primitive::get_short(buf, "endpoint.udp_port")?;
    let tcp_port = primitive::get_short(buf, "endpoint.tcp_port")?;
    Ok(Endpoint {
        node_id: NodeId(id),
        ip,
        udp_port,
        tcp_port,
    })
}

fn ip_to_bytes(ip: std::net::IpAddr) -> Vec<u8> {
    match ip {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn bytes_to_ip(bytes: &[u8]) -> Result<std::net::IpAddr, ParseError> {
    match bytes.len() {
        4 => {
            let mut o = [0u8; 4];
            o.copy_from_slice(bytes);
            Ok(std::net::IpAddr::from(o))
        }
        16 => {
            let mut o = [0u8; 16];
            o.copy_from_slice(bytes);
            Ok(std::net::IpAddr::from(o))
        }
        _ => Err(ParseError::Truncated("endpoint.ip")),
    }
}

impl Message {
    fn encode(&self) -> (u8, BytesMut) {
        let mut buf = BytesMut::new();
        let code = match self {
            Message::Ping {
                from,
                to,
                nonce,
                network_id,
                network_version,
                timestamp,
            } => {
                encode_endpoint(&mut buf, from);
                encode_endpoint(&mut buf, to);
                primitive::put_long(&mut buf, *nonce);
                primitive::put_int(&mut buf, *network_id);
                primitive::put_byte(&mut buf, *network_version);
                primitive::put_long(&mut buf, *timestamp);
                codec::KAD_PING
            }
            Message::Pong { nonce, timestamp } => {
                primitive::put_long(&mut buf, *nonce);
                primitive::put_long(&mut buf, *timestamp);
                codec::KAD_PONG
            }
            Message::FindNode {
                from,
                target,
                timestamp,
            } => {
                primitive::put_bytes(&mut buf, from.as_bytes());
                primitive::put_bytes(&mut buf, target.as_bytes());
                primitive::put_long(&mut buf, *timestamp);
                codec::KAD_FIND_NODE
            }
            Message::Neighbors { nodes, timestamp } => {
                primitive::put_byte(&mut buf, nodes.len() as u8);
                for node in nodes {
                    encode_endpoint(&mut buf, node);
                }
                primitive::put_long(&mut buf, *timestamp);
                codec::KAD_NEIGHBORS
            }
        };
        (code, buf)
    }

    fn decode(code: u8, mut buf: BytesMut) -> Result<Self, ParseError> {
        match code {
            codec::KAD_PING => Ok(Message::Ping {
                from: decode_endpoint(&mut buf)?,
                to: decode_endpoint(&mut buf)?,
                nonce: primitive::get_long(&mut buf, "ping.nonce")?,
                network_id: primitive::get_int(&mut buf, "ping.network_id")?,
                network_version: primitive::get_byte(&mut buf, "ping.network_version")?,
                timestamp: primitive::get_long(&mut buf, "ping.timestamp")?,
            }),
            codec::KAD_PONG => Ok(Message::Pong {
                nonce: primitive::get_long(&mut buf, "pong.nonce")?,
                timestamp: primitive::get_long(&mut buf, "pong.timestamp")?,
            }),
            codec::KAD_FIND_NODE => {
                let from_bytes = primitive::get_bytes(&mut buf, "find_node.from")?;
                if from_bytes.len() != 20 {
                    return Err(ParseError::Truncated("find_node.from"));
                }
                let mut from = [0u8; 20];
                from.copy_from_slice(&from_bytes);
                let target_bytes = primitive::get_bytes(&mut buf, "find_node.target")?;
                if target_bytes.len() != 20 {
                    return Err(ParseError::Truncated("find_node.target"));
                }
                let mut target = [0u8; 20];
                target.copy_from_slice(&target_bytes);
                Ok(Message::FindNode {
                    from: NodeId(from),
                    target: NodeId(target),
                    timestamp: primitive::get_long(&mut buf, "find_node.timestamp")?,
                })
            }
            codec::KAD_NEIGHBORS => {
                let count = primitive::get_byte(&mut buf, "neighbors.count")?;
                let mut nodes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    nodes.push(decode_endpoint(&mut buf)?);
                }
                Ok(Message::Neighbors {
                    nodes,
                    timestamp: primitive::get_long(&mut buf, "neighbors.timestamp")?,
                })
            }
            other => Err(ParseError::UnknownCode(other)),
        }
    }
}

/// Everything the discovery service needs to run, handed in by the node
/// service facade at start time.
pub struct Discovery {
    local_endpoint: Endpoint,
    network_id: u32,
    network_version: u8,
    socket: Arc<UdpSocket>,
    table: Arc<RoutingTable>,
    reputation: Arc<ReputationStore>,
    metrics: Arc<Metrics>,
    pending_pings: Mutex<HashMap<(SocketAddr, u64), PendingPing>>,
    lookups_in_flight: Mutex<std::collections::HashSet<NodeId>>,
    shutdown: AtomicBool,
    connectable_tx: mpsc::UnboundedSender<NodeRecord>,
}

impl Discovery {
    pub async fn bind(
        bind_addr: SocketAddr,
        local_endpoint: Endpoint,
        network_id: u32,
        network_version: u8,
        table: Arc<RoutingTable>,
        reputation: Arc<ReputationStore>,
        metrics: Arc<Metrics>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NodeRecord>), DiscoveryError> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(DiscoveryError::Bind)?;
        let (connectable_tx, connectable_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Discovery {
            local_endpoint,
            network_id,
            network_version,
            socket: Arc::new(socket),
            table,
            reputation,
            metrics,
            pending_pings: Mutex::new(HashMap::new()),
            lookups_in_flight: Mutex::new(std::collections::HashSet::new()),
            shutdown: AtomicBool::new(false),
            connectable_tx,
        });
        Ok((service, connectable_rx))
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// The single dedicated UDP I/O worker (§4.D). Runs until `shutdown()`.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; codec::MAX_UDP_DATAGRAM_SIZE];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let recv = timeout(Duration::from_millis(500), self.socket.recv_from(&mut buf)).await;
            let (len, addr) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "discovery socket read error");
                    continue;
                }
                Err(_) => continue,
            };
            let this = self.clone();
            let datagram = BytesMut::from(&buf[..len]);
            tokio::spawn(async move {
                this.handle_datagram(addr, datagram).await;
            });
        }
    }

    async fn handle_datagram(self: &Arc<Self>, addr: SocketAddr, mut raw: BytesMut) {
        if raw.len() > codec::MAX_UDP_DATAGRAM_SIZE || raw.len() <= 1 {
            debug!(%addr, len = raw.len(), "dropping oversized/undersized datagram");
            return;
        }
        let code = raw[0];
        raw.advance_code();
        let message = match Message::decode(code, raw) {
            Ok(m) => m,
            Err(e) => {
                // Parse errors are network noise, not hostile behavior (§4.D).
                debug!(%addr, error = %e, "dropping unparseable discovery datagram");
                return;
            }
        };
        match message {
            Message::Ping {
                from,
                nonce,
                network_id,
                ..
            } => self.on_ping(addr, from, nonce, network_id).await,
            Message::Pong { nonce, .. } => self.on_pong(addr, nonce).await,
            Message::FindNode { from, target, .. } => self.on_find_node(addr, from, target).await,
            Message::Neighbors { nodes, .. } => self.on_neighbors(nodes).await,
        }
    }

    async fn send(&self, addr: SocketAddr, message: Message) {
        let (code, body) = message.encode();
        let datagram = DiscoveryDatagram { code, body };
        let mut buf = BytesMut::new();
        use tokio_util::codec::Encoder;
        let mut codec = crate::codec::DiscoveryCodec;
        if let Err(e) = codec.encode(datagram, &mut buf) {
            warn!(%addr, error = %e, "failed to encode outbound discovery datagram");
            return;
        }
        if let Err(e) = self.socket.send_to(&buf, addr).await {
            warn!(%addr, error = %e, "discovery send failed");
        }
    }

    async fn on_ping(self: &Arc<Self>, addr: SocketAddr, from: Endpoint, nonce: u64, network_id: u32) {
        if network_id != self.network_id {
            debug!(%addr, "dropping ping from mismatched network");
            return;
        }
        self.touch_or_insert(Endpoint {
            node_id: from.node_id,
            ip: addr.ip(),
            udp_port: addr.port(),
            tcp_port: from.tcp_port,
        });
        self.send(
            addr,
            Message::Pong {
                nonce,
                timestamp: crate::types::now_unix(),
            },
        )
        .await;
    }

    async fn on_pong(&self, addr: SocketAddr, nonce: u64) {
        let pending = {
            let mut pings = self.pending_pings.lock().await;
            pings.remove(&(addr, nonce))
        };
        let Some(pending) = pending else {
            // No outstanding ping matches this (address, nonce) pair, either
            // because it already timed out (§4.D: "if no match within 15s,
            // the pending ping is marked failed") or it's unsolicited.
            debug!(%addr, "pong with no matching outstanding ping");
            return;
        };
        let _ = pending.responder.send(());
        if let Some(id) = self.table.find_by_addr(&addr) {
            self.table.touch(&id, |r| {
                r.last_seen = crate::types::now_unix();
                r.liveness = NodeLiveness::Alive;
            });
            let new_score = self.reputation.apply(id, ReputationDelta::PingSuccess);
            self.metrics.observe_reputation(new_score);
        }
    }

    fn on_ping_timeout(&self, addr: SocketAddr) {
        if let Some(id) = self.table.find_by_addr(&addr) {
            self.reputation.apply(id, ReputationDelta::PingTimeout);
            if self.reputation.is_dead(&id) {
                self.table.touch(&id, |r| r.liveness = NodeLiveness::Dead);
            }
        }
    }

    async fn on_find_node(&self, addr: SocketAddr, _from: NodeId, target: NodeId) {
        let requester = self.table.find_by_addr(&addr).unwrap_or(_from);
        let closest: Vec<Endpoint> = self
            .table
            .closest_to(&target, crate::routing::K)
            .into_iter()
            .filter(|r| r.node_id() != requester)
            .map(|r| r.endpoint)
            .collect();
        self.send(
            addr,
            Message::Neighbors {
                nodes: closest,
                timestamp: crate::types::now_unix(),
            },
        )
        .await;
    }

    async fn on_neighbors(self: &Arc<Self>, nodes: Vec<Endpoint>) {
        for endpoint in nodes {
            self.touch_or_insert(endpoint);
        }
    }

    fn touch_or_insert(self: &Arc<Self>, endpoint: Endpoint) {
        if endpoint.node_id == self.local_endpoint.node_id {
            return;
        }
        if self.table.touch(&endpoint.node_id, |r| {
            r.last_seen = crate::types::now_unix();
            r.endpoint = endpoint;
        }) {
            return;
        }
        let record = NodeRecord::new(endpoint);
        match self.table.add(record.clone()) {
            InsertOutcome::Inserted => {
                self.metrics.set_routing_table_size(self.table.len());
                let _ = self.connectable_tx.send(record);
            }
            InsertOutcome::PendingChallenge { challenged } => {
                let this = self.clone();
                tokio::spawn(async move { this.run_challenge(challenged).await });
            }
            // A challenge for this bucket is already in flight; the queued
            // candidate rides along and is handled when that challenge
            // resolves, so there's nothing to do here.
            InsertOutcome::Queued | InsertOutcome::AlreadyPresent => {}
        }
    }

    /// Pings `challenged` and resolves the outcome against the routing
    /// table, looping to drain any further candidates queued behind it
    /// (§3 Bucket invariant: one challenge in flight per bucket at a time).
    async fn run_challenge(self: Arc<Self>, mut challenged: NodeRecord) {
        loop {
            let survived = self.ping(challenged.endpoint.udp_addr()).await;
            match self.table.resolve_challenge(&challenged.node_id(), survived) {
                Some(next) => challenged = next,
                None => break,
            }
        }
    }

    /// Sends a ping and waits (bounded by `PING_TIMEOUT`) for a matching
    /// pong, used both for direct liveness checks and for the full-bucket
    /// eviction challenge in `touch_or_insert`. On timeout, applies the
    /// reputation penalty (§4.D KAD_PONG contract) before returning.
    pub async fn ping(&self, to: SocketAddr) -> bool {
        let nonce = rand::thread_rng().next_u64();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending_pings
            .lock()
            .await
            .insert((to, nonce), PendingPing { responder: tx });

        self.send(
            to,
            Message::Ping {
                from: self.local_endpoint,
                to: Endpoint {
                    node_id: NodeId::zero(),
                    ip: to.ip(),
                    udp_port: to.port(),
                    tcp_port: 0,
                },
                nonce,
                network_id: self.network_id,
                network_version: self.network_version,
                timestamp: crate::types::now_unix(),
            },
        )
        .await;

        let answered = matches!(timeout(PING_TIMEOUT, rx).await, Ok(Ok(())));
        self.pending_pings.lock().await.remove(&(to, nonce));
        if !answered {
            self.on_ping_timeout(to);
        }
        answered
    }

    /// One α-parallel round of an iterative lookup toward `target`, honoring
    /// the one-concurrent-lookup-per-target rate limit (§4.D).
    pub async fn lookup(&self, target: NodeId) -> Result<Vec<NodeRecord>, DiscoveryError> {
        {
            let mut in_flight = self.lookups_in_flight.lock().await;
            if !in_flight.insert(target) {
                return Err(DiscoveryError::LookupInFlight);
            }
        }
        let result = self.run_lookup(target).await;
        self.lookups_in_flight.lock().await.remove(&target);
        Ok(result)
    }

    async fn run_lookup(&self, target: NodeId) -> Vec<NodeRecord> {
        let started = std::time::Instant::now();
        let mut queried = std::collections::HashSet::new();
        let mut best = self.table.closest_to(&target, ALPHA);
        loop {
            let round_candidates: Vec<NodeRecord> = best
                .iter()
                .filter(|r| !queried.contains(&r.node_id()))
                .take(ALPHA)
                .cloned()
                .collect();
            if round_candidates.is_empty() {
                break;
            }
            for c in &round_candidates {
                queried.insert(c.node_id());
            }
            let _ = timeout(
                LOOKUP_ROUND_TIMEOUT,
                futures::future::join_all(round_candidates.iter().map(|c| {
                    self.send(
                        c.endpoint.udp_addr(),
                        Message::FindNode {
                            from: self.local_endpoint.node_id,
                            target,
                            timestamp: crate::types::now_unix(),
                        },
                    )
                })),
            )
            .await;
            // Responses arrive asynchronously via on_neighbors and land in
            // the routing table; re-read the current closest set.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let refreshed = self.table.closest_to(&target, crate::routing::K);
            let improved = match (refreshed.first(), best.first()) {
                (Some(a), Some(b)) => target.distance(&a.node_id()) < target.distance(&b.node_id()),
                (Some(_), None) => true,
                _ => false,
            };
            best = refreshed;
            if !improved && queried.len() >= best.len() {
                break;
            }
        }
        self.metrics.observe_lookup_latency(started.elapsed().as_secs_f64());
        best
    }

    /// Seeds `seeds` as `Discovered` and issues a self-lookup once any seed
    /// answers a ping (§4.D Bootstrap).
    pub async fn bootstrap(&self, seeds: &[Endpoint]) -> Result<(), DiscoveryError> {
        for seed in seeds {
            self.table.add(NodeRecord::new(*seed));
        }
        let mut any_alive = false;
        for seed in seeds {
            if self.ping(seed.udp_addr()).await {
                any_alive = true;
                self.table.touch(&seed.node_id, |r| r.liveness = NodeLiveness::Alive);
            }
        }
        if !any_alive && !seeds.is_empty() {
            return Err(DiscoveryError::BootstrapFailed);
        }
        let _ = self.lookup(self.local_endpoint.node_id).await;
        Ok(())
    }

    /// Table-maintenance tick (§4.D): refreshes stale buckets and applies the
    /// soft/hard cap trim policy.
    pub async fn tick_maintenance(&self) {
        let now = crate::types::now_unix();
        for idx in self.table.stale_buckets(now, 3600) {
            let mut random_id = [0u8; 20];
            rand::thread_rng().fill_bytes(&mut random_id);
            // Bias the random id so its top bits select this bucket, the way
            // a refresh-lookup targets the stale bucket's distance range.
            let shift = idx / 8;
            if shift < 20 {
                random_id[shift] |= 0x80 >> (idx % 8);
            }
            let _ = self.lookup(NodeId(random_id)).await;
        }
        self.trim();
    }

    fn trim(&self) {
        let size = self.table.len();
        if size <= SOFT_CAP {
            return;
        }
        let candidates = self.table.connectable(0);
        let mut unreachable: Vec<_> = candidates
            .iter()
            .filter(|r| matches!(r.liveness, NodeLiveness::Dead))
            .collect();
        unreachable.sort_by_key(|r| r.last_seen);
        let mut remaining = size;
        for r in &unreachable {
            if remaining <= SOFT_CAP {
                break;
            }
            self.table.drop_node(&r.node_id());
            remaining -= 1;
        }
        if remaining > HARD_CAP {
            let mut all = candidates;
            all.sort_by_key(|r| r.last_seen);
            for r in all.iter() {
                if remaining <= SOFT_CAP {
                    break;
                }
                self.table.drop_node(&r.node_id());
                remaining -= 1;
            }
        }
    }
}

trait AdvanceCode {
    fn advance_code(&mut self);
}

impl AdvanceCode for BytesMut {
    fn advance_code(&mut self) {
        let _ = self.split_to(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_message_round_trips() {
        let from = Endpoint {
            node_id: NodeId([1u8; 20]),
            ip: std::net::IpAddr::from([127, 0, 0, 1]),
            udp_port: 1,
            tcp_port: 2,
        };
        let to = Endpoint {
            node_id: NodeId([2u8; 20]),
            ip: std::net::IpAddr::from([127, 0, 0, 1]),
            udp_port: 3,
            tcp_port: 4,
        };
        let msg = Message::Ping {
            from,
            to,
            nonce: 42,
            network_id: 1,
            network_version: 1,
            timestamp: 100,
        };
        let (code, body) = msg.encode();
        let decoded = Message::decode(code, body).unwrap();
        match decoded {
            Message::Ping { nonce, network_id, .. } => {
                assert_eq!(nonce, 42);
                assert_eq!(network_id, 1);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn neighbors_message_round_trips() {
        let node = Endpoint {
            node_id: NodeId([9u8; 20]),
            ip: std::net::IpAddr::from([10, 0, 0, 1]),
            udp_port: 5,
            tcp_port: 6,
        };
        let msg = Message::Neighbors {
            nodes: vec![node, node],
            timestamp: 5,
        };
        let (code, body) = msg.encode();
        let decoded = Message::decode(code, body).unwrap();
        match decoded {
            Message::Neighbors { nodes, .. } => assert_eq!(nodes.len(), 2),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_reserved_code_is_rejected() {
        let body = BytesMut::new();
        assert!(matches!(
            Message::decode(0x0F, body),
            Err(ParseError::UnknownCode(0x0F))
        ));
    }
}
