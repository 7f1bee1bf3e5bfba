//! Channel manager (§4.F): the authoritative ledger of active sessions,
//! admission policy, outbound-initiation maintenance, and the disconnect
//! path that feeds the reputation/ban store. Generalizes the
//! `rlpx::connection::server` peer-table bookkeeping style (a map of active
//! connections plus a periodic task that dials more peers when below a
//! floor) to this crate's two-phase (pre-handshake IP checks, post-
//! handshake peer-id checks) admission rule from §4.F.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::conn::error::{ConnError, DisconnectReason};
use crate::conn::handshake::{self, LocalIdentity, RemoteIdentity};
use crate::conn::session::{self, Direction, Session, SessionConfig};
use crate::config::P2PConfig;
use crate::handler::HandlerRegistry;
use crate::metrics::Metrics;
use crate::reputation::ReputationStore;
use crate::routing::RoutingTable;
use crate::types::{BanReason, BanTarget, Endpoint, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("remote is time-banned")]
    Banned,
    #[error("too many peers")]
    TooManyPeers,
    #[error("too many connections from this ip")]
    MaxConnectionsWithSameIp,
    #[error("a channel to this peer already exists")]
    DuplicatePeer,
    #[error(transparent)]
    Handshake(#[from] ConnError),
    #[error("no active channel for that peer")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read-only snapshot of a channel, returned by the public `active_channels`
/// API (§6).
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub peer_id: NodeId,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub avg_latency_ms: f64,
    pub client_id: String,
}

/// A `by_peer` slot. `Admitting` reserves the peer id the instant admission
/// succeeds, before the session task has even been spawned, so a second
/// concurrent handshake for the same peer id sees the reservation rather
/// than racing past `admit_by_peer` before `register_session` runs.
enum Entry {
    Admitting,
    Active(Arc<Session>),
}

struct Inner {
    /// Primary ledger, keyed by peer id (§3 Channel, §4.F `nodes_by_id`).
    by_peer: HashMap<NodeId, Entry>,
    /// Secondary index mirroring §4.F's `active_channels: RemoteEndpoint ->
    /// Channel`, used by the inbound-accept path before a peer id is known.
    by_addr: HashMap<SocketAddr, NodeId>,
}

/// Owns every live session for the lifetime of the node service. Sessions
/// never reach back into this map directly (§9 "cyclic references"): the
/// manager looks sessions up by id/address, sessions only expose a `send`/
/// `request_close` handle.
pub struct ChannelManager {
    config: Arc<P2PConfig>,
    local: LocalIdentity,
    routing: Arc<RoutingTable>,
    reputation: Arc<ReputationStore>,
    metrics: Arc<Metrics>,
    handlers: Arc<HandlerRegistry>,
    inner: RwLock<Inner>,
}

impl ChannelManager {
    pub fn new(
        config: Arc<P2PConfig>,
        local: LocalIdentity,
        routing: Arc<RoutingTable>,
        reputation: Arc<ReputationStore>,
        metrics: Arc<Metrics>,
        handlers: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        Arc::new(ChannelManager {
            config,
            local,
            routing,
            reputation,
            metrics,
            handlers,
            inner: RwLock::new(Inner {
                by_peer: HashMap::new(),
                by_addr: HashMap::new(),
            }),
        })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            writer_idle_timeout: self.config.writer_idle_timeout,
            ping_timeout: self.config.ping_timeout,
            send_queue_capacity: self.config.send_queue_capacity,
            latency_ema_alpha: self.config.latency_ema_alpha,
            local_network_version: self.config.network_version,
        }
    }

    pub async fn active_channels(&self) -> Vec<ChannelInfo> {
        let inner = self.inner.read().await;
        inner
            .by_peer
            .iter()
            .filter_map(|(peer_id, entry)| match entry {
                Entry::Active(session) => Some(ChannelInfo {
                    peer_id: *peer_id,
                    remote_addr: session.remote_addr,
                    direction: session.direction,
                    avg_latency_ms: session.avg_latency_ms(),
                    client_id: session.remote.client_id.clone(),
                }),
                Entry::Admitting => None,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_peer.len()
    }

    pub async fn is_connected(&self, peer_id: &NodeId) -> bool {
        self.inner.read().await.by_peer.contains_key(peer_id)
    }

    /// Enqueues an application payload on the channel for `peer_id` (public
    /// API `send`, §6).
    pub async fn send(&self, peer_id: &NodeId, code: u8, body: Bytes) -> Result<(), ChannelError> {
        let inner = self.inner.read().await;
        match inner.by_peer.get(peer_id) {
            Some(Entry::Active(session)) => session.send(code, body).map_err(ChannelError::from),
            _ => Err(ChannelError::NotConnected),
        }
    }

    /// Pre-handshake admission (§4.F steps 1-3): only the remote IP is known
    /// at this point.
    async fn admit_by_ip(&self, ip: IpAddr) -> Result<(), ChannelError> {
        if self.reputation.is_banned(BanTarget::Ip(ip)) {
            return Err(ChannelError::Banned);
        }
        let inner = self.inner.read().await;
        if inner.by_peer.len() >= self.config.max_connections {
            return Err(ChannelError::TooManyPeers);
        }
        let same_ip = inner.by_addr.keys().filter(|a| a.ip() == ip).count();
        if same_ip >= self.config.max_connections_per_ip {
            return Err(ChannelError::MaxConnectionsWithSameIp);
        }
        Ok(())
    }

    /// Post-handshake admission (§4.F steps 1, 4): re-checks the ban (the
    /// peer may have been banned by node id since the socket was accepted)
    /// and enforces "the older session wins" on a duplicate peer id. On
    /// success, reserves `peer_id` with an `Entry::Admitting` placeholder in
    /// the same write-lock critical section as the duplicate check, so two
    /// handshakes completing for the same peer id around the same time
    /// can't both observe an empty slot.
    async fn admit_by_peer(&self, peer_id: NodeId) -> Result<(), ChannelError> {
        if self.reputation.is_banned(BanTarget::NodeId(peer_id)) {
            return Err(ChannelError::Banned);
        }
        let mut inner = self.inner.write().await;
        if inner.by_peer.contains_key(&peer_id) {
            return Err(ChannelError::DuplicatePeer);
        }
        inner.by_peer.insert(peer_id, Entry::Admitting);
        Ok(())
    }

    /// Runs the inbound-accept loop on `listener` until `shutdown` fires.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_inbound(stream, addr).await;
            });
        }
    }

    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = self.admit_by_ip(addr.ip()).await {
            debug!(%addr, error = %e, "rejecting inbound connection before handshake");
            return;
        }
        let handshake_result =
            handshake::accept(stream, &self.local, self.config.handshake_timeout).await;
        self.finish_admission(addr, Direction::Inbound, handshake_result)
            .await;
    }

    /// Dials `endpoint` (public outbound initiation, §4.F, and the timeout
    /// budget for dialing from §5: 2s to establish the TCP stream).
    pub async fn connect(self: &Arc<Self>, endpoint: Endpoint) -> Result<(), ChannelError> {
        let addr = endpoint.tcp_addr();
        self.admit_by_ip(addr.ip()).await?;
        let stream = tokio::time::timeout(std::time::Duration::from_secs(2), TcpStream::connect(addr))
            .await
            .map_err(|_| ChannelError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out")))??;
        let handshake_result = handshake::dial(stream, &self.local, self.config.handshake_timeout).await;
        self.finish_admission(addr, Direction::Outbound, handshake_result)
            .await;
        Ok(())
    }

    async fn finish_admission(
        self: &Arc<Self>,
        addr: SocketAddr,
        direction: Direction,
        handshake_result: Result<
            (
                tokio_util::codec::Framed<TcpStream, crate::codec::SessionFrameCodec>,
                RemoteIdentity,
            ),
            ConnError,
        >,
    ) {
        let (framed, remote) = match handshake_result {
            Ok(pair) => pair,
            Err(e) => {
                debug!(%addr, error = %e, "handshake failed");
                self.metrics.record_handshake_failure();
                // §7: a network id/version mismatch is not hostile — it
                // only drops the candidate from the connectable set for an
                // hour, handled by the routing table's reputation floor
                // rather than a ban. Every other handshake failure (bad
                // signature, identity mismatch, timeout, malformed payload)
                // bans the IP.
                if !matches!(&e, ConnError::HandshakeRejected(r) if r.contains("network id/version")) {
                    self.reputation.ban(BanTarget::Ip(addr.ip()), BanReason::HandshakeFailure);
                }
                return;
            }
        };
        if let Err(e) = self.admit_by_peer(remote.peer_id).await {
            debug!(%addr, peer = %remote.peer_id, error = %e, "rejecting session after handshake");
            let reason = match e {
                ChannelError::Banned => DisconnectReason::TimeBanned,
                ChannelError::DuplicatePeer => DisconnectReason::DuplicatePeer,
                _ => DisconnectReason::ProtocolError,
            };
            let mut framed = framed;
            handshake::send_disconnect(&mut framed, self.config.network_version, reason).await;
            return;
        }

        let peer_id = remote.peer_id;
        {
            let mut inner = self.inner.write().await;
            inner.by_addr.insert(addr, peer_id);
        }

        self.metrics.record_connection_established();
        match direction {
            Direction::Inbound => self.metrics.active_inbound_connections.inc(),
            Direction::Outbound => self.metrics.active_outbound_connections.inc(),
        }
        self.handlers.broadcast_connect(peer_id).await;
        info!(peer = %peer_id, %addr, ?direction, "channel established");

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let this = self.clone();
        let cfg = self.session_config();
        let handlers = self.handlers.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let (session, reason) = session::run(
                peer_id, addr, direction, remote, framed, cfg, handlers, metrics, ready_tx,
            )
            .await;
            this.on_session_ended(peer_id, addr, direction, session, reason).await;
        });

        // `by_peer` already holds an `Entry::Admitting` placeholder for
        // `peer_id` from `admit_by_peer` above, so this only has to upgrade
        // it to `Active` once `session::run` constructs the real handle —
        // no second admission race is possible in between.
        let this = self.clone();
        tokio::spawn(async move {
            if let Ok(session) = ready_rx.await {
                this.register_session(peer_id, session).await;
            }
        });
    }

    async fn register_session(&self, peer_id: NodeId, session: Arc<Session>) {
        let mut inner = self.inner.write().await;
        inner.by_peer.insert(peer_id, Entry::Active(session));
    }

    async fn on_session_ended(
        self: &Arc<Self>,
        peer_id: NodeId,
        addr: SocketAddr,
        direction: Direction,
        session: Arc<Session>,
        reason: DisconnectReason,
    ) {
        {
            let mut inner = self.inner.write().await;
            inner.by_peer.remove(&peer_id);
            inner.by_addr.remove(&addr);
        }
        self.metrics.record_connection_closed(reason);
        match direction {
            Direction::Inbound => self.metrics.active_inbound_connections.dec(),
            Direction::Outbound => self.metrics.active_outbound_connections.dec(),
        }
        if reason.is_hostile() {
            self.reputation.ban(BanTarget::Ip(addr.ip()), BanReason::ProtocolViolation);
            self.metrics.record_ban_created();
        }
        self.handlers.broadcast_disconnect(peer_id).await;
        let _ = session;
        info!(peer = %peer_id, %reason, "channel closed");
    }

    /// Outbound-initiation maintenance tick (§4.F): keeps the outbound and
    /// total connection counts at their configured floors by dialing from
    /// the routing table's connectable set, weighted toward lower distance
    /// and higher reputation rather than a hard sort (generalizing
    /// `get_peer_with_score_filter`'s weighting scheme).
    pub async fn tick_maintenance(self: &Arc<Self>) {
        let total = self.len().await;
        if total >= self.config.min_connections {
            return;
        }
        let needed = self.config.min_connections - total;
        let connected: std::collections::HashSet<NodeId> =
            self.inner.read().await.by_peer.keys().copied().collect();
        let candidates: Vec<_> = self
            .routing
            .connectable(20)
            .into_iter()
            .filter(|r| !connected.contains(&r.node_id()))
            .collect();
        let picks = pick_weighted(candidates, needed);
        for record in picks {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.connect(record.endpoint).await {
                    debug!(peer = %record.node_id(), error = %e, "outbound dial failed");
                }
            });
        }
    }
}

/// Selects up to `n` records from `candidates` without replacement,
/// weighting each draw by `reputation_score + 1` (never zero, so a
/// just-above-floor peer still has a chance) so outbound dialing doesn't
/// starve healthy-but-not-top-scored peers the way a plain sort by
/// reputation would.
fn pick_weighted(mut candidates: Vec<crate::types::NodeRecord>, n: usize) -> Vec<crate::types::NodeRecord> {
    let mut picks = Vec::with_capacity(n.min(candidates.len()));
    let mut rng = rand::thread_rng();
    for _ in 0..n {
        if candidates.is_empty() {
            break;
        }
        let total: i64 = candidates.iter().map(|r| r.reputation_score as i64 + 1).sum();
        if total <= 0 {
            break;
        }
        let mut roll = rng.gen_range(0..total);
        let mut chosen = 0;
        for (i, r) in candidates.iter().enumerate() {
            let weight = r.reputation_score as i64 + 1;
            if roll < weight {
                chosen = i;
                break;
            }
            roll -= weight;
        }
        picks.push(candidates.remove(chosen));
    }
    picks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::P2PConfig;
    use secp256k1::SecretKey;
    use std::net::Ipv4Addr;

    fn test_identity() -> LocalIdentity {
        LocalIdentity {
            signer: SecretKey::new(&mut rand::rngs::OsRng),
            network_id: 1,
            network_version: 1,
            listen_port: 0,
            client_id: "kadlink/test".into(),
            capabilities: vec![],
            node_tag: String::new(),
            advertised_height: 0,
        }
    }

    fn test_manager() -> Arc<ChannelManager> {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(P2PConfig {
            max_connections: 2,
            max_connections_per_ip: 1,
            data_dir: dir.into_path(),
            ..Default::default()
        });
        let routing = RoutingTable::new(NodeId::zero());
        let reputation = Arc::new(ReputationStore::load(&config.data_dir));
        let metrics = Arc::new(Metrics::new());
        let handlers = Arc::new(HandlerRegistry::new());
        ChannelManager::new(config, test_identity(), routing, reputation, metrics, handlers)
    }

    #[tokio::test]
    async fn admit_by_ip_rejects_banned_address() {
        let manager = test_manager();
        let ip = IpAddr::from(Ipv4Addr::new(10, 0, 0, 9));
        manager.reputation.ban(BanTarget::Ip(ip), BanReason::ManualBan);
        assert!(matches!(
            manager.admit_by_ip(ip).await,
            Err(ChannelError::Banned)
        ));
    }

    #[tokio::test]
    async fn admit_by_ip_enforces_per_ip_cap() {
        let manager = test_manager();
        let ip = IpAddr::from(Ipv4Addr::new(10, 0, 0, 10));
        {
            let mut inner = manager.inner.write().await;
            inner.by_addr.insert(SocketAddr::new(ip, 1), NodeId::zero());
        }
        assert!(matches!(
            manager.admit_by_ip(ip).await,
            Err(ChannelError::MaxConnectionsWithSameIp)
        ));
    }

    #[test]
    fn pick_weighted_never_exceeds_available_candidates() {
        let endpoint = |b: u8| Endpoint {
            node_id: NodeId([b; 20]),
            ip: IpAddr::from(Ipv4Addr::new(127, 0, 0, 1)),
            udp_port: 1,
            tcp_port: 2,
        };
        let candidates = vec![
            crate::types::NodeRecord::new(endpoint(1)),
            crate::types::NodeRecord::new(endpoint(2)),
        ];
        let picks = pick_weighted(candidates, 10);
        assert_eq!(picks.len(), 2);
    }
}
