//! Core data model: node identities, endpoints, routing-table records, and
//! the reputation/ban primitives shared across the discovery, connection,
//! and channel-manager subsystems.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// 160-bit node identity (low 20 bytes of keccak256(pubkey), EVM-style).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub const BITS: usize = 160;

    pub fn zero() -> Self {
        NodeId([0u8; 20])
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to another id, used as both a metric and a bucket index
    /// source: `bucket_number = 160 - leading_zero_bits(xor)`.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for i in 0..20 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index in `[0, 160)` of the k-bucket this id would fall into relative
    /// to `self` as the local id. Returns `None` when `other == self`.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let xor = self.distance(other);
        let leading_zero_bits = leading_zero_bits(&xor);
        if leading_zero_bits == Self::BITS {
            return None;
        }
        Some(Self::BITS - leading_zero_bits - 1)
    }
}

fn leading_zero_bits(bytes: &[u8; 20]) -> usize {
    let mut count = 0;
    for byte in bytes {
        if *byte == 0 {
            count += 8;
            continue;
        }
        count += byte.leading_zeros() as usize;
        break;
    }
    count
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Network-reachable location for a node: IP plus the two ports it
/// advertises for discovery (UDP) and the session pipeline (TCP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node_id: NodeId,
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.ip, self.tcp_port)
    }
}

/// Liveness state tracked per remote by the discovery service's node handler
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLiveness {
    Discovered,
    Alive,
    Dead,
}

/// An entry in a k-bucket / the routing table, carrying everything needed
/// both for DHT maintenance and for weighted peer selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub endpoint: Endpoint,
    pub liveness: NodeLiveness,
    pub first_seen: u64,
    pub last_seen: u64,
    pub last_contacted: Option<u64>,
    pub reputation_score: i32,
}

pub const REPUTATION_DEFAULT: i32 = 100;
pub const REPUTATION_MIN: i32 = 0;
pub const REPUTATION_MAX: i32 = 200;
pub const REPUTATION_DEAD_THRESHOLD: i32 = 20;

impl NodeRecord {
    pub fn new(endpoint: Endpoint) -> Self {
        let now = now_unix();
        NodeRecord {
            endpoint,
            liveness: NodeLiveness::Discovered,
            first_seen: now,
            last_seen: now,
            last_contacted: None,
            reputation_score: REPUTATION_DEFAULT,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.endpoint.node_id
    }

    pub fn is_dead(&self) -> bool {
        self.reputation_score < REPUTATION_DEAD_THRESHOLD
    }

    pub fn apply_reputation_delta(&mut self, delta: i32) {
        self.reputation_score = (self.reputation_score + delta).clamp(REPUTATION_MIN, REPUTATION_MAX);
    }
}

/// Direction-tagged delta applied to a node's reputation score: +5 on a
/// successful round trip, -5 on a timeout, both clamped to [0, 200].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationDelta {
    PingSuccess,
    PingTimeout,
}

impl ReputationDelta {
    pub fn value(self) -> i32 {
        match self {
            ReputationDelta::PingSuccess => 5,
            ReputationDelta::PingTimeout => -5,
        }
    }
}

/// Reasons a peer (by node id or IP) can be banned. Ordinal values are
/// ABI-stable — never renumber, only append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BanReason {
    HandshakeFailure = 0,
    ProtocolViolation = 1,
    InvalidSignature = 2,
    NetworkIdMismatch = 3,
    MalformedFrame = 4,
    OversizedMessage = 5,
    DecompressionBomb = 6,
    ExcessiveConnectionAttempts = 7,
    FloodingDiscovery = 8,
    Spoofing = 9,
    DuplicatePeerAbuse = 10,
    ManualBan = 11,
    LowReputation = 12,
}

impl BanReason {
    /// Base duration (seconds) for the first offense of this kind, on a
    /// monotonic scale from 1 minute (minor protocol offense) to 24 hours
    /// (critical, e.g. signed-handshake forgery). Graduated doubling
    /// (`min(base * 2^(n-1), 30 days)`) is applied by the ban store, not
    /// here — see `reputation::ban`.
    pub fn base_duration_secs(self) -> u64 {
        const MIN: u64 = 60;
        const HOUR: u64 = 3600;
        match self {
            BanReason::MalformedFrame => MIN,
            BanReason::OversizedMessage => 2 * MIN,
            BanReason::ExcessiveConnectionAttempts => 5 * MIN,
            BanReason::FloodingDiscovery => 10 * MIN,
            BanReason::DuplicatePeerAbuse => 20 * MIN,
            BanReason::HandshakeFailure => 30 * MIN,
            BanReason::NetworkIdMismatch => HOUR,
            BanReason::LowReputation => 2 * HOUR,
            BanReason::DecompressionBomb => 4 * HOUR,
            BanReason::ProtocolViolation => 6 * HOUR,
            BanReason::InvalidSignature => 12 * HOUR,
            BanReason::Spoofing => 18 * HOUR,
            BanReason::ManualBan => 24 * HOUR,
        }
    }
}

impl fmt::Display for BanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BanReason::HandshakeFailure => "handshake failure",
            BanReason::ProtocolViolation => "protocol violation",
            BanReason::InvalidSignature => "invalid signature",
            BanReason::NetworkIdMismatch => "network id mismatch",
            BanReason::MalformedFrame => "malformed frame",
            BanReason::OversizedMessage => "oversized message",
            BanReason::DecompressionBomb => "decompression bomb",
            BanReason::ExcessiveConnectionAttempts => "excessive connection attempts",
            BanReason::FloodingDiscovery => "flooding discovery traffic",
            BanReason::Spoofing => "endpoint spoofing",
            BanReason::DuplicatePeerAbuse => "duplicate peer abuse",
            BanReason::ManualBan => "manual ban",
            BanReason::LowReputation => "reputation below threshold",
        };
        f.write_str(s)
    }
}

/// Which axis a ban applies to — an IP-level ban blocks all connection
/// attempts from that address regardless of claimed node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanTarget {
    NodeId(NodeId),
    Ip(IpAddr),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanRecord {
    pub target: BanTarget,
    pub reason: BanReason,
    pub offense_count: u32,
    pub banned_at: u64,
    pub expires_at: u64,
}

impl BanRecord {
    pub fn is_active(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = NodeId([7u8; 20]);
        assert_eq!(id.distance(&id), [0u8; 20]);
        assert_eq!(id.bucket_index(&id), None);
    }

    #[test]
    fn bucket_index_monotonic_with_distance() {
        let local = NodeId::zero();
        let mut close = NodeId::zero();
        close.0[19] = 0x01;
        let mut far = NodeId::zero();
        far.0[0] = 0x80;
        let close_idx = local.bucket_index(&close).unwrap();
        let far_idx = local.bucket_index(&far).unwrap();
        assert!(far_idx > close_idx);
        assert!(far_idx < NodeId::BITS);
    }

    #[test]
    fn reputation_clamps_to_bounds() {
        let endpoint = Endpoint {
            node_id: NodeId::zero(),
            ip: IpAddr::from([127, 0, 0, 1]),
            udp_port: 1,
            tcp_port: 2,
        };
        let mut record = NodeRecord::new(endpoint);
        for _ in 0..50 {
            record.apply_reputation_delta(ReputationDelta::PingSuccess.value());
        }
        assert_eq!(record.reputation_score, REPUTATION_MAX);
        for _ in 0..100 {
            record.apply_reputation_delta(ReputationDelta::PingTimeout.value());
        }
        assert_eq!(record.reputation_score, REPUTATION_MIN);
        assert!(record.is_dead());
    }

    #[test]
    fn ban_durations_are_monotonic_with_severity_tiers() {
        assert!(BanReason::MalformedFrame.base_duration_secs() < BanReason::HandshakeFailure.base_duration_secs());
        assert!(BanReason::HandshakeFailure.base_duration_secs() < BanReason::ProtocolViolation.base_duration_secs());
        assert!(BanReason::ProtocolViolation.base_duration_secs() < BanReason::Spoofing.base_duration_secs());
        assert!(BanReason::Spoofing.base_duration_secs() < BanReason::ManualBan.base_duration_secs());
    }
}
