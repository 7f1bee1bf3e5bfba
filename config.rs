//! Host-supplied runtime configuration. This crate does no CLI or file
//! parsing of its own — the host assembles a `P2PConfig` and hands it to
//! `NodeService::new`.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use secp256k1::SecretKey;

use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub name: &'static str,
    pub version: u8,
}

#[derive(Clone)]
pub struct P2PConfig {
    /// Long-lived signing key identifying this node; the corresponding node
    /// id is `keccak256(pubkey)[12..]`. The key store itself lives outside
    /// this crate.
    pub node_key: SecretKey,
    pub listen_ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub network_id: u32,
    pub network_version: u8,
    pub client_id: String,
    pub node_tag: String,
    pub capabilities: Vec<Capability>,
    pub bootstrap_nodes: Vec<(NodeId, IpAddr, u16, u16)>,
    /// Opaque chain-height value advertised in the handshake payload; this
    /// crate never interprets it, the host updates it as its chain head
    /// advances.
    pub advertised_height: u64,
    /// Addresses immune to banning (§6 `trust_nodes`).
    pub trust_nodes: Vec<IpAddr>,
    pub discover_enable: bool,
    pub data_dir: PathBuf,

    // Kademlia / discovery
    pub bucket_size: usize,
    pub lookup_alpha: usize,
    pub table_soft_cap: usize,
    pub table_hard_cap: usize,
    pub bucket_refresh_interval: Duration,
    pub discovery_refresh_interval: Duration,

    // Channel manager / admission
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub min_active_connections: usize,
    pub min_connections: usize,
    pub channel_maintenance_interval: Duration,

    // Connection pipeline
    pub handshake_timeout: Duration,
    pub writer_idle_timeout: Duration,
    pub ping_timeout: Duration,
    pub send_queue_capacity: usize,
    pub latency_ema_alpha: f64,
    pub max_packet_size: usize,
    pub max_uncompressed_body_size: usize,
    pub decompression_bomb_threshold: usize,

    // Reputation / ban store
    pub reputation_decay_interval: Duration,
    pub reputation_checkpoint_interval: Duration,
    pub ban_max_duration: Duration,
}

impl Default for P2PConfig {
    fn default() -> Self {
        P2PConfig {
            node_key: default_ephemeral_key(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 16783,
            tcp_port: 16783,
            network_id: 1,
            network_version: 1,
            client_id: "kadlink/0.1.0".to_string(),
            node_tag: String::new(),
            capabilities: Vec::new(),
            bootstrap_nodes: Vec::new(),
            advertised_height: 0,
            trust_nodes: Vec::new(),
            discover_enable: true,
            data_dir: PathBuf::from("./data/p2p"),

            bucket_size: 16,
            lookup_alpha: 3,
            table_soft_cap: 2000,
            table_hard_cap: 3000,
            bucket_refresh_interval: Duration::from_secs(60),
            discovery_refresh_interval: Duration::from_secs(30),

            max_connections: 50,
            max_connections_per_ip: 2,
            min_active_connections: 2,
            min_connections: 8,
            channel_maintenance_interval: Duration::from_secs(5),

            handshake_timeout: Duration::from_secs(10),
            writer_idle_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(20),
            send_queue_capacity: 1024,
            latency_ema_alpha: 0.25,
            max_packet_size: 4 * 1024 * 1024,
            max_uncompressed_body_size: 128 * 1024,
            decompression_bomb_threshold: 5 * 1024 * 1024,

            reputation_decay_interval: Duration::from_secs(3600),
            reputation_checkpoint_interval: Duration::from_secs(60),
            ban_max_duration: Duration::from_secs(30 * 86_400),
        }
    }
}

/// Only used so `Default` is total; real deployments must supply a
/// persisted `node_key` via `P2PConfig { node_key, ..Default::default() }`.
fn default_ephemeral_key() -> SecretKey {
    SecretKey::from_slice(&[0xab; 32]).expect("static 32-byte slice is a valid secret key")
}

impl P2PConfig {
    /// Fatal configuration errors are caught here rather than left to panic
    /// at first use.
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket_size == 0 {
            return Err("bucket_size must be non-zero".into());
        }
        if self.lookup_alpha == 0 {
            return Err("lookup_alpha must be non-zero".into());
        }
        if self.table_soft_cap > self.table_hard_cap {
            return Err("table_soft_cap must not exceed table_hard_cap".into());
        }
        if self.max_connections_per_ip > self.max_connections {
            return Err("max_connections_per_ip must not exceed max_connections".into());
        }
        if self.min_active_connections > self.min_connections {
            return Err("min_active_connections must not exceed min_connections".into());
        }
        if self.max_uncompressed_body_size > self.max_packet_size {
            return Err("max_uncompressed_body_size must not exceed max_packet_size".into());
        }
        Ok(())
    }
}
