//! End-to-end scenarios S1, S2, S3, S5. Each spins up one or more in-process
//! `NodeService`s on `127.0.0.1` and drives them through the public API
//! only, the way this crate's own `tests/` integration suite exercises its
//! network stack.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kadlink_p2p::config::P2PConfig;
use kadlink_p2p::discovery::Discovery;
use kadlink_p2p::handler::Handler;
use kadlink_p2p::metrics::Metrics;
use kadlink_p2p::reputation::ReputationStore;
use kadlink_p2p::routing::RoutingTable;
use kadlink_p2p::types::{Endpoint, NodeId, NodeRecord};
use kadlink_p2p::NodeService;
use secp256k1::SecretKey;

struct ConnectCounter {
    connects: AtomicUsize,
}

#[async_trait]
impl Handler for ConnectCounter {
    fn codes(&self) -> &[u8] {
        &[0x20]
    }

    async fn on_connect(&self, _peer: NodeId) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, _peer: NodeId, _code: u8, _payload: Bytes) {}
}

fn base_config(tcp_port: u16, data_dir: PathBuf) -> P2PConfig {
    P2PConfig {
        node_key: SecretKey::new(&mut rand::rngs::OsRng),
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        udp_port: tcp_port,
        tcp_port,
        network_id: 1,
        network_version: 0,
        client_id: "kadlink/test".into(),
        data_dir,
        min_connections: 1,
        min_active_connections: 1,
        discovery_refresh_interval: Duration::from_millis(100),
        channel_maintenance_interval: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Polls an async condition until it's true or `deadline` elapses.
async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// S1 — two-node handshake: B seeds off A; within 5s both report one active
/// channel and `on_connect` has fired exactly once on each side.
#[tokio::test]
async fn two_node_handshake_establishes_one_channel_each_side() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let config_a = base_config(16101, dir_a.path().to_path_buf());
    let a = NodeService::new(config_a).unwrap();
    let connects_a = Arc::new(ConnectCounter { connects: AtomicUsize::new(0) });
    a.register_handler(connects_a.clone()).await.unwrap();
    a.start().await.unwrap();

    let mut config_b = base_config(16102, dir_b.path().to_path_buf());
    config_b.bootstrap_nodes = vec![(a.local_id(), IpAddr::V4(Ipv4Addr::LOCALHOST), 16101, 16101)];
    let b = NodeService::new(config_b).unwrap();
    let connects_b = Arc::new(ConnectCounter { connects: AtomicUsize::new(0) });
    b.register_handler(connects_b.clone()).await.unwrap();
    b.start().await.unwrap();

    let converged = wait_until(Duration::from_secs(5), || async {
        a.active_channels().await.len() == 1 && b.active_channels().await.len() == 1
    })
    .await;
    assert!(converged, "expected exactly one channel on each side within 5s");
    assert_eq!(connects_a.connects.load(Ordering::SeqCst), 1);
    assert_eq!(connects_b.connects.load(Ordering::SeqCst), 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// S2 — duplicate suppression: B's maintenance loop keeps running with a
/// channel already open to A, so a second dial is never attempted and A's
/// channel count never exceeds 1.
#[tokio::test]
async fn duplicate_dial_is_refused_and_channel_count_stays_one() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let config_a = base_config(16111, dir_a.path().to_path_buf());
    let a = NodeService::new(config_a).unwrap();
    a.start().await.unwrap();

    let mut config_b = base_config(16112, dir_b.path().to_path_buf());
    config_b.bootstrap_nodes = vec![(a.local_id(), IpAddr::V4(Ipv4Addr::LOCALHOST), 16111, 16111)];
    config_b.min_connections = 2; // keeps B's maintenance loop re-checking for more peers
    let b = NodeService::new(config_b).unwrap();
    b.start().await.unwrap();

    wait_until(Duration::from_secs(5), || async { a.active_channels().await.len() == 1 }).await;

    // B has nowhere else to dial, but its maintenance tick keeps firing
    // every 100ms; if duplicate suppression were broken this would surface
    // as A's channel count climbing past 1.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.active_channels().await.len(), 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// S2b — duplicate suppression at the admission boundary itself: a second
/// dial to an already-connected peer id, issued directly through
/// `ChannelManager::connect` (bypassing the maintenance tick's own
/// already-connected filter), is refused with `DUPLICATE_PEER` on handshake
/// completion and the channel count stays at 1 on both sides.
#[tokio::test]
async fn second_direct_dial_to_connected_peer_is_refused_as_duplicate() {
    use kadlink_p2p::channel::ChannelManager;
    use kadlink_p2p::conn::handshake::LocalIdentity;
    use kadlink_p2p::handler::HandlerRegistry;

    let dir_a = tempfile::tempdir().unwrap();
    let config_a = base_config(16141, dir_a.path().to_path_buf());
    let a = NodeService::new(config_a).unwrap();
    a.start().await.unwrap();

    let dir_b = tempfile::tempdir().unwrap();
    let config_b = base_config(16142, dir_b.path().to_path_buf());
    let network_id = config_b.network_id;
    let network_version = config_b.network_version;
    let client_id = config_b.client_id.clone();
    let tcp_port = config_b.tcp_port;
    let config_b = Arc::new(config_b);

    let routing_b = RoutingTable::new(NodeId([9u8; 20]));
    let reputation_b = Arc::new(ReputationStore::load(dir_b.path()));
    let metrics_b = Arc::new(Metrics::new());
    let handlers_b = Arc::new(HandlerRegistry::new());
    let local_b = LocalIdentity {
        signer: SecretKey::new(&mut rand::rngs::OsRng),
        network_id,
        network_version,
        listen_port: tcp_port,
        client_id,
        capabilities: vec![],
        node_tag: String::new(),
        advertised_height: 0,
    };
    let manager_b = ChannelManager::new(config_b, local_b, routing_b, reputation_b, metrics_b, handlers_b);

    let endpoint_a = Endpoint {
        node_id: a.local_id(),
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        udp_port: 16141,
        tcp_port: 16141,
    };

    manager_b.connect(endpoint_a).await.unwrap();
    let first_up = wait_until(Duration::from_secs(5), || async {
        manager_b.is_connected(&a.local_id()).await
    })
    .await;
    assert!(first_up, "first dial should establish a channel");

    manager_b.connect(endpoint_a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        manager_b.len().await,
        1,
        "duplicate dial must not add a second channel on the dialer's side"
    );
    assert_eq!(
        a.active_channels().await.len(),
        1,
        "A must still see exactly one channel from B"
    );

    a.stop().await.unwrap();
}

/// S3 — per-IP cap: with `max_connections_per_ip = 2`, a third loopback
/// client is refused.
#[tokio::test]
async fn third_same_ip_client_is_rejected_by_per_ip_cap() {
    let dir_server = tempfile::tempdir().unwrap();
    let mut server_config = base_config(16121, dir_server.path().to_path_buf());
    server_config.discover_enable = false;
    server_config.max_connections_per_ip = 2;
    let server = NodeService::new(server_config).unwrap();
    server.start().await.unwrap();

    let mut clients = Vec::new();
    for port in [16131u16, 16132, 16133] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(port, dir.path().to_path_buf());
        config.bootstrap_nodes = vec![(server.local_id(), IpAddr::V4(Ipv4Addr::LOCALHOST), 16121, 16121)];
        config.min_connections = 1;
        let client = NodeService::new(config).unwrap();
        client.start().await.unwrap();
        clients.push((client, dir));
    }

    wait_until(Duration::from_secs(5), || async { server.active_channels().await.len() >= 2 }).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        server.active_channels().await.len(),
        2,
        "only two of the three same-IP clients should be admitted"
    );

    server.stop().await.unwrap();
    for (client, _dir) in clients {
        client.stop().await.unwrap();
    }
}

/// S5 — Kademlia lookup: a 20-node line network converges on the target
/// within a handful of lookup rounds.
#[tokio::test]
async fn lookup_converges_on_target_across_a_line_network() {
    const N: usize = 20;
    let base_port = 17000u16;

    let mut services = Vec::with_capacity(N);
    let mut tables = Vec::with_capacity(N);
    let mut endpoints = Vec::with_capacity(N);
    for i in 0..N {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = base_port + i as u16;
        let table = RoutingTable::new(NodeId([i as u8; 20]));
        let reputation = Arc::new(ReputationStore::load(tempfile::tempdir().unwrap().into_path()));
        let metrics = Arc::new(Metrics::new());
        let local_endpoint = Endpoint {
            node_id: NodeId([i as u8; 20]),
            ip,
            udp_port: port,
            tcp_port: port,
        };
        let (service, _connectable_rx) =
            Discovery::bind(std::net::SocketAddr::new(ip, port), local_endpoint, 1, 0, table.clone(), reputation, metrics)
                .await
                .unwrap();
        endpoints.push(local_endpoint);
        tables.push(table);
        services.push(service);
    }

    // Seed each node's routing table with its line neighbors and spawn its
    // I/O loop.
    for i in 0..N {
        for j in [i.checked_sub(1), Some(i + 1)].into_iter().flatten() {
            if let Some(neighbor) = endpoints.get(j) {
                tables[i].add(NodeRecord::new(*neighbor));
            }
        }
        let svc = services[i].clone();
        tokio::spawn(async move { svc.run().await });
    }

    let target = NodeId([(N - 1) as u8; 20]);
    let found = services[0].lookup(target).await.unwrap();
    assert!(
        found.iter().any(|r| r.node_id() == target),
        "lookup from node 0 should surface node 19 within the configured rounds"
    );

    for service in &services {
        service.shutdown();
    }
}
