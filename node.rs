//! Node service facade (§4.G): the only type a host application touches
//! directly. Owns the shared config/key/metrics/handler state and the
//! lifecycle state machine that starts and stops every other subsystem
//! together.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::channel::{ChannelInfo, ChannelManager};
use crate::config::P2PConfig;
use crate::conn::handshake::LocalIdentity;
use crate::crypto;
use crate::discovery::Discovery;
use crate::error::NetworkError;
use crate::handler::{Handler, HandlerRegistry, HandlerRegistryError};
use crate::metrics::Metrics;
use crate::reputation::ReputationStore;
use crate::routing::RoutingTable;
use crate::scheduler::Scheduler;
use crate::types::{Endpoint, NodeId};

/// `{CREATED -> STARTING -> RUNNING -> STOPPING -> STOPPED}` (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            0 => LifecycleState::Created,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }
}

struct Running {
    discovery: Option<Arc<Discovery>>,
    channels: Arc<ChannelManager>,
    scheduler: Scheduler,
    accept_task: tokio::task::JoinHandle<()>,
}

/// The public facade to the discovery, connection, and channel-manager
/// cores (§4.G). Construction never touches the network; `start` binds the
/// UDP/TCP sockets, loads persisted reputation state, seeds the routing
/// table, and launches the scheduler.
pub struct NodeService {
    config: Arc<P2PConfig>,
    local_id: NodeId,
    routing: Arc<RoutingTable>,
    reputation: Arc<ReputationStore>,
    metrics: Arc<Metrics>,
    handlers: Arc<HandlerRegistry>,
    state: AtomicU8,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl NodeService {
    /// Builds the service without touching the network (§6 `new(config)`).
    pub fn new(config: P2PConfig) -> Result<Arc<Self>, NetworkError> {
        config
            .validate()
            .map_err(NetworkError::Configuration)?;
        let local_id = crypto::node_id_from_secret(&config.node_key);
        let routing = RoutingTable::new(local_id);
        let reputation = Arc::new(ReputationStore::load(&config.data_dir));
        for ip in &config.trust_nodes {
            reputation.whitelist(*ip);
        }
        Ok(Arc::new(NodeService {
            config: Arc::new(config),
            local_id,
            routing,
            reputation,
            metrics: Arc::new(Metrics::new()),
            handlers: Arc::new(HandlerRegistry::new()),
            state: AtomicU8::new(LifecycleState::Created as u8),
            running: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    fn local_identity(&self) -> LocalIdentity {
        LocalIdentity {
            signer: self.config.node_key,
            network_id: self.config.network_id,
            network_version: self.config.network_version,
            listen_port: self.config.tcp_port,
            client_id: self.config.client_id.clone(),
            capabilities: self.config.capabilities.clone(),
            node_tag: self.config.node_tag.clone(),
            advertised_height: self.config.advertised_height,
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        Endpoint {
            node_id: self.local_id,
            ip: self.config.listen_ip,
            udp_port: self.config.udp_port,
            tcp_port: self.config.tcp_port,
        }
    }

    /// Registers a handler for the code set it claims. Per §4.G, allowed
    /// only in `Created` or `Running`; per §6, a code already claimed by
    /// another handler is an error.
    pub async fn register_handler(
        &self,
        handler: Arc<dyn Handler>,
    ) -> Result<(), NetworkError> {
        match self.state() {
            LifecycleState::Created | LifecycleState::Running => {}
            _ => return Err(NetworkError::NotRunning),
        }
        self.handlers.register(handler).await.map_err(|e| match e {
            HandlerRegistryError::AlreadyRegistered(c) => NetworkError::HandlerAlreadyRegistered(c),
            HandlerRegistryError::OutOfRange(c) => NetworkError::HandlerAlreadyRegistered(c),
        })
    }

    /// Idempotent in `Running` (§4.G). Binds the TCP listener and UDP
    /// socket, loads persisted reputation state (already done in `new`),
    /// seeds bootstrap endpoints, and launches the scheduler.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        if self.state() == LifecycleState::Running {
            return Ok(());
        }
        self.state.store(LifecycleState::Starting as u8, Ordering::Release);

        let tcp_addr = SocketAddr::new(self.config.listen_ip, self.config.tcp_port);
        let listener = TcpListener::bind(tcp_addr).await.map_err(NetworkError::Io)?;

        let channels = ChannelManager::new(
            self.config.clone(),
            self.local_identity(),
            self.routing.clone(),
            self.reputation.clone(),
            self.metrics.clone(),
            self.handlers.clone(),
        );

        let accept_channels = channels.clone();
        let accept_task = tokio::spawn(async move {
            accept_channels.accept_loop(listener).await;
        });

        let discovery = if self.config.discover_enable {
            let udp_addr = SocketAddr::new(self.config.listen_ip, self.config.udp_port);
            let discovery_bind = Discovery::bind(
                udp_addr,
                self.local_endpoint(),
                self.config.network_id,
                self.config.network_version,
                self.routing.clone(),
                self.reputation.clone(),
                self.metrics.clone(),
            )
            .await
            .map_err(NetworkError::Discovery);
            let (service, mut connectable_rx) = match discovery_bind {
                Ok(pair) => pair,
                Err(e) => {
                    accept_task.abort();
                    self.state.store(LifecycleState::Created as u8, Ordering::Release);
                    return Err(e);
                }
            };

            let io_service = service.clone();
            tokio::spawn(async move { io_service.run().await });

            // Newly connectable candidates surfaced by the discovery
            // service feed straight into channel-manager maintenance rather
            // than dialing immediately, so admission policy and the
            // outbound floor stay the single source of truth for who gets
            // dialed (§2 "publishes connectable candidates to G").
            let maintenance_channels = channels.clone();
            tokio::spawn(async move {
                while let Some(_record) = connectable_rx.recv().await {
                    maintenance_channels.tick_maintenance().await;
                }
            });

            let seeds = self.resolve_bootstrap_seeds();
            let bootstrap_service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = bootstrap_service.bootstrap(&seeds).await {
                    warn!(error = %e, "bootstrap did not complete");
                }
            });

            Some(service)
        } else {
            None
        };

        let mut scheduler = Scheduler::new();
        if let Some(discovery) = discovery.clone() {
            scheduler.spawn_periodic(
                "discovery-refresh",
                self.config.discovery_refresh_interval,
                move || {
                    let discovery = discovery.clone();
                    async move { discovery.tick_maintenance().await }
                },
            );
        }
        {
            let reputation = self.reputation.clone();
            scheduler.spawn_periodic(
                "reputation-decay",
                self.config.reputation_decay_interval,
                move || {
                    let reputation = reputation.clone();
                    async move { reputation.decay_all() }
                },
            );
        }
        {
            let reputation = self.reputation.clone();
            scheduler.spawn_periodic(
                "reputation-checkpoint",
                self.config.reputation_checkpoint_interval,
                move || {
                    let reputation = reputation.clone();
                    async move {
                        if let Err(e) = reputation.checkpoint() {
                            error!(error = %e, "reputation checkpoint failed");
                        }
                    }
                },
            );
        }
        {
            let channels = channels.clone();
            scheduler.spawn_periodic(
                "channel-maintenance",
                self.config.channel_maintenance_interval,
                move || {
                    let channels = channels.clone();
                    async move { channels.tick_maintenance().await }
                },
            );
        }

        *self.running.lock().await = Some(Running {
            discovery,
            channels,
            scheduler,
            accept_task,
        });
        self.state.store(LifecycleState::Running as u8, Ordering::Release);
        info!(node = %self.local_id, %tcp_addr, "node service started");
        Ok(())
    }

    fn resolve_bootstrap_seeds(&self) -> Vec<Endpoint> {
        self.config
            .bootstrap_nodes
            .iter()
            .map(|(node_id, ip, udp_port, tcp_port)| Endpoint {
                node_id: *node_id,
                ip: *ip,
                udp_port: *udp_port,
                tcp_port: *tcp_port,
            })
            .collect()
    }

    /// Waits up to 10s for channels to drain before forcing closure (§4.G).
    pub async fn stop(self: &Arc<Self>) -> Result<(), NetworkError> {
        if self.state() != LifecycleState::Running {
            return Err(NetworkError::NotRunning);
        }
        self.state.store(LifecycleState::Stopping as u8, Ordering::Release);

        let running = self.running.lock().await.take();
        if let Some(running) = running {
            if let Some(discovery) = &running.discovery {
                discovery.shutdown();
            }
            running.accept_task.abort();

            let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while running.channels.len().await > 0 && tokio::time::Instant::now() < drain_deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            running.scheduler.shutdown().await;
        }
        let _ = self.reputation.checkpoint();

        self.state.store(LifecycleState::Stopped as u8, Ordering::Release);
        info!(node = %self.local_id, "node service stopped");
        Ok(())
    }

    /// Enqueues `body` under application `code` on the channel for `peer_id`
    /// (§6 `send`).
    pub async fn send(&self, peer_id: &NodeId, code: u8, body: Bytes) -> Result<(), NetworkError> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(NetworkError::NotRunning)?;
        running
            .channels
            .send(peer_id, code, body)
            .await
            .map_err(NetworkError::from)
    }

    /// `connectable_nodes() -> [Endpoint]` (§6): the routing table's
    /// candidates for outbound dialing, not yet filtered by whether a
    /// channel is already open to them.
    pub async fn connectable_nodes(&self) -> Vec<Endpoint> {
        self.routing
            .connectable(20)
            .into_iter()
            .map(|r| r.endpoint)
            .collect()
    }

    /// `active_channels() -> [ChannelInfo]` (§6).
    pub async fn active_channels(&self) -> Vec<ChannelInfo> {
        match self.running.lock().await.as_ref() {
            Some(running) => running.channels.active_channels().await,
            None => Vec::new(),
        }
    }
}
