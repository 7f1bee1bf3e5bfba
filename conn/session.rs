//! The running per-peer TCP session: one task per channel multiplexing
//! inbound frames, outbound sends, and keep-alive timers over a single
//! `Framed` stream (§4.E). Generalizes the
//! `rlpx::connection::connection_loop`/`check_periodic_tasks` shape (a
//! `tokio::select!` over inbound/backend/periodic branches, each iteration
//! followed by a timer check) to this crate's two-tier send queue and
//! PING/PONG keep-alive instead of devp2p's capability messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{primitive, SessionFrame, SessionFrameCodec, DISCONNECT, PING, PONG};
use crate::conn::error::{ConnError, DisconnectReason};
use crate::conn::handshake::RemoteIdentity;
use crate::handler::HandlerRegistry;
use crate::metrics::Metrics;
use crate::types::{now_unix, NodeId};

const FLUSH_INTERVAL: Duration = Duration::from_millis(10);
const FLUSH_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Timers and queue capacities a session is run with; carried separately
/// from `P2PConfig` so tests can shrink them.
#[derive(Clone)]
pub struct SessionConfig {
    pub writer_idle_timeout: Duration,
    pub ping_timeout: Duration,
    pub send_queue_capacity: usize,
    pub latency_ema_alpha: f64,
    pub local_network_version: u8,
}

struct Outbound {
    packet_type: u8,
    body: Bytes,
}

fn is_priority(packet_type: u8) -> bool {
    matches!(packet_type, PING | PONG | DISCONNECT)
}

#[derive(Debug, Default)]
struct Stats {
    avg_latency_ms: f64,
    last_send: Option<Instant>,
    awaiting_pong: Option<(Instant, u64)>,
}

/// Handle to a running session shared between the owning task (which holds
/// the `Framed` stream and the matching receivers) and everything else that
/// wants to enqueue a frame or ask for a clean shutdown — the Channel
/// Manager, host handlers replying to a message, `NodeService::send`.
pub struct Session {
    pub peer_id: NodeId,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    pub remote: RemoteIdentity,
    pub started_at: Instant,
    cfg: SessionConfig,
    priority_tx: mpsc::Sender<Outbound>,
    normal_tx: mpsc::Sender<Outbound>,
    close_tx: mpsc::Sender<DisconnectReason>,
    stats: std::sync::Mutex<Stats>,
}

/// The receivers paired with a freshly-built `Session`; only `run` consumes
/// these, which is why they are not fields of `Session` itself — the session
/// handle is `Clone`-free but freely shareable via `Arc`, while only the task
/// running `run` may read from the channels.
struct Endpoints {
    priority_rx: mpsc::Receiver<Outbound>,
    normal_rx: mpsc::Receiver<Outbound>,
    close_rx: mpsc::Receiver<DisconnectReason>,
}

impl Session {
    fn new(
        peer_id: NodeId,
        remote_addr: SocketAddr,
        direction: Direction,
        remote: RemoteIdentity,
        cfg: SessionConfig,
    ) -> (Arc<Session>, Endpoints) {
        let (priority_tx, priority_rx) = mpsc::channel(cfg.send_queue_capacity);
        let (normal_tx, normal_rx) = mpsc::channel(cfg.send_queue_capacity);
        let (close_tx, close_rx) = mpsc::channel(1);
        let session = Arc::new(Session {
            peer_id,
            remote_addr,
            direction,
            remote,
            started_at: Instant::now(),
            cfg,
            priority_tx,
            normal_tx,
            close_tx,
            stats: std::sync::Mutex::new(Stats::default()),
        });
        (
            session,
            Endpoints {
                priority_rx,
                normal_rx,
                close_rx,
            },
        )
    }

    /// Queues a frame for the channel's prioritized or normal send queue
    /// depending on `packet_type` (§4.E). A full queue closes the channel
    /// with reason `BUSY`, matching the overflow rule verbatim.
    pub fn send(&self, packet_type: u8, body: Bytes) -> Result<(), ConnError> {
        let item = Outbound { packet_type, body };
        let sender = if is_priority(packet_type) {
            &self.priority_tx
        } else {
            &self.normal_tx
        };
        match sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.close_tx.try_send(DisconnectReason::Busy);
                Err(ConnError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnError::Closed),
        }
    }

    /// Requests a graceful shutdown; the running loop sends `DISCONNECT`
    /// with `reason` and exits at its next select iteration.
    pub fn request_close(&self, reason: DisconnectReason) {
        let _ = self.close_tx.try_send(reason);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.stats
            .lock()
            .expect("session stats mutex is never held across a panic boundary")
            .avg_latency_ms
    }

    fn touch_send(&self) {
        self.stats
            .lock()
            .expect("session stats mutex is never held across a panic boundary")
            .last_send = Some(Instant::now());
    }

    fn idle_for(&self, threshold: Duration) -> bool {
        let stats = self
            .stats
            .lock()
            .expect("session stats mutex is never held across a panic boundary");
        match stats.last_send {
            Some(t) => t.elapsed() >= threshold,
            None => self.started_at.elapsed() >= threshold,
        }
    }

    fn mark_ping_sent(&self, timestamp: u64) {
        let mut stats = self
            .stats
            .lock()
            .expect("session stats mutex is never held across a panic boundary");
        stats.awaiting_pong = Some((Instant::now(), timestamp));
        stats.last_send = Some(Instant::now());
    }

    /// Records a `PONG` arrival: updates the latency EMA from the local
    /// monotonic clock (the wire timestamp is only used to confirm this pong
    /// answers our most recent ping) and clears the pending flag.
    fn on_pong_received(&self, echoed_timestamp: u64) {
        let mut stats = self
            .stats
            .lock()
            .expect("session stats mutex is never held across a panic boundary");
        if let Some((sent_at, expected_timestamp)) = stats.awaiting_pong.take() {
            if expected_timestamp == echoed_timestamp {
                let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                let alpha = self.cfg.latency_ema_alpha;
                stats.avg_latency_ms = if stats.avg_latency_ms == 0.0 {
                    rtt_ms
                } else {
                    alpha * rtt_ms + (1.0 - alpha) * stats.avg_latency_ms
                };
            }
        }
    }

    fn check_ping_timeout(&self) -> Option<DisconnectReason> {
        let stats = self
            .stats
            .lock()
            .expect("session stats mutex is never held across a panic boundary");
        match stats.awaiting_pong {
            Some((sent_at, _)) if sent_at.elapsed() >= self.cfg.ping_timeout => {
                Some(DisconnectReason::PingTimeout)
            }
            _ => None,
        }
    }
}

fn encode_timestamp_body(timestamp: u64) -> Bytes {
    let mut buf = BytesMut::new();
    primitive::put_long(&mut buf, timestamp);
    buf.freeze()
}

fn decode_timestamp_body(body: &[u8]) -> Result<u64, ConnError> {
    let mut buf = BytesMut::from(body);
    primitive::get_long(&mut buf, "keepalive.timestamp").map_err(ConnError::from)
}

fn encode_disconnect_body(reason: DisconnectReason) -> Bytes {
    let mut buf = BytesMut::new();
    primitive::put_byte(&mut buf, reason.into());
    buf.freeze()
}

async fn write_frame(
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
    version: u8,
    packet_type: u8,
    body: Bytes,
    metrics: &Metrics,
) -> Result<(), ConnError> {
    let len = body.len();
    framed
        .send(SessionFrame {
            version,
            packet_type,
            packet_id: 0,
            body,
        })
        .await
        .map_err(ConnError::from)?;
    metrics.record_message_out(packet_type, len);
    Ok(())
}

/// Spawned once per admitted channel, right after the handshake completes.
/// Runs until the peer disconnects, a local shutdown is requested, a keep-
/// alive timer fires a disconnect, or a protocol/IO error occurs; returns
/// the reason so the caller (the Channel Manager) can record it and decide
/// whether it warrants a ban. `ready` is signalled with the live `Session`
/// handle as soon as it exists, so the manager can register it in
/// `active_channels` without waiting for the session to end.
pub async fn run(
    peer_id: NodeId,
    remote_addr: SocketAddr,
    direction: Direction,
    remote: RemoteIdentity,
    mut framed: Framed<TcpStream, SessionFrameCodec>,
    cfg: SessionConfig,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<Metrics>,
    ready: tokio::sync::oneshot::Sender<Arc<Session>>,
) -> (Arc<Session>, DisconnectReason) {
    let local_version = cfg.local_network_version;
    let (session, endpoints) = Session::new(peer_id, remote_addr, direction, remote, cfg.clone());
    let _ = ready.send(session.clone());
    let Endpoints {
        mut priority_rx,
        mut normal_rx,
        mut close_rx,
    } = endpoints;

    let mut flush_tick = interval(FLUSH_INTERVAL);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_idle_check = Instant::now() + cfg.writer_idle_timeout;

    let reason = loop {
        tokio::select! {
            biased;

            Some(reason) = close_rx.recv() => {
                let _ = write_frame(&mut framed, local_version, DISCONNECT, encode_disconnect_body(reason), &metrics).await;
                break reason;
            }

            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        metrics.record_message_in(frame.packet_type, frame.body.len());
                        match handle_inbound(&session, &mut framed, frame, &handlers, &metrics, local_version).await {
                            Ok(None) => {}
                            Ok(Some(reason)) => break reason,
                            Err(_) => break DisconnectReason::NetworkError,
                        }
                    }
                    Some(Err(e)) => {
                        warn!(peer = %session.peer_id, error = %e, "session read error");
                        break DisconnectReason::NetworkError;
                    }
                    None => {
                        debug!(peer = %session.peer_id, "peer closed the connection");
                        break DisconnectReason::Requested;
                    }
                }
            }

            _ = flush_tick.tick() => {
                if let Err(_) = flush_queues(&session, &mut framed, &mut priority_rx, &mut normal_rx, &metrics, local_version).await {
                    break DisconnectReason::NetworkError;
                }
            }

            _ = sleep_until(next_idle_check) => {
                next_idle_check = Instant::now() + cfg.writer_idle_timeout;
                if session.idle_for(cfg.writer_idle_timeout) {
                    let timestamp = now_unix();
                    if write_frame(&mut framed, local_version, PING, encode_timestamp_body(timestamp), &metrics).await.is_err() {
                        break DisconnectReason::NetworkError;
                    }
                    session.mark_ping_sent(timestamp);
                }
            }
        }

        if let Some(reason) = session.check_ping_timeout() {
            break reason;
        }
    };

    (session, reason)
}

/// Drains up to `FLUSH_BATCH` frames from the prioritized queue, then the
/// normal queue, matching the "prioritized first" drain order (§4.E).
async fn flush_queues(
    session: &Arc<Session>,
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
    priority_rx: &mut mpsc::Receiver<Outbound>,
    normal_rx: &mut mpsc::Receiver<Outbound>,
    metrics: &Metrics,
    local_version: u8,
) -> Result<(), ConnError> {
    let mut sent = 0;
    while sent < FLUSH_BATCH {
        let item = match priority_rx.try_recv() {
            Ok(item) => item,
            Err(mpsc::error::TryRecvError::Empty) => match normal_rx.try_recv() {
                Ok(item) => item,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            },
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        };
        write_frame(framed, local_version, item.packet_type, item.body, metrics).await?;
        sent += 1;
    }
    if sent > 0 {
        session.touch_send();
    }
    Ok(())
}

async fn handle_inbound(
    session: &Arc<Session>,
    framed: &mut Framed<TcpStream, SessionFrameCodec>,
    frame: SessionFrame,
    handlers: &Arc<HandlerRegistry>,
    metrics: &Metrics,
    local_version: u8,
) -> Result<Option<DisconnectReason>, ConnError> {
    match frame.packet_type {
        DISCONNECT => {
            let mut buf = BytesMut::from(&frame.body[..]);
            let reason = primitive::get_byte(&mut buf, "disconnect.reason")
                .map(DisconnectReason::from)
                .unwrap_or(DisconnectReason::InvalidReason);
            debug!(peer = %session.peer_id, %reason, "peer requested disconnect");
            Ok(Some(reason))
        }
        PING => {
            let timestamp = decode_timestamp_body(&frame.body)?;
            write_frame(
                framed,
                local_version,
                PONG,
                encode_timestamp_body(timestamp),
                metrics,
            )
            .await?;
            session.touch_send();
            Ok(None)
        }
        PONG => {
            let timestamp = decode_timestamp_body(&frame.body)?;
            session.on_pong_received(timestamp);
            Ok(None)
        }
        code if crate::codec::HOST_CODE_RANGE.contains(&code) => {
            handlers.dispatch(session.peer_id, code, frame.body).await;
            Ok(None)
        }
        code => {
            debug!(peer = %session.peer_id, code, "dropping frame with unrecognized session code");
            Ok(Some(DisconnectReason::ProtocolError))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_remote() -> RemoteIdentity {
        RemoteIdentity {
            peer_id: NodeId::zero(),
            listen_port: 30303,
            client_id: "kadlink/test".to_string(),
            capabilities: vec![],
            latest_block_number: 0,
            node_tag: String::new(),
            network_version: 1,
        }
    }

    fn test_cfg() -> SessionConfig {
        SessionConfig {
            writer_idle_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(20),
            send_queue_capacity: 4,
            latency_ema_alpha: 0.25,
            local_network_version: 1,
        }
    }

    #[test]
    fn priority_classification_matches_spec_set() {
        assert!(is_priority(PING));
        assert!(is_priority(PONG));
        assert!(is_priority(DISCONNECT));
        assert!(!is_priority(0x20));
    }

    #[test]
    fn send_queue_overflow_requests_busy_close() {
        let (session, mut endpoints) = Session::new(
            NodeId::zero(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            Direction::Outbound,
            test_remote(),
            test_cfg(),
        );
        for _ in 0..4 {
            session.send(0x20, Bytes::from_static(b"x")).unwrap();
        }
        assert!(session.send(0x20, Bytes::from_static(b"x")).is_err());
        assert_eq!(
            endpoints.close_rx.try_recv().unwrap(),
            DisconnectReason::Busy
        );
    }

    #[test]
    fn pong_updates_latency_ema_only_for_matching_timestamp() {
        let (session, _endpoints) = Session::new(
            NodeId::zero(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            Direction::Outbound,
            test_remote(),
            test_cfg(),
        );
        session.mark_ping_sent(100);
        session.on_pong_received(999);
        assert_eq!(session.avg_latency_ms(), 0.0);

        session.mark_ping_sent(100);
        session.on_pong_received(100);
        assert!(session.avg_latency_ms() >= 0.0);
    }
}
