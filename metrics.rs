//! Lock-free metrics sink. Updated from inside the core via atomics and
//! `prometheus` collectors; scraping it over HTTP is the host's job, not
//! this crate's.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

use crate::conn::error::DisconnectReason;
use crate::conn::session::Direction;

pub struct Metrics {
    registry: Registry,

    /// Total established channels, either direction.
    pub active_connections: IntGauge,
    /// Channels this node dialed out.
    pub active_outbound_connections: IntGauge,
    /// Channels accepted from an inbound listener.
    pub active_inbound_connections: IntGauge,
    pub connections_established: IntCounter,
    pub connections_closed: IntCounter,
    pub handshake_success: IntCounter,
    pub handshake_failure: IntCounter,

    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub messages_in_by_code: Mutex<BTreeMap<u8, u64>>,
    pub messages_out_by_code: Mutex<BTreeMap<u8, u64>>,
    pub disconnects_by_reason: Mutex<BTreeMap<String, u64>>,

    pub bans_active: AtomicI64,
    pub reputation_histogram: Histogram,

    pub routing_table_size: IntGauge,
    pub lookup_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_connections = IntGauge::new(
            "p2p_active_connections",
            "Number of established session channels",
        )
        .expect("metric name is a valid prometheus identifier");
        let active_outbound_connections = IntGauge::new(
            "p2p_active_outbound_connections",
            "Number of established session channels this node dialed",
        )
        .expect("metric name is a valid prometheus identifier");
        let active_inbound_connections = IntGauge::new(
            "p2p_active_inbound_connections",
            "Number of established session channels accepted from a listener",
        )
        .expect("metric name is a valid prometheus identifier");
        let connections_established = IntCounter::new(
            "p2p_connections_established_total",
            "Total sessions that completed the handshake",
        )
        .expect("metric name is a valid prometheus identifier");
        let connections_closed = IntCounter::new(
            "p2p_connections_closed_total",
            "Total sessions that were closed",
        )
        .expect("metric name is a valid prometheus identifier");
        let handshake_success = IntCounter::new(
            "p2p_handshake_success_total",
            "Total handshakes that completed successfully",
        )
        .expect("metric name is a valid prometheus identifier");
        let handshake_failure = IntCounter::new(
            "p2p_handshake_failure_total",
            "Total handshakes that failed validation or timed out",
        )
        .expect("metric name is a valid prometheus identifier");
        let bans_active = IntGauge::new("p2p_bans_active", "Currently active bans")
            .expect("metric name is a valid prometheus identifier");
        let reputation_histogram = Histogram::with_opts(
            HistogramOpts::new(
                "p2p_reputation_score",
                "Distribution of known-peer reputation scores",
            )
            .buckets(vec![0.0, 20.0, 50.0, 80.0, 100.0, 120.0, 150.0, 180.0, 200.0]),
        )
        .expect("static histogram buckets are valid");
        let routing_table_size = IntGauge::new(
            "p2p_routing_table_size",
            "Total node records held across all k-buckets",
        )
        .expect("metric name is a valid prometheus identifier");
        let lookup_latency = Histogram::with_opts(HistogramOpts::new(
            "p2p_lookup_latency_seconds",
            "Wall-clock duration of iterative Kademlia lookups",
        ))
        .expect("default histogram buckets are valid");

        for collector in [
            Box::new(active_connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(active_outbound_connections.clone()),
            Box::new(active_inbound_connections.clone()),
            Box::new(connections_established.clone()),
            Box::new(connections_closed.clone()),
            Box::new(handshake_success.clone()),
            Box::new(handshake_failure.clone()),
            Box::new(bans_active.clone()),
            Box::new(reputation_histogram.clone()),
            Box::new(routing_table_size.clone()),
            Box::new(lookup_latency.clone()),
        ] {
            registry
                .register(collector)
                .expect("collector is registered at most once");
        }

        Metrics {
            registry,
            active_connections,
            active_outbound_connections,
            active_inbound_connections,
            connections_established,
            connections_closed,
            handshake_success,
            handshake_failure,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in_by_code: Mutex::new(BTreeMap::new()),
            messages_out_by_code: Mutex::new(BTreeMap::new()),
            disconnects_by_reason: Mutex::new(BTreeMap::new()),
            bans_active,
            reputation_histogram,
            routing_table_size,
            lookup_latency,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_connection_established(&self) {
        self.active_connections.inc();
        self.connections_established.inc();
        self.handshake_success.inc();
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failure.inc();
    }

    pub fn record_connection_closed(&self, reason: DisconnectReason) {
        self.active_connections.dec();
        self.connections_closed.inc();
        let mut by_reason = self
            .disconnects_by_reason
            .lock()
            .expect("metrics mutex is never held across a panic boundary");
        *by_reason.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_message_in(&self, code: u8, len: usize) {
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
        *self
            .messages_in_by_code
            .lock()
            .expect("metrics mutex is never held across a panic boundary")
            .entry(code)
            .or_insert(0) += 1;
    }

    pub fn record_message_out(&self, code: u8, len: usize) {
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
        *self
            .messages_out_by_code
            .lock()
            .expect("metrics mutex is never held across a panic boundary")
            .entry(code)
            .or_insert(0) += 1;
    }

    pub fn record_ban_created(&self) {
        self.bans_active.inc();
    }

    pub fn record_ban_expired(&self) {
        self.bans_active.dec();
    }

    pub fn observe_reputation(&self, score: i32) {
        self.reputation_histogram.observe(score as f64);
    }

    pub fn set_routing_table_size(&self, size: usize) {
        self.routing_table_size.set(size as i64);
    }

    pub fn observe_lookup_latency(&self, seconds: f64) {
        self.lookup_latency.observe(seconds);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_on_lifecycle_events() {
        let metrics = Metrics::new();
        metrics.record_connection_established();
        assert_eq!(metrics.active_connections.get(), 1);
        metrics.record_connection_closed(DisconnectReason::ClientQuitting);
        assert_eq!(metrics.active_connections.get(), 0);
        assert_eq!(metrics.connections_closed.get(), 1);
    }
}
