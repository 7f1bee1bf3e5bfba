//! # kadlink-p2p
//!
//! Peer-to-peer networking library for a blockchain node.
//!
//! ## Overview
//!
//! This crate implements three cooperating pieces (§1-3 of the
//! specification this crate implements):
//! - **Discovery**: a Kademlia-style DHT over UDP for finding other nodes
//!   and keeping a routing table of recently-seen, reachable peers.
//! - **Connection pipeline**: an authenticated, length-framed TCP session
//!   built on a three-step signature handshake, optional snappy
//!   compression, and a keep-alive protocol.
//! - **Channel manager**: admission control, duplicate-peer suppression,
//!   outbound-initiation maintenance, and message dispatch to host-supplied
//!   [`Handler`]s for every live session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      NodeService                          │
//! │  ┌─────────────┐   ┌──────────────┐   ┌────────────────┐ │
//! │  │  Discovery  │   │ ChannelManager│  │ HandlerRegistry │ │
//! │  │   (UDP)     │──▶│    (TCP)      │─▶│   (dispatch)    │ │
//! │  └─────────────┘   └──────────────┘   └────────────────┘ │
//! │         │                  │                              │
//! │         ▼                  ▼                              │
//! │  ┌─────────────┐   ┌──────────────┐                       │
//! │  │ RoutingTable│   │ReputationStore│                      │
//! │  └─────────────┘   └──────────────┘                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key components
//!
//! - [`node`]: the `NodeService` facade a host embeds
//! - [`discovery`]: UDP Kademlia discovery (ping/pong, find_node/neighbors)
//! - [`conn`]: handshake and per-session TCP pipeline
//! - [`channel`]: admission policy and the live-session ledger
//! - [`routing`]: the Kademlia routing table (k-buckets, XOR distance)
//! - [`reputation`]: persistent peer scoring and the ban store
//! - [`handler`]: the host-facing message dispatch trait and registry
//! - [`codec`]: wire framing for both the UDP and TCP protocols
//! - [`crypto`]: secp256k1 signing/recovery and node-id derivation
//! - [`config`]: host-supplied runtime configuration
//! - [`metrics`]: prometheus collectors for the above
//! - [`scheduler`]: named recurring maintenance jobs
//! - [`error`]: the crate-wide error type

#![allow(clippy::module_inception)]

pub mod channel;
pub mod codec;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod node;
pub mod reputation;
pub mod routing;
pub mod scheduler;
pub mod types;

pub use config::{Capability, P2PConfig};
pub use error::NetworkError;
pub use handler::Handler;
pub use node::{LifecycleState, NodeService};
pub use types::{BanReason, BanTarget, Endpoint, NodeId};
