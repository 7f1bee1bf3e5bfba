//! Connection-pipeline error type and the wire-coded disconnect reasons
//! carried in a `DISCONNECT` frame, grounded on `rlpx::p2p::DisconnectReason`
//! (ordinal-stable enum with a `Display` and a `From<u8>` round trip) but
//! enumerating this crate's own admission and keep-alive outcomes (§4.E,
//! §4.F) instead of devp2p's.

use crate::codec::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] ParseError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),
    #[error("signature verification failed")]
    BadSignature,
    #[error("remote peer_id does not match the address recovered from its signature")]
    IdentityMismatch,
    #[error("outbound send queue is full")]
    QueueFull,
    #[error("channel is closed")]
    Closed,
}

/// Reasons a session channel is closed. Ordinal values are wire-stable: they
/// travel inside a `DISCONNECT` frame body, so existing values are never
/// renumbered, only appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    Requested = 0x00,
    NetworkError = 0x01,
    ProtocolError = 0x02,
    TimeBanned = 0x03,
    TooManyPeers = 0x04,
    MaxConnectionsSameIp = 0x05,
    DuplicatePeer = 0x06,
    DifferentVersion = 0x07,
    HandshakeFailed = 0x08,
    PingTimeout = 0x09,
    Busy = 0x0a,
    ClientQuitting = 0x0b,
    InvalidReason = 0xff,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::TimeBanned => "remote is time-banned",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::MaxConnectionsSameIp => "too many connections from this ip",
            DisconnectReason::DuplicatePeer => "duplicate peer",
            DisconnectReason::DifferentVersion => "incompatible network id or version",
            DisconnectReason::HandshakeFailed => "handshake failed",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::Busy => "send queue overflow",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::InvalidReason => "invalid disconnect reason",
        };
        f.write_str(s)
    }
}

impl From<u8> for DisconnectReason {
    fn from(value: u8) -> Self {
        match value {
            0x00 => DisconnectReason::Requested,
            0x01 => DisconnectReason::NetworkError,
            0x02 => DisconnectReason::ProtocolError,
            0x03 => DisconnectReason::TimeBanned,
            0x04 => DisconnectReason::TooManyPeers,
            0x05 => DisconnectReason::MaxConnectionsSameIp,
            0x06 => DisconnectReason::DuplicatePeer,
            0x07 => DisconnectReason::DifferentVersion,
            0x08 => DisconnectReason::HandshakeFailed,
            0x09 => DisconnectReason::PingTimeout,
            0x0a => DisconnectReason::Busy,
            0x0b => DisconnectReason::ClientQuitting,
            _ => DisconnectReason::InvalidReason,
        }
    }
}

impl From<DisconnectReason> for u8 {
    fn from(value: DisconnectReason) -> Self {
        value as u8
    }
}

impl DisconnectReason {
    /// Reasons reflecting hostile rather than incidental behavior — these
    /// drive a ban via the reputation store (§4.F Disconnect).
    pub fn is_hostile(self) -> bool {
        matches!(
            self,
            DisconnectReason::ProtocolError | DisconnectReason::HandshakeFailed
        )
    }
}
