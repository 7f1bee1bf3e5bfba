//! Connection core (§4.E): handshake, the per-session run loop, and the
//! error/reason types shared across both.

pub mod error;
pub mod handshake;
pub mod session;
