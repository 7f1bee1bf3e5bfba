use std::time::SystemTimeError;
use thiserror::Error;

use crate::conn::error::ConnError;
use crate::discovery::DiscoveryError;
use crate::channel::ChannelError;

/// Crate-wide error type returned across the public API surface
/// (`start`, `stop`, `send`, `register_handler`).
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnError),

    #[error("channel manager error: {0}")]
    Channel(#[from] ChannelError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SystemTime(#[from] SystemTimeError),

    #[error("service is already running")]
    AlreadyRunning,

    #[error("service is not running")]
    NotRunning,

    #[error("a handler is already registered for code {0:#04x}")]
    HandlerAlreadyRegistered(u8),
}
