//! Error types for the WarpGrid front door.

use std::io;

use thiserror::Error;
use warpgrid_registry::RegistryError;

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors raised while serving or dialing.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid export: {0}")]
    InvalidExport(String),

    #[error("malformed mux header: {0}")]
    Header(String),

    #[error("no non-loopback IPv4 address found on this host")]
    NoLocalAddress,

    #[error("port server already running: {0}")]
    PortServerRunning(String),

    #[error("upstream HTTP error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
