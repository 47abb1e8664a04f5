//! Proxy error types

use thiserror::Error;

/// Proxy engine errors.
///
/// Only configuration and bind-time failures are fatal; everything that can
/// happen while traffic flows (malformed frames, authentication failures,
/// table overflow, transport errors) is handled locally with a log line and
/// a dropped packet or a closed session.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// RADIUS packet encoding/decoding error
    #[error("Packet error: {0}")]
    Packet(#[from] radproxy_proto::PacketError),

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
