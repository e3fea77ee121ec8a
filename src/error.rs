//! Error types for the proxy data plane.

use crate::codec::StreamResetReason;
use std::io;
use thiserror::Error;

/// Errors that can occur during proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptConnection(#[source] io::Error),

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// HTTP message construction error.
    #[error("http build error: {0}")]
    HttpBuild(#[from] http::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A codec refused an encode operation.
    #[error("codec error: {0}")]
    Codec(String),

    /// The downstream or upstream stream was reset mid-flight.
    #[error("stream reset: {reason:?}")]
    StreamReset { reason: StreamResetReason },

    /// No endpoints configured for a cluster.
    #[error("no upstream endpoints in cluster {cluster}")]
    NoUpstream { cluster: String },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
