use thiserror::Error;
use tokio_rustls::rustls;

use crate::events::RejectKind;

/// Crate-wide error type capturing common failure cases.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation issued while the session is in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Input parameters failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Networking failure while communicating with the server.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// TLS handshake or certificate validation failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    /// Protocol-level violation: oversized frame, malformed varint, or a
    /// payload that fails to parse.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Server rejected the authentication attempt.
    #[error("server rejected connection ({kind:?}): {reason}")]
    Rejected { kind: RejectKind, reason: String },
    /// A read deadline elapsed without any data from the server.
    #[error("operation timed out: {0}")]
    Timeout(&'static str),
    /// Audio codec failure; never fatal to the session.
    #[error("audio error: {0}")]
    Audio(String),
}
