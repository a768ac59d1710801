//! Error type shared by the tunnel client and server.

use thiserror::Error;

use crate::protocol::{CLIENT_ERROR_CODE, PROXY_ERROR_CODE};

/// Failures surfaced by the tunnel machinery.
///
/// Transient errors close only the affected tunnel; nothing here ever tears
/// down a pool or the server.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The registration secret did not match.
    #[error("invalid secret key")]
    InvalidKey,

    /// A greeting or frame could not be parsed.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// No pool, an empty pool, or a dispatch miss for the named client.
    #[error("no proxy target: {0}")]
    NoProxyTarget(String),

    /// The configured id header was absent from a proxied request.
    #[error("no client identified")]
    NoClientID,

    /// A socket write failed mid-exchange.
    #[error("tunnel write failed: {0}")]
    TunnelWrite(String),

    /// The WebSocket dial exceeded the handshake timeout.
    #[error("websocket handshake timed out")]
    HandshakeTimeout,

    /// The client-side handler or upstream call failed.
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// A frame arrived out of order or with the wrong message type.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Transport-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// The HTTP status reported to the original requester when this error
    /// occurs before response headers were sent.
    pub fn http_status(&self) -> u16 {
        match self {
            TunnelError::UpstreamError(_) => CLIENT_ERROR_CODE,
            _ => PROXY_ERROR_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(TunnelError::InvalidKey.http_status(), 526);
        assert_eq!(TunnelError::NoProxyTarget("x".into()).http_status(), 526);
        assert_eq!(TunnelError::NoClientID.http_status(), 526);
        assert_eq!(
            TunnelError::UpstreamError("boom".into()).http_status(),
            527
        );
    }

    #[test]
    fn display_carries_detail() {
        let err = TunnelError::NoProxyTarget("clientA".into());
        assert!(err.to_string().contains("no proxy target"));
        assert!(err.to_string().contains("clientA"));
    }
}
