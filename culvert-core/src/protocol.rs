//! Wire protocol for tunneled HTTP exchanges.
//!
//! Every exchange over a tunnel is three logical messages in each direction:
//! a head frame, a headers frame (requests only; responses fold the headers
//! into the head), and zero or more binary body frames closed by an empty
//! binary terminator. Frames of one exchange never interleave with another.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Header carrying the shared secret on the registration request.
pub const SECRET_HEADER: &str = "x-culvert-secret";

/// Default header naming the target client on proxied requests.
pub const CLIENT_ID_HEADER: &str = "x-culvert-client";

/// HTTP status returned for proxy-side failures (no tunnel, bad key,
/// tunneling failure).
pub const PROXY_ERROR_CODE: u16 = 526;

/// HTTP status returned when the client-side handler or upstream failed.
pub const CLIENT_ERROR_CODE: u16 = 527;

/// How long a WebSocket dial may take before it counts as a connect failure.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket close code sent when the peer violates frame ordering.
pub const PROTOCOL_VIOLATION: u16 = 1002;

/// Header map as it travels on the wire: `{"Name":["v1","v2"]}`.
///
/// A `BTreeMap` keeps the encoded form deterministic.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Lifecycle of a tunnel on either side of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// Dialing or awaiting the registration handshake.
    Connecting,
    /// Registered and available to carry an exchange.
    Idle,
    /// Carrying exactly one HTTP exchange.
    Running,
    /// Terminal; the socket is gone or poisoned.
    Closed,
}

impl TunnelStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            TunnelStatus::Connecting => 0,
            TunnelStatus::Idle => 1,
            TunnelStatus::Running => 2,
            TunnelStatus::Closed => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelStatus::Connecting,
            1 => TunnelStatus::Idle,
            2 => TunnelStatus::Running,
            _ => TunnelStatus::Closed,
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::Connecting => write!(f, "connecting"),
            TunnelStatus::Idle => write!(f, "idle"),
            TunnelStatus::Running => write!(f, "running"),
            TunnelStatus::Closed => write!(f, "closed"),
        }
    }
}

/// First frame of a proxied request: `"<METHOD>\t<URL>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub url: String,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
        }
    }

    /// Encode as the text head frame.
    pub fn encode(&self) -> String {
        format!("{}\t{}", self.method, self.url)
    }

    /// Parse a text head frame. The frame must contain exactly one tab and a
    /// non-empty method and URL.
    pub fn parse(frame: &str) -> Result<Self, TunnelError> {
        let mut parts = frame.splitn(2, '\t');
        let method = parts.next().unwrap_or_default();
        let url = parts
            .next()
            .ok_or_else(|| TunnelError::InvalidData("request head has no tab separator".into()))?;

        if method.is_empty() || url.is_empty() || url.contains('\t') {
            return Err(TunnelError::InvalidData(format!(
                "malformed request head: {frame:?}"
            )));
        }

        Ok(Self {
            method: method.to_string(),
            url: url.to_string(),
        })
    }
}

/// Second frame of a proxied request: the header map as JSON.
pub fn encode_headers(headers: &Headers) -> Result<String, TunnelError> {
    serde_json::to_string(headers)
        .map_err(|err| TunnelError::InvalidData(format!("encoding headers: {err}")))
}

pub fn parse_headers(frame: &str) -> Result<Headers, TunnelError> {
    serde_json::from_str(frame)
        .map_err(|err| TunnelError::InvalidData(format!("parsing headers: {err}")))
}

/// First frame of a proxied response.
///
/// `content_length` is informational; the empty-binary body terminator is
/// authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    pub status_code: u16,
    #[serde(default)]
    pub header: Headers,
    #[serde(default)]
    pub content_length: i64,
}

impl ResponseHead {
    /// Build a head with no headers, used for synthesized error responses.
    pub fn error(status_code: u16, content_length: i64) -> Self {
        Self {
            status_code,
            header: Headers::new(),
            content_length,
        }
    }

    pub fn encode(&self) -> Result<String, TunnelError> {
        serde_json::to_string(self)
            .map_err(|err| TunnelError::InvalidData(format!("encoding response head: {err}")))
    }

    pub fn parse(frame: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(frame)
            .map_err(|err| TunnelError::InvalidData(format!("parsing response head: {err}")))
    }
}

/// The first message a client sends after the WebSocket upgrade:
/// `"<clientID>_<idleSize>_<maxSize>"`.
///
/// Exactly two underscores; the client id therefore cannot contain `_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub client_id: String,
    pub idle_size: usize,
    pub max_size: usize,
}

impl Greeting {
    pub fn encode(&self) -> String {
        format!("{}_{}_{}", self.client_id, self.idle_size, self.max_size)
    }

    pub fn parse(message: &str) -> Result<Self, TunnelError> {
        let parts: Vec<&str> = message.split('_').collect();
        if parts.len() != 3 {
            return Err(TunnelError::InvalidData(
                "greeting separator count is wrong".into(),
            ));
        }

        let idle_size = parts[1]
            .parse()
            .map_err(|_| TunnelError::InvalidData(format!("greeting idle size: {:?}", parts[1])))?;
        let max_size = parts[2]
            .parse()
            .map_err(|_| TunnelError::InvalidData(format!("greeting max size: {:?}", parts[2])))?;

        if parts[0].is_empty() {
            return Err(TunnelError::InvalidData("greeting client id is empty".into()));
        }

        Ok(Self {
            client_id: parts[0].to_string(),
            idle_size,
            max_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_head_round_trip() {
        for method in ["GET", "POST", "PUT", "DELETE"] {
            let head = RequestHead::new(method, "http://upstream:8080/hello?x=1");
            let decoded = RequestHead::parse(&head.encode()).unwrap();
            assert_eq!(decoded, head);
        }
    }

    #[test]
    fn request_head_rejects_malformed() {
        assert!(RequestHead::parse("GET http://no-tab").is_err());
        assert!(RequestHead::parse("\thttp://empty-method").is_err());
        assert!(RequestHead::parse("GET\t").is_err());
        assert!(RequestHead::parse("GET\ta\tb").is_err());
    }

    #[test]
    fn headers_round_trip_preserves_multi_values() {
        let mut headers = Headers::new();
        headers.insert("Accept".into(), vec!["text/html".into(), "*/*".into()]);
        headers.insert("Host".into(), vec!["example.com".into()]);

        let encoded = encode_headers(&headers).unwrap();
        assert_eq!(parse_headers(&encoded).unwrap(), headers);
    }

    #[test]
    fn response_head_uses_wire_field_names() {
        let head = ResponseHead {
            status_code: 200,
            header: Headers::new(),
            content_length: 12,
        };

        let encoded = head.encode().unwrap();
        assert!(encoded.contains("\"statusCode\":200"));
        assert!(encoded.contains("\"contentLength\":12"));
        assert_eq!(ResponseHead::parse(&encoded).unwrap(), head);
    }

    #[test]
    fn response_head_tolerates_missing_optional_fields() {
        let head = ResponseHead::parse(r#"{"statusCode":204}"#).unwrap();
        assert_eq!(head.status_code, 204);
        assert_eq!(head.content_length, 0);
        assert!(head.header.is_empty());
    }

    #[test]
    fn greeting_round_trip() {
        let greeting = Greeting {
            client_id: "clientA".into(),
            idle_size: 10,
            max_size: 100,
        };
        assert_eq!(greeting.encode(), "clientA_10_100");
        assert_eq!(Greeting::parse("clientA_10_100").unwrap(), greeting);
    }

    #[test]
    fn greeting_rejects_bad_input() {
        // Non-numeric size field.
        assert!(Greeting::parse("clientA_ten_100").is_err());
        // Wrong separator count.
        assert!(Greeting::parse("clientA_10").is_err());
        assert!(Greeting::parse("client_A_10_100").is_err());
        assert!(Greeting::parse("_10_100").is_err());
    }

    #[test]
    fn status_survives_u8_conversion() {
        for status in [
            TunnelStatus::Connecting,
            TunnelStatus::Idle,
            TunnelStatus::Running,
            TunnelStatus::Closed,
        ] {
            assert_eq!(TunnelStatus::from_u8(status.as_u8()), status);
        }
    }
}
