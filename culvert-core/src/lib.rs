//! Shared protocol, identity hashing, and errors for the culvert tunnel.
//!
//! This crate holds everything the client and server agree on: the
//! three-frame exchange codec, the registration greeting, pool-key hashing,
//! and the common error type.

pub mod auth;
pub mod error;
pub mod protocol;

pub use auth::{hash_key_id, secrets_match};
pub use error::TunnelError;
pub use protocol::{
    encode_headers, parse_headers, Greeting, Headers, RequestHead, ResponseHead, TunnelStatus,
    CLIENT_ERROR_CODE, CLIENT_ID_HEADER, HANDSHAKE_TIMEOUT, PROXY_ERROR_CODE, SECRET_HEADER,
};
