//! Culvert client: keep a pool of outbound WebSocket tunnels registered with
//! a public culvert server, and replay the HTTP requests it sends down them
//! against a local handler or any reachable upstream.
//!
//! The embedding application builds a [`Config`] (optionally installing a
//! [`RequestHandler`]), then drives a [`Client`].

pub mod client;
pub mod config;
pub mod handler;
pub mod pool;
mod tunnel;

pub use client::Client;
pub use config::Config;
pub use handler::{ProxiedRequest, RequestHandler, ResponseSink};
pub use pool::{PoolHandle, PoolSize};
