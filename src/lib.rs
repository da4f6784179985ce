//! wsgate - workspace access gateway
//!
//! This library provides the edge of a remote development platform:
//! - Terminates TLS for several certificates, picked by SNI
//! - Routes `app--agent--workspace--user` subdomains to workspace agents
//! - Verifies signed app tokens before any agent is contacted
//! - Keeps one shared, TTL-evicted connection per agent
//! - Streams HTTP and WebSocket traffic to the agent
//! - Applies a global rate limit and the usual edge headers

pub mod agent;
pub mod body;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod hostname;
pub mod middleware;
pub mod proxy;
pub mod ratelimit;
pub mod routes;
pub mod server;
pub mod tls;
pub mod token;
