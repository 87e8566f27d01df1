//! deadbeef two-hop forward proxy
//!
//! A local agent accepts browser proxy traffic and forwards it to a remote
//! agent over framed, authenticated legs: plain HTTP requests over an h2c
//! leg, CONNECT tunnels over a TCP (optionally TLS) leg.

pub mod auth;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod gate;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod responder;
pub mod route;
pub mod server;
pub mod stream;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use client::LocalAgent;
pub use error::ProxyError;
pub use server::RemoteAgent;
