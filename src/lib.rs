//! Meshgate - dynamic reverse proxies for discovered workloads
//!
//! This library:
//! - Turns target lifecycle events from pluggable target providers into
//!   running proxies built by pluggable proxy providers
//! - Keeps a registry of live proxies and fans their status out to subscribers
//! - Multiplexes every proxy behind one shared TLS listener, choosing the
//!   certificate by SNI and the route by Host
//! - Reverse-proxies (or redirects) each published port to its upstream

pub mod config;
pub mod error;
pub mod hostname;
pub mod lan;
pub mod manager;
pub mod middleware;
pub mod model;
pub mod port;
pub mod providers;
pub mod proxy;
pub mod server;
pub mod target;
pub mod targets;

pub use error::Error;
pub use manager::ProxyManager;
