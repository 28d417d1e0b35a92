//! Proxy providers shipped with the binary

pub mod local;

pub use local::{LocalProvider, LocalProxy, LocalSettings};
