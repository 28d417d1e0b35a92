//! Contracts between the manager and the proxies it runs.
//!
//! A [`ProxyProvider`] gives a proxy its network identity (where its ports
//! listen and which certificate it presents). The manager only ever talks to
//! the resulting [`Proxy`] through this trait.

use crate::model::{ProxyConfig, ProxyEvent};
use crate::server::Handler;
use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::sync::Arc;

/// Receives the lifecycle events of one proxy
pub type StatusSink = Arc<dyn Fn(ProxyEvent) + Send + Sync>;

/// A running instance binding one hostname to its ports
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Read-only view of the configuration the proxy was built from
    fn config(&self) -> &ProxyConfig;

    /// Handler the LAN listener dispatches this proxy's requests to
    fn lan_handler(&self) -> anyhow::Result<Handler>;

    /// Certificate to present for `hostname` during a LAN TLS handshake
    fn tls_certificate(&self, hostname: &str) -> anyhow::Result<Arc<CertifiedKey>>;

    /// Advertised public URL. May be empty or a bare scheme.
    fn url(&self) -> String;

    /// Bind and serve every port. Failures are reported via the status sink.
    async fn start(&self);

    /// Stop every port; returns once they have shut down
    async fn close(&self);
}

/// Issues network identities for proxies
pub trait ProxyProvider: Send + Sync {
    /// Build (but do not start) a proxy. `status` is wired before the proxy
    /// exists anywhere else, so no event can be missed.
    fn new_proxy(&self, config: ProxyConfig, status: StatusSink) -> anyhow::Result<Arc<dyn Proxy>>;
}

/// Whether two handles refer to the same proxy instance
pub fn same_proxy(a: &Arc<dyn Proxy>, b: &Arc<dyn Proxy>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
