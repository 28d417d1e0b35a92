//! Local proxy provider.
//!
//! Gives each proxy a network identity on this host: every port is bound on
//! the configured address, and HTTPS ports terminate TLS with a self-signed
//! certificate covering the proxy's hostname and, when a domain is
//! configured, its fully qualified name.
//!
//! All proxies of one provider share the bind address, so targets served by
//! the same local provider must publish distinct ports. A proxy whose port is
//! already taken reports [`ProxyStatus::Error`] from `start`.

use crate::hostname::normalize_hostname;
use crate::model::{ProxyConfig, ProxyEvent, ProxyStatus};
use crate::port::{Port, PortListener};
use crate::proxy::{Proxy, ProxyProvider, StatusSink};
use crate::server::Handler;
use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rcgen::{generate_simple_self_signed, CertifiedKey as GeneratedCert};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Address every port is bound on
    pub bind: IpAddr,
    /// Domain appended to hostnames to form the advertised FQDN
    pub domain: Option<String>,
    /// Wrap ports in the access-log layer
    pub access_log: bool,
    /// Bound on draining a proxy's ports when it closes
    pub shutdown_timeout: Duration,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            domain: None,
            access_log: false,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

pub struct LocalProvider {
    settings: LocalSettings,
    /// Parent of every proxy token
    token: CancellationToken,
}

impl LocalProvider {
    pub fn new(settings: LocalSettings) -> Self {
        Self {
            settings,
            token: CancellationToken::new(),
        }
    }

    /// Build a proxy without erasing its type
    pub fn build(&self, config: ProxyConfig, status: StatusSink) -> anyhow::Result<Arc<LocalProxy>> {
        let id = normalize_hostname(&config.hostname);
        if id.is_empty() {
            anyhow::bail!("invalid proxy hostname '{}'", config.hostname);
        }

        let fqdn = self
            .settings
            .domain
            .as_deref()
            .map(|domain| domain.trim_matches('.'))
            .filter(|domain| !domain.is_empty())
            .map(|domain| format!("{}.{}", id, domain.to_ascii_lowercase()));

        let mut names = vec![id.clone()];
        names.extend(fqdn.clone());
        let certificate = self_signed_certificate(names)
            .with_context(|| format!("generating certificate for {}", id))?;

        let token = self.token.child_token();
        let mut ports = Vec::with_capacity(config.ports.len());
        for port_config in &config.ports {
            let port = if port_config.is_redirect {
                Port::new_redirect(&token, port_config.clone())
            } else {
                Port::new_proxy(&token, port_config.clone(), self.settings.access_log, None)
            }
            .with_context(|| format!("configuring port {} of {}", port_config, id))?;
            ports.push(Arc::new(port));
        }

        debug!(proxy = %id, ports = ports.len(), fqdn = ?fqdn, "Built local proxy");

        Ok(Arc::new(LocalProxy {
            config,
            id,
            fqdn,
            bind: self.settings.bind,
            shutdown_timeout: self.settings.shutdown_timeout,
            status,
            token,
            certificate,
            ports,
            bound: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

impl ProxyProvider for LocalProvider {
    fn new_proxy(&self, config: ProxyConfig, status: StatusSink) -> anyhow::Result<Arc<dyn Proxy>> {
        let proxy: Arc<dyn Proxy> = self.build(config, status)?;
        Ok(proxy)
    }
}

impl Drop for LocalProvider {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A proxy whose ports listen on this host
pub struct LocalProxy {
    config: ProxyConfig,
    id: String,
    fqdn: Option<String>,
    bind: IpAddr,
    shutdown_timeout: Duration,
    status: StatusSink,
    token: CancellationToken,
    certificate: Arc<CertifiedKey>,
    ports: Vec<Arc<Port>>,
    bound: Mutex<Vec<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalProxy {
    fn emit(&self, status: ProxyStatus) {
        (self.status)(ProxyEvent::new(self.id.clone(), status));
    }

    /// Bound address of each port in configuration order; empty until started
    pub fn port_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn tls_acceptor(&self) -> anyhow::Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCertificate(Arc::clone(&self.certificate))));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    async fn bind_all(&self) -> anyhow::Result<Vec<PortListener>> {
        let acceptor = self.tls_acceptor()?;
        let mut listeners = Vec::with_capacity(self.ports.len());
        for port in &self.ports {
            let addr = SocketAddr::new(self.bind, port.config().proxy_port);
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {} for {}", addr, port.config()))?;
            listeners.push(if port.config().is_tls() {
                PortListener::tls(listener, acceptor.clone())
            } else {
                PortListener::plain(listener)
            });
        }
        Ok(listeners)
    }
}

#[async_trait]
impl Proxy for LocalProxy {
    fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn lan_handler(&self) -> anyhow::Result<Handler> {
        self.ports
            .iter()
            .find(|port| port.config().is_tls())
            .or_else(|| self.ports.first())
            .map(|port| port.handler())
            .with_context(|| format!("proxy {} has no ports", self.id))
    }

    fn tls_certificate(&self, hostname: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let host = normalize_hostname(hostname);
        if host != self.id && Some(&host) != self.fqdn.as_ref() {
            anyhow::bail!("proxy {} has no certificate for {}", self.id, host);
        }
        Ok(Arc::clone(&self.certificate))
    }

    fn url(&self) -> String {
        self.fqdn
            .as_ref()
            .map(|fqdn| format!("https://{}", fqdn))
            .unwrap_or_default()
    }

    async fn start(&self) {
        // A proxy closed before it started stays closed
        if self.token.is_cancelled() {
            debug!(proxy = %self.id, "Proxy already closed, not starting");
            return;
        }
        self.emit(ProxyStatus::Starting);

        let listeners = match self.bind_all().await {
            Ok(listeners) => listeners,
            Err(e) => {
                error!(proxy = %self.id, error = %format!("{:#}", e), "Failed to start proxy");
                self.emit(ProxyStatus::Error);
                return;
            }
        };

        // close() cancels before it takes this lock, so either it sees these
        // tasks or this sees the cancellation
        let mut tasks = self.tasks.lock();
        if self.token.is_cancelled() {
            debug!(proxy = %self.id, "Proxy closed while binding, releasing ports");
            self.emit(ProxyStatus::Stopped);
            return;
        }

        *self.bound.lock() = listeners.iter().filter_map(|l| l.local_addr().ok()).collect();
        for (port, listener) in self.ports.iter().zip(listeners) {
            let port = Arc::clone(port);
            let status = Arc::clone(&self.status);
            let id = self.id.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = port.start_with_listener(listener).await {
                    error!(proxy = %id, port = %port.config(), error = %e, "Port stopped with error");
                    status(ProxyEvent::new(id, ProxyStatus::Error));
                }
            }));
        }

        info!(proxy = %self.id, ports = self.ports.len(), url = %self.url(), "Proxy running");
        self.emit(ProxyStatus::Running);
    }

    async fn close(&self) {
        self.emit(ProxyStatus::Stopping);

        let closing = join_all(self.ports.iter().map(|port| port.close()));
        tokio::pin!(closing);
        let results = tokio::select! {
            results = &mut closing => results,
            _ = tokio::time::sleep(self.shutdown_timeout) => {
                warn!(proxy = %self.id, "Ports did not drain in time, cancelling");
                self.token.cancel();
                closing.await
            }
        };
        self.token.cancel();

        for (port, result) in self.ports.iter().zip(results) {
            if let Err(e) = result {
                warn!(proxy = %self.id, port = %port.config(), error = %e, "Error closing port");
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        join_all(tasks).await;

        info!(proxy = %self.id, "Proxy stopped");
        self.emit(ProxyStatus::Stopped);
    }
}

/// Serves one certificate regardless of SNI
#[derive(Debug)]
struct FixedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Generate a self-signed certificate for `names` as a rustls signing identity
pub fn self_signed_certificate(names: Vec<String>) -> anyhow::Result<Arc<CertifiedKey>> {
    let GeneratedCert { cert, key_pair } = generate_simple_self_signed(names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}
