//! The shared LAN front door.
//!
//! One TLS listener serves every registered proxy. The certificate is chosen
//! by SNI during the handshake and the request is routed by its Host, both
//! through the same alias table. Many aliases may point at one proxy; they
//! are removed together by proxy identity.

use crate::error::{json_error_response, Error, ProxyErrorCode};
use crate::hostname::normalize_hostname;
use crate::port::request_host;
use crate::proxy::{same_proxy, Proxy};
use crate::server::{handler_fn, Handler, HttpServer, ProxyBody};
use hyper::{Request, Response};
use parking_lot::{Mutex, RwLock};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use url::Url;

#[derive(Clone)]
struct LanRoute {
    proxy: Arc<dyn Proxy>,
    handler: Handler,
}

/// Alias -> route table shared by the certificate resolver and the HTTP handler
#[derive(Default)]
struct RouteTable {
    routes: RwLock<HashMap<String, LanRoute>>,
}

impl RouteTable {
    fn lookup(&self, host: &str) -> (Option<LanRoute>, usize) {
        let routes = self.routes.read();
        (routes.get(host).cloned(), routes.len())
    }

    /// Point every alias at `route` in one write
    fn insert_all(&self, aliases: &BTreeSet<String>, route: LanRoute) {
        let mut routes = self.routes.write();
        for host in aliases {
            routes.insert(host.clone(), route.clone());
        }
    }

    /// Drop every alias owned by `proxy`, returning the removed aliases
    fn remove_owner(&self, proxy: &Arc<dyn Proxy>) -> Vec<String> {
        let mut removed = Vec::new();
        self.routes.write().retain(|host, route| {
            if same_proxy(&route.proxy, proxy) {
                removed.push(host.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, Error> {
        let host = normalize_hostname(server_name.unwrap_or_default());
        if host.is_empty() {
            debug!(server_name = ?server_name, "LAN listener missing SNI");
            return Err(Error::MissingSni);
        }

        let (route, route_count) = self.lookup(&host);
        let Some(route) = route else {
            debug!(server_name = ?server_name, host, route_count, "LAN listener unknown SNI host");
            return Err(Error::UnknownSniHost(host));
        };

        debug!(server_name = ?server_name, host, "LAN listener selecting TLS certificate");
        route.proxy.tls_certificate(&host).map_err(Error::Proxy)
    }

    async fn serve_http(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let raw_host = request_host(&req);
        let host = normalize_hostname(&raw_host);
        if host.is_empty() {
            debug!(raw_host, "LAN listener missing or invalid host");
            return json_error_response(ProxyErrorCode::MissingHost, "missing host");
        }

        let (route, route_count) = self.lookup(&host);
        let Some(route) = route else {
            debug!(
                host,
                method = %req.method(),
                path = %req.uri().path(),
                route_count,
                "LAN listener unknown host"
            );
            return json_error_response(ProxyErrorCode::UnknownHost, "unknown host");
        };

        debug!(host, method = %req.method(), path = %req.uri().path(), "LAN listener routing request");
        (route.handler)(req).await
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.read();
        f.debug_set().entries(routes.keys()).finish()
    }
}

/// Picks the handshake certificate from the route table
#[derive(Debug)]
struct SniResolver(Arc<RouteTable>);

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        // No fallback identity: a miss aborts the handshake
        match self.0.certificate(client_hello.server_name()) {
            Ok(cert) => Some(cert),
            Err(e) => {
                debug!(error = %e, "Rejecting LAN TLS handshake");
                None
            }
        }
    }
}

/// One TLS listener multiplexing every registered proxy
pub struct LanListener {
    addr: String,
    routes: Arc<RouteTable>,
    server: Arc<HttpServer>,
    local_addr: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<Result<(), Error>>>>,
}

impl LanListener {
    pub fn new(addr: impl Into<String>, read_header_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            routes: Arc::new(RouteTable::default()),
            server: Arc::new(HttpServer::new(read_header_timeout)),
            local_addr: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Bind and start serving in the background. Bind failures are returned
    /// here; later serve failures are only logged.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(&self.addr).await.map_err(|source| Error::Bind {
            addr: self.addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: self.addr.clone(),
            source,
        })?;

        let acceptor = TlsAcceptor::from(Arc::new(self.tls_config()?));
        let server = Arc::clone(&self.server);
        let handler = self.handler();

        let task = tokio::spawn(async move {
            let result = server.serve(listener, Some(acceptor), handler).await;
            if let Err(e) = &result {
                error!(error = %e, "LAN listener stopped with error");
            }
            result
        });

        *self.local_addr.lock() = Some(local_addr);
        *self.task.lock() = Some(task);

        info!(addr = %local_addr, "LAN listener started");
        Ok(local_addr)
    }

    fn tls_config(&self) -> Result<ServerConfig, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver(Arc::clone(&self.routes))));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Handler that routes by Host across every registered proxy
    pub fn handler(&self) -> Handler {
        let routes = Arc::clone(&self.routes);
        handler_fn(move |req| {
            let routes = Arc::clone(&routes);
            async move { routes.serve_http(req).await }
        })
    }

    pub async fn serve_http(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        self.routes.serve_http(req).await
    }

    /// Route the proxy's canonical hostname and the host of its public URL
    pub fn register(&self, proxy: &Arc<dyn Proxy>) -> Result<(), Error> {
        let handler = proxy.lan_handler().map_err(Error::Proxy)?;

        let hostname = &proxy.config().hostname;
        let short_host = normalize_hostname(hostname);
        if short_host.is_empty() {
            return Err(Error::InvalidHostname(hostname.clone()));
        }

        let mut aliases = BTreeSet::from([short_host]);
        let raw_url = proxy.url();
        let raw_url = raw_url.trim();
        if !raw_url.is_empty() && raw_url != "https://" {
            match Url::parse(raw_url) {
                Ok(url) => {
                    let fqdn = normalize_hostname(url.host_str().unwrap_or_default());
                    if !fqdn.is_empty() {
                        aliases.insert(fqdn);
                    }
                }
                Err(e) => debug!(url = raw_url, error = %e, "Ignoring unparsable proxy URL"),
            }
        }

        self.routes.insert_all(
            &aliases,
            LanRoute {
                proxy: Arc::clone(proxy),
                handler,
            },
        );

        for host in &aliases {
            info!(hostname = %host, "LAN listener registered hostname");
        }
        Ok(())
    }

    /// Remove every alias owned by this proxy instance. Returns how many
    /// were removed; removing an unknown proxy is a no-op.
    pub fn unregister_proxy(&self, proxy: &Arc<dyn Proxy>) -> usize {
        let removed = self.routes.remove_owner(proxy);
        for host in &removed {
            info!(hostname = %host, "LAN listener unregistered hostname");
        }
        removed.len()
    }

    /// Certificate for a handshake with the given SNI server name
    pub fn get_certificate(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, Error> {
        self.routes.certificate(server_name)
    }

    /// Currently routed aliases, sorted
    pub fn hostnames(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.routes.routes.read().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Stop serving. Open connections get until `timeout` to finish.
    pub async fn close(&self, timeout: Duration) -> Result<(), Error> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.shutdown(tokio::time::sleep(timeout)).await {
            errors.push(e);
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(Error::Task(e)),
            }
        }

        info!(addr = %self.addr, "LAN listener closed");
        match Error::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
