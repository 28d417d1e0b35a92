//! A single published endpoint of a proxy.
//!
//! A port either reverse-proxies every request to its primary upstream
//! target or answers every request with a fixed permanent redirect. Binding
//! is not the port's business: it serves on a listener handed to
//! [`Port::start_with_listener`], which lets the network layer that owns the
//! proxy's identity decide where the socket comes from.

use crate::error::{json_error_response, Error, ProxyErrorCode};
use crate::middleware::{with_access_log, with_whois, WhoisResolver};
use crate::model::{PortConfig, Whois, HEADER_DISPLAY_NAME, HEADER_PROFILE_PIC_URL, HEADER_USERNAME};
use crate::server::{full_body, handler_fn, ConnInfo, Handler, HttpServer, ProxyBody, READ_HEADER_TIMEOUT};
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, LOCATION, UPGRADE};
use hyper::http::uri::{PathAndQuery, Uri};
use hyper::{Request, Response, StatusCode, Version};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only describe one hop and never travel through the proxy
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type UpstreamClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// An already-open listener, optionally terminating TLS
pub struct PortListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl PortListener {
    pub fn plain(listener: TcpListener) -> Self {
        Self { listener, tls: None }
    }

    pub fn tls(listener: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self {
            listener,
            tls: Some(acceptor),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// One published endpoint for one proxy
pub struct Port {
    config: Arc<PortConfig>,
    label: String,
    token: CancellationToken,
    handler: Handler,
    server: HttpServer,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Port {
    /// Create a reverse-proxy port.
    ///
    /// `whois` installs the identity-resolution layer and `access_log` the
    /// access-log layer around the core reverse-proxy handler.
    pub fn new_proxy(
        parent: &CancellationToken,
        config: PortConfig,
        access_log: bool,
        whois: Option<Arc<dyn WhoisResolver>>,
    ) -> Result<Self, Error> {
        let label = config.to_string();
        let config = Arc::new(config);

        let reverse_proxy = Arc::new(ReverseProxy {
            client: upstream_client(config.tls_validate)?,
            config: Arc::clone(&config),
            label: label.clone(),
        });
        if !config.tls_validate {
            warn!(port = %label, "Upstream TLS verification disabled");
        }

        let mut handler = handler_fn(move |req| {
            let reverse_proxy = Arc::clone(&reverse_proxy);
            async move { reverse_proxy.forward(req).await }
        });
        if let Some(resolver) = whois {
            handler = with_whois(handler, resolver);
        }
        if access_log {
            handler = with_access_log(handler, label.clone());
        }

        Ok(Self::with_handler(parent, config, label, handler))
    }

    /// Create a port that answers every request with a 301 to the configured URL
    pub fn new_redirect(parent: &CancellationToken, config: PortConfig) -> Result<Self, Error> {
        let label = config.to_string();
        let location = config
            .redirect_location()
            .map(Url::to_string)
            .ok_or_else(|| Error::InvalidPort {
                port: label.clone(),
                reason: "redirect port has no destination".to_string(),
            })?;

        let handler = handler_fn(move |_req| {
            let location = location.clone();
            async move { redirect_response(&location) }
        });

        Ok(Self::with_handler(parent, Arc::new(config), label, handler))
    }

    fn with_handler(parent: &CancellationToken, config: Arc<PortConfig>, label: String, handler: Handler) -> Self {
        Self {
            config,
            label,
            token: parent.child_token(),
            handler,
            server: HttpServer::new(READ_HEADER_TIMEOUT),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// The full handler chain of this port
    pub fn handler(&self) -> Handler {
        Arc::clone(&self.handler)
    }

    /// Cancelled when the port or its proxy closes
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Address of the listener the port is serving on, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Serve on an already-open listener until the port is closed
    pub async fn start_with_listener(&self, listener: PortListener) -> Result<(), Error> {
        let addr = listener.local_addr().ok();
        *self.local_addr.lock() = addr;
        info!(port = %self.label, addr = ?addr, "Port serving");

        let result = self
            .server
            .serve(listener.listener, listener.tls, Arc::clone(&self.handler))
            .await;

        info!(port = %self.label, "Terminating server");
        result
    }

    /// Shut the server down and cancel the port's token.
    ///
    /// Draining is bounded by the port's own token, so cancelling the parent
    /// proxy cuts a slow drain short.
    pub async fn close(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.shutdown(self.token.cancelled()).await {
            errors.push(e);
        }

        self.token.cancel();

        match Error::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("config", &self.label)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn redirect_response(location: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(format!("<a href=\"{}\">Moved Permanently</a>.\n", location)))
        .expect("valid response builder")
}

/// Core reverse-proxy handler state for one port
struct ReverseProxy {
    config: Arc<PortConfig>,
    client: UpstreamClient,
    label: String,
}

impl ReverseProxy {
    async fn forward(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let host = request_host(&req);
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        // Resolved on every request so a changed target takes effect at once
        let Some(target) = self.config.first_target().cloned() else {
            error!(port = %self.label, method = %method, host, path, "Port has no upstream target");
            return json_error_response(ProxyErrorCode::BadGateway, "Bad Gateway");
        };

        let upstream_uri = match rewrite_uri(&target, req.uri()) {
            Ok(uri) => uri,
            Err(e) => {
                error!(port = %self.label, target = %target, error = %e, "Invalid upstream URI");
                return json_error_response(ProxyErrorCode::BadGateway, "Bad Gateway");
            }
        };

        let upgrade = upgrade_type(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));
        let conn_info = req.extensions().get::<ConnInfo>().copied();
        let whois = req.extensions().get::<Whois>().cloned();

        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri;
        parts.version = Version::HTTP_11;

        remove_hop_by_hop_headers(&mut parts.headers);
        if let Some(upgrade) = &upgrade {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            if let Ok(value) = HeaderValue::from_str(upgrade) {
                parts.headers.insert(UPGRADE, value);
            }
        }

        // The inbound Host travels unchanged to the upstream
        if !parts.headers.contains_key(HOST) && !host.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&host) {
                parts.headers.insert(HOST, value);
            }
        }
        set_forwarded_headers(&mut parts.headers, conn_info, &host);
        set_identity_headers(&mut parts.headers, whois.as_ref());

        debug!(
            port = %self.label,
            method = %method,
            host,
            path,
            target = %target,
            "proxy rewrite"
        );

        let response = match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    port = %self.label,
                    error = %e,
                    method = %method,
                    host,
                    path,
                    target = %target,
                    "upstream proxy error"
                );
                return json_error_response(ProxyErrorCode::BadGateway, "Bad Gateway");
            }
        };

        debug!(
            port = %self.label,
            status = response.status().as_u16(),
            method = %method,
            host,
            path,
            target = %target,
            "upstream response"
        );

        let mut response = response;
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                let label = self.label.clone();
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok((client, upstream)) => {
                            let mut client = TokioIo::new(client);
                            let mut upstream = TokioIo::new(upstream);
                            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                                debug!(port = %label, error = %e, "Upgraded connection closed with error");
                            }
                        }
                        Err(e) => debug!(port = %label, error = %e, "Upgrade failed"),
                    }
                });
            }
        } else {
            remove_hop_by_hop_headers(response.headers_mut());
        }

        response.map(|body| body.boxed())
    }
}

/// Host the client asked for: the Host header, else the URI authority (HTTP/2)
pub(crate) fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn upgrade_type(headers: &HeaderMap) -> Option<String> {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_upgrade {
        return None;
    }
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Point the request at `target`, joining paths and merging queries
fn rewrite_uri(target: &Url, inbound: &Uri) -> Result<Uri, hyper::http::Error> {
    let host = target.host_str().unwrap_or_default();
    let authority = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = single_joining_slash(target.path(), inbound.path());
    let query = match (target.query().unwrap_or(""), inbound.query().unwrap_or("")) {
        ("", "") => String::new(),
        (t, "") => format!("?{}", t),
        ("", i) => format!("?{}", i),
        (t, i) => format!("?{}&{}", t, i),
    };
    let path_and_query = PathAndQuery::try_from(format!("{}{}", path, query))?;

    Uri::builder()
        .scheme(target.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Append the client to X-Forwarded-For and set X-Forwarded-Host/Proto
fn set_forwarded_headers(headers: &mut HeaderMap, conn_info: Option<ConnInfo>, host: &str) {
    if let Some(info) = conn_info {
        let client_ip = info.remote_addr.ip().to_string();
        let prior: Vec<&str> = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let forwarded_for = if prior.is_empty() {
            client_ip
        } else {
            format!("{}, {}", prior.join(", "), client_ip)
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    let proto = if conn_info.is_some_and(|info| info.tls) {
        "https"
    } else {
        "http"
    };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

/// Identity headers only ever come from the resolved principal, never the client
fn set_identity_headers(headers: &mut HeaderMap, whois: Option<&Whois>) {
    for name in [HEADER_USERNAME, HEADER_DISPLAY_NAME, HEADER_PROFILE_PIC_URL] {
        headers.remove(name);
    }
    let Some(whois) = whois else {
        return;
    };
    for (name, value) in [
        (HEADER_USERNAME, &whois.username),
        (HEADER_DISPLAY_NAME, &whois.display_name),
        (HEADER_PROFILE_PIC_URL, &whois.profile_pic_url),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

fn upstream_client(tls_validate: bool) -> Result<UpstreamClient, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let mut tls = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !tls_validate {
        tls.dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier(provider)));
    }

    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

/// Accepts any upstream certificate; signatures are still checked
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
