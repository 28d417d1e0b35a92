//! Shared HTTP serving machinery for the LAN listener and ports.
//!
//! Serves HTTP/1.1 and HTTP/2 over an already-bound listener, optionally
//! terminating TLS, and supports graceful shutdown: on shutdown the accept
//! loop stops (dropping and thereby closing the listener), every open
//! connection is told to finish in-flight requests, and
//! [`HttpServer::shutdown`] waits for them to drain.

use crate::error::Error;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

/// Default bound on reading request headers (and the TLS handshake)
pub const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a transient accept error
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Body type flowing through every handler
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub type ResponseFuture = Pin<Box<dyn Future<Output = Response<ProxyBody>> + Send>>;

/// An HTTP handler. Handlers never fail: every error becomes a response.
pub type Handler = Arc<dyn Fn(Request<ProxyBody>) -> ResponseFuture + Send + Sync>;

/// Wrap an async function into a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<ProxyBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Connection details attached to every request's extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub remote_addr: SocketAddr,
    /// Whether the connection was accepted over TLS
    pub tls: bool,
}

/// Graceful HTTP server bound to externally provided listeners
pub struct HttpServer {
    read_header_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    /// Each open connection holds a clone; the channel closes once all are gone
    drain_tx: Mutex<Option<mpsc::Sender<()>>>,
    drain_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl HttpServer {
    pub fn new(read_header_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        Self {
            read_header_timeout,
            shutdown_tx,
            drain_tx: Mutex::new(Some(drain_tx)),
            drain_rx: tokio::sync::Mutex::new(drain_rx),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Accept and serve connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Returns `Ok(())` on shutdown. Transient accept errors are logged and
    /// retried; any other accept error ends serving with [`Error::Serve`].
    pub async fn serve(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        handler: Handler,
    ) -> Result<(), Error> {
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Serve {
                addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                source,
            })?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let Some(drain) = self.drain_tx.lock().clone() else {
                                break;
                            };
                            let connection = Connection {
                                handler: Arc::clone(&handler),
                                tls: tls.clone(),
                                remote_addr,
                                read_header_timeout: self.read_header_timeout,
                                shutdown_rx: shutdown_rx.clone(),
                                _drain: drain,
                            };
                            tokio::spawn(connection.run(stream));
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!(addr = %local_addr, error = %e, "Transient accept error");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                        Err(e) => {
                            error!(addr = %local_addr, error = %e, "Accept failed");
                            return Err(Error::Serve { addr: local_addr, source: e });
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        debug!(addr = %local_addr, "Listener closed");
        Ok(())
    }

    /// Stop accepting, ask open connections to finish, and wait for them.
    ///
    /// Waiting is bounded by `bound`: if it completes first the result is
    /// [`Error::ShutdownTimeout`] and remaining connections are left to close
    /// on their own.
    pub async fn shutdown<F>(&self, bound: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        self.shutdown_tx.send_replace(true);
        self.drain_tx.lock().take();

        let mut drain_rx = self.drain_rx.lock().await;
        tokio::select! {
            _ = drain_rx.recv() => Ok(()),
            _ = bound => Err(Error::ShutdownTimeout),
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    // ENFILE / EMFILE: out of file descriptors, usually temporary
    const FD_EXHAUSTED: [i32; 2] = [23, 24];

    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) || e.raw_os_error().is_some_and(|code| FD_EXHAUSTED.contains(&code))
}

/// One accepted connection
struct Connection {
    handler: Handler,
    tls: Option<TlsAcceptor>,
    remote_addr: SocketAddr,
    read_header_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
    _drain: mpsc::Sender<()>,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);

        match self.tls.clone() {
            Some(acceptor) => {
                let handshake = tokio::time::timeout(self.read_header_timeout, acceptor.accept(stream));
                match handshake.await {
                    Ok(Ok(tls_stream)) => self.serve_io(tls_stream, true).await,
                    Ok(Err(e)) => {
                        debug!(remote = %self.remote_addr, error = %e, "TLS handshake failed");
                    }
                    Err(_) => {
                        debug!(remote = %self.remote_addr, "TLS handshake timed out");
                    }
                }
            }
            None => self.serve_io(stream, false).await,
        }
    }

    async fn serve_io<S>(mut self, io: S, tls: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let info = ConnInfo {
            remote_addr: self.remote_addr,
            tls,
        };
        let handler = Arc::clone(&self.handler);
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&handler);
            async move {
                let mut req = req.map(|body| body.boxed());
                req.extensions_mut().insert(info);
                Ok::<_, Infallible>(handler(req).await)
            }
        });

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.read_header_timeout);

        let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(conn);

        let mut draining = false;
        if *self.shutdown_rx.borrow_and_update() {
            conn.as_mut().graceful_shutdown();
            draining = true;
        }

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(remote = %self.remote_addr, error = %e, "Connection error");
                    }
                    break;
                }
                _ = self.shutdown_rx.changed(), if !draining => {
                    conn.as_mut().graceful_shutdown();
                    draining = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ok_handler() -> Handler {
        handler_fn(|req: Request<ProxyBody>| async move {
            let remote = req
                .extensions()
                .get::<ConnInfo>()
                .map(|info| info.remote_addr.ip().to_string())
                .unwrap_or_default();
            Response::builder()
                .status(StatusCode::OK)
                .body(full_body(remote))
                .unwrap()
        })
    }

    async fn raw_get(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_and_attaches_conn_info() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(HttpServer::new(READ_HEADER_TIMEOUT));

        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(listener, None, ok_handler()).await });

        let response = raw_get(addr).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("127.0.0.1"));

        server
            .shutdown(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(task.await.unwrap().is_ok());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(HttpServer::new(READ_HEADER_TIMEOUT));

        let slow = handler_fn(|_req| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Response::new(full_body("slow"))
        });
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener, None, slow).await });

        let client = tokio::spawn(raw_get(addr));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        server
            .shutdown(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("slow"));
    }

    #[tokio::test]
    async fn test_shutdown_bound_reports_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(HttpServer::new(READ_HEADER_TIMEOUT));

        let stuck = handler_fn(|_req| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Response::new(empty_body())
        });
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener, None, stuck).await });

        let _client = tokio::spawn(raw_get(addr));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = server
            .shutdown(tokio::time::sleep(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(Error::ShutdownTimeout)));
    }

    #[tokio::test]
    async fn test_serve_after_shutdown_returns_immediately() {
        let server = HttpServer::new(READ_HEADER_TIMEOUT);
        server.shutdown(std::future::pending()).await.unwrap();
        assert!(server.is_shutdown());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(server.serve(listener, None, ok_handler()).await.is_ok());
    }
}
