//! Handler layers composed around a port's core handler

use crate::model::Whois;
use crate::server::{handler_fn, ConnInfo, Handler};
use async_trait::async_trait;
use hyper::header::{HeaderValue, HOST};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// Resolves the authenticated principal behind a connection
#[async_trait]
pub trait WhoisResolver: Send + Sync {
    async fn whois(&self, remote_addr: SocketAddr) -> Option<Whois>;
}

/// Resolve the caller's identity and attach it to the request extensions
pub fn with_whois(next: Handler, resolver: Arc<dyn WhoisResolver>) -> Handler {
    handler_fn(move |mut req| {
        let next = Arc::clone(&next);
        let resolver = Arc::clone(&resolver);
        async move {
            if let Some(info) = req.extensions().get::<ConnInfo>().copied() {
                if let Some(whois) = resolver.whois(info.remote_addr).await {
                    req.extensions_mut().insert(whois);
                }
            }
            next(req).await
        }
    })
}

/// Log every request once it has been answered.
///
/// Propagates an inbound X-Request-ID or assigns a fresh one.
pub fn with_access_log(next: Handler, port: String) -> Handler {
    let port: Arc<str> = port.into();
    handler_fn(move |mut req| {
        let next = Arc::clone(&next);
        let port = Arc::clone(&port);
        async move {
            let started = Instant::now();

            let request_id = req
                .headers()
                .get(X_REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                req.headers_mut().insert(X_REQUEST_ID, value);
            }

            let method = req.method().clone();
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| "/".to_string());
            let host = req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .or_else(|| req.uri().authority().map(|a| a.to_string()))
                .unwrap_or_default();
            let remote = req
                .extensions()
                .get::<ConnInfo>()
                .map(|info| info.remote_addr.to_string())
                .unwrap_or_default();

            let response = next(req).await;

            info!(
                port = %port,
                request_id,
                method = %method,
                host,
                path,
                remote,
                status = response.status().as_u16(),
                duration_ms = started.elapsed().as_millis() as u64,
                "request"
            );
            response
        }
    })
}
