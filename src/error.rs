//! Error types and JSON error responses

use crate::server::{full_body, ProxyBody};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;

/// Errors surfaced by the manager, the LAN listener and ports
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid proxy hostname '{0}'")]
    InvalidHostname(String),

    #[error("proxy provider not found: {0}")]
    ProxyProviderNotFound(String),

    #[error("target provider not found: {0}")]
    TargetProviderNotFound(String),

    #[error("no proxy providers configured")]
    NoProxyProviders,

    #[error("no target providers configured")]
    NoTargetProviders,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid port {port}: {reason}")]
    InvalidPort { port: String, reason: String },

    #[error("missing SNI server name")]
    MissingSni,

    #[error("unknown SNI host '{0}'")]
    UnknownSniHost(String),

    #[error("proxy error: {0:#}")]
    Proxy(anyhow::Error),

    #[error("error serving on {addr}: {source}")]
    Serve {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("graceful shutdown did not complete in time")]
    ShutdownTimeout,

    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Combine shutdown errors; `None` when there were none
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error codes for responses generated by the proxy itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing or unparsable Host header
    MissingHost,
    /// Host is not routed by this listener
    UnknownHost,
    /// Upstream dial or response failure
    BadGateway,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHost => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::MISDIRECTED_REQUEST,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHost => "MISSING_HOST",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
