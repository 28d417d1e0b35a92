//! Shared data model: proxy/port configuration, lifecycle status and
//! resolved caller identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Header carrying the authenticated caller's login name
pub const HEADER_USERNAME: &str = "x-meshgate-username";
/// Header carrying the authenticated caller's display name
pub const HEADER_DISPLAY_NAME: &str = "x-meshgate-display-name";
/// Header carrying the authenticated caller's profile picture URL
pub const HEADER_PROFILE_PIC_URL: &str = "x-meshgate-profile-pic-url";

/// Configuration of one proxy, materialized by a target provider.
///
/// Immutable for the lifetime of the proxy built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Virtual host name; the registry key once normalized
    pub hostname: String,

    /// Identifier of the target inside its provider
    #[serde(default)]
    pub target_id: String,

    /// Name of the target provider that owns the target
    #[serde(default)]
    pub target_provider: String,

    /// Optional proxy provider override
    #[serde(default)]
    pub proxy_provider: Option<String>,

    /// Published ports, in order
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

/// Configuration of one published port of a proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port published on the proxy's network identity
    pub proxy_port: u16,

    /// Protocol spoken on the published port ("http" or "https")
    #[serde(default = "default_proxy_protocol")]
    pub proxy_protocol: String,

    /// Upstream targets; the first one is the primary upstream
    #[serde(default)]
    pub targets: Vec<Url>,

    /// Protocol spoken to the upstream
    #[serde(default = "default_target_protocol")]
    pub target_protocol: String,

    /// Verify the upstream's TLS certificate
    #[serde(default = "default_true")]
    pub tls_validate: bool,

    /// Whether the target provider detected this port automatically
    #[serde(default)]
    pub auto_detect: bool,

    /// Answer every request with a redirect instead of proxying
    #[serde(default)]
    pub is_redirect: bool,

    /// Redirect destination (falls back to the first target)
    #[serde(default)]
    pub redirect_url: Option<Url>,
}

fn default_proxy_protocol() -> String {
    "https".to_string()
}

fn default_target_protocol() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

impl PortConfig {
    /// Reverse-proxy port pointing at a single upstream
    pub fn proxy(proxy_port: u16, proxy_protocol: &str, target: Url) -> Self {
        Self {
            proxy_port,
            proxy_protocol: proxy_protocol.to_string(),
            target_protocol: target.scheme().to_string(),
            targets: vec![target],
            tls_validate: true,
            auto_detect: false,
            is_redirect: false,
            redirect_url: None,
        }
    }

    /// Redirect port answering every request with a 301 to `location`
    pub fn redirect(proxy_port: u16, proxy_protocol: &str, location: Url) -> Self {
        Self {
            proxy_port,
            proxy_protocol: proxy_protocol.to_string(),
            target_protocol: location.scheme().to_string(),
            targets: Vec::new(),
            tls_validate: true,
            auto_detect: false,
            is_redirect: true,
            redirect_url: Some(location),
        }
    }

    /// Primary upstream target
    pub fn first_target(&self) -> Option<&Url> {
        self.targets.first()
    }

    /// Where redirect mode sends clients
    pub fn redirect_location(&self) -> Option<&Url> {
        self.redirect_url.as_ref().or_else(|| self.first_target())
    }

    /// Whether the published port terminates TLS
    pub fn is_tls(&self) -> bool {
        self.proxy_protocol.eq_ignore_ascii_case("https")
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.proxy_port == 0 {
            return Err("proxy_port must be non-zero".to_string());
        }
        match self.proxy_protocol.to_ascii_lowercase().as_str() {
            "http" | "https" => {}
            other => return Err(format!("unsupported proxy_protocol '{}'", other)),
        }
        if self.is_redirect {
            if self.redirect_location().is_none() {
                return Err("redirect port needs redirect_url or a target".to_string());
            }
        } else if self.targets.is_empty() {
            return Err("port has no targets".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.proxy_port, self.proxy_protocol)?;
        let arrow = if self.is_redirect { "=>" } else { "->" };
        match self.redirect_location().filter(|_| self.is_redirect).or(self.first_target()) {
            Some(target) => write!(f, " {} {}", arrow, target),
            None => Ok(()),
        }
    }
}

/// Lifecycle state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    /// Registered, not yet started
    Initializing,
    /// Binding ports
    Starting,
    /// Serving traffic
    Running,
    /// Shutting down
    Stopping,
    /// Fully stopped
    Stopped,
    /// Failed to start or serve
    Error,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyStatus::Initializing => "initializing",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Running => "running",
            ProxyStatus::Stopping => "stopping",
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Status change of one proxy, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyEvent {
    /// Hostname of the proxy
    pub id: String,
    pub status: ProxyStatus,
}

impl ProxyEvent {
    pub fn new(id: impl Into<String>, status: ProxyStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }
}

/// Authenticated principal resolved for a request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Whois {
    pub username: String,
    pub display_name: String,
    pub profile_pic_url: String,
}
