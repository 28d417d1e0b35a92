use crate::manager::{LanSettings, ManagerSettings, WatchSettings};
use crate::providers::LocalSettings;
use crate::targets::ListSettings;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for meshgate
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Proxy provider used when neither a target nor its list names one
    #[serde(default = "default_proxy_provider")]
    pub default_proxy_provider: String,

    /// Shared LAN listener
    #[serde(default)]
    pub lan: LanConfig,

    /// Settings shared by every proxy
    #[serde(default)]
    pub proxy: ProxyOptions,

    /// Restart policy for target provider watches
    #[serde(default)]
    pub watch: WatchConfig,

    /// Local proxy providers by name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Target list providers by name
    #[serde(default)]
    pub lists: HashMap<String, ListConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LanConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub hostname: String,

    /// Port to bind (default: 443)
    #[serde(default = "default_lan_port")]
    pub port: u16,

    /// Bound on reading request headers and the TLS handshake
    #[serde(default = "default_read_header_timeout")]
    pub read_header_timeout_secs: u64,

    /// Bound on draining open connections at shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hostname: default_bind_address(),
            port: default_lan_port(),
            read_header_timeout_secs: default_read_header_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl LanConfig {
    /// `host:port`, bracketing IPv6 literals
    pub fn addr(&self) -> String {
        if self.hostname.contains(':') && !self.hostname.starts_with('[') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyOptions {
    /// Log every proxied request
    #[serde(default = "default_true")]
    pub access_log: bool,

    /// Capacity of each status subscription
    #[serde(default = "default_status_buffer")]
    pub status_buffer: usize,

    /// Bound on draining a proxy's ports when it closes
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            access_log: true,
            status_buffer: default_status_buffer(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Consecutive failures before a provider is abandoned (0 = retry forever)
    #[serde(default)]
    pub max_attempts: u32,

    #[serde(default = "default_watch_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_watch_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay_ms: default_watch_base_delay(),
            max_delay_ms: default_watch_max_delay(),
        }
    }
}

/// A local proxy provider
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Address ports are bound on (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Domain appended to hostnames to form each proxy's public name
    #[serde(default)]
    pub domain: Option<String>,
}

/// A target list provider
#[derive(Debug, Deserialize, Clone)]
pub struct ListConfig {
    /// TOML file declaring the targets
    pub path: PathBuf,

    /// Overrides the global default proxy provider for this list
    #[serde(default)]
    pub default_proxy_provider: Option<String>,

    /// How often the file is re-read
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_proxy_provider() -> String {
    "local".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_lan_port() -> u16 {
    443
}

fn default_read_header_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_status_buffer() -> usize {
    64
}

fn default_watch_base_delay() -> u64 {
    500
}

fn default_watch_max_delay() -> u64 {
    30_000
}

fn default_poll_interval() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.lan.enabled {
            if self.lan.hostname.trim().is_empty() {
                errors.push("lan.hostname must not be empty".to_string());
            }
            if self.lan.port == 0 {
                errors.push("lan.port must be non-zero when the LAN listener is enabled".to_string());
            }
        }

        if self.proxy.status_buffer == 0 {
            errors.push("proxy.status_buffer must be at least 1".to_string());
        }

        if self.watch.base_delay_ms > self.watch.max_delay_ms {
            errors.push(format!(
                "watch.base_delay_ms ({}) exceeds watch.max_delay_ms ({})",
                self.watch.base_delay_ms, self.watch.max_delay_ms
            ));
        }

        for (name, provider) in &self.providers {
            if provider.bind.parse::<IpAddr>().is_err() {
                errors.push(format!("providers.{}: invalid bind address '{}'", name, provider.bind));
            }
        }

        for (name, list) in &self.lists {
            if list.poll_interval_secs == 0 {
                errors.push(format!("lists.{}: poll_interval_secs must be at least 1", name));
            }
            if let Some(provider) = &list.default_proxy_provider {
                if !self.providers.contains_key(provider) {
                    errors.push(format!("lists.{}: unknown proxy provider '{}'", name, provider));
                }
            }
        }

        if !self.providers.is_empty() && !self.providers.contains_key(&self.default_proxy_provider) {
            errors.push(format!(
                "default_proxy_provider '{}' is not a configured provider",
                self.default_proxy_provider
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        let lan = self.lan.enabled.then(|| LanSettings {
            addr: self.lan.addr(),
            read_header_timeout: Duration::from_secs(self.lan.read_header_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.lan.shutdown_timeout_secs),
        });

        ManagerSettings {
            default_proxy_provider: self.default_proxy_provider.clone(),
            lan,
            status_buffer: self.proxy.status_buffer,
            watch: WatchSettings {
                max_attempts: self.watch.max_attempts,
                base_delay: Duration::from_millis(self.watch.base_delay_ms),
                max_delay: Duration::from_millis(self.watch.max_delay_ms),
            },
        }
    }

    pub fn local_settings(&self, provider: &ProviderConfig) -> anyhow::Result<LocalSettings> {
        Ok(LocalSettings {
            bind: provider.bind.parse()?,
            domain: provider.domain.clone(),
            access_log: self.proxy.access_log,
            shutdown_timeout: Duration::from_secs(self.proxy.shutdown_timeout_secs),
        })
    }

    pub fn list_settings(&self, list: &ListConfig) -> ListSettings {
        ListSettings {
            path: list.path.clone(),
            default_proxy_provider: list
                .default_proxy_provider
                .clone()
                .unwrap_or_else(|| self.default_proxy_provider.clone()),
            poll_interval: Duration::from_secs(list.poll_interval_secs),
        }
    }
}
