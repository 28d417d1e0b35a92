use meshgate::config::Config;
use meshgate::manager::ProxyManager;
use meshgate::providers::LocalProvider;
use meshgate::targets::ListProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("meshgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let manager = ProxyManager::new(config.manager_settings());

    for (name, provider) in &config.providers {
        let settings = config.local_settings(provider)?;
        info!(provider = %name, bind = %settings.bind, domain = ?settings.domain, "Created proxy provider");
        manager.add_proxy_provider(name.clone(), Arc::new(LocalProvider::new(settings)));
    }

    for (name, list) in &config.lists {
        info!(provider = %name, path = %list.path.display(), "Created target provider");
        manager.add_target_provider(Arc::new(ListProvider::new(name.clone(), config.list_settings(list))));
    }

    if let Err(e) = manager.start().await {
        error!(error = %e, "Failed to start proxy manager");
        return Err(e.into());
    }

    manager.watch_events();

    wait_for_shutdown(&config_path).await;

    manager.stop_all_proxies().await;
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM. SIGHUP is logged and ignored: target lists
/// are re-read on their own.
async fn wait_for_shutdown(config_path: &std::path::Path) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(
                        path = %config_path.display(),
                        "Received SIGHUP; target lists reload automatically, restart to apply configuration changes"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = config_path;
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting meshgate");
    info!(
        enabled = config.lan.enabled,
        addr = %config.lan.addr(),
        read_header_timeout_secs = config.lan.read_header_timeout_secs,
        "LAN listener"
    );
    info!(
        default_proxy_provider = %config.default_proxy_provider,
        proxy_providers = config.providers.len(),
        target_lists = config.lists.len(),
        access_log = config.proxy.access_log,
        "Providers"
    );
    info!(
        max_attempts = config.watch.max_attempts,
        base_delay_ms = config.watch.base_delay_ms,
        max_delay_ms = config.watch.max_delay_ms,
        "Watch restart policy"
    );
}
