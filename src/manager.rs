//! The proxy manager.
//!
//! Reacts to target lifecycle events, builds proxies through the configured
//! proxy providers, keeps the live registry of running proxies, owns the LAN
//! listener and fans proxy status changes out to subscribers.

use crate::error::Error;
use crate::hostname::normalize_hostname;
use crate::lan::LanListener;
use crate::model::{ProxyConfig, ProxyEvent, ProxyStatus};
use crate::proxy::{same_proxy, Proxy, ProxyProvider, StatusSink};
use crate::server::READ_HEADER_TIMEOUT;
use crate::target::{TargetAction, TargetEvent, TargetProvider};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffer between a provider's watch and the manager's dispatch loop
const EVENT_BUFFER: usize = 64;

/// How long a cancelled provider watch gets to return before it is aborted
const WATCH_STOP_GRACE: Duration = Duration::from_secs(5);

/// Shared LAN listener settings
#[derive(Debug, Clone)]
pub struct LanSettings {
    /// `host:port` to bind
    pub addr: String,
    pub read_header_timeout: Duration,
    /// Bound on draining open LAN connections at shutdown
    pub shutdown_timeout: Duration,
}

impl LanSettings {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            read_header_timeout: READ_HEADER_TIMEOUT,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Restart policy for failed provider watches
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Consecutive failures before giving up on a provider (0 = never)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Proxy provider used when neither the target nor its provider names one
    pub default_proxy_provider: String,
    /// `None` disables the LAN listener
    pub lan: Option<LanSettings>,
    /// Capacity of each status subscription
    pub status_buffer: usize,
    pub watch: WatchSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            default_proxy_provider: String::new(),
            lan: None,
            status_buffer: 64,
            watch: WatchSettings::default(),
        }
    }
}

/// Handle returned by [`ProxyManager::subscribe_status_events`]
pub type SubscriptionId = u64;

/// Manages all proxies.
///
/// Like the other long-lived managers it is always used behind an `Arc`;
/// [`new`](ProxyManager::new) returns one directly.
pub struct ProxyManager {
    settings: ManagerSettings,
    /// Live proxies keyed by normalized hostname
    proxies: RwLock<HashMap<String, Arc<dyn Proxy>>>,
    target_providers: RwLock<HashMap<String, Arc<dyn TargetProvider>>>,
    proxy_providers: RwLock<HashMap<String, Arc<dyn ProxyProvider>>>,
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::Sender<ProxyEvent>)>>,
    next_subscription: AtomicU64,
    lan: RwLock<Option<Arc<LanListener>>>,
    /// Parent of every watch token
    token: CancellationToken,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<ProxyManager>,
}

impl ProxyManager {
    pub fn new(settings: ManagerSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            settings,
            proxies: RwLock::new(HashMap::new()),
            target_providers: RwLock::new(HashMap::new()),
            proxy_providers: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            lan: RwLock::new(None),
            token: CancellationToken::new(),
            watchers: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn add_proxy_provider(&self, name: impl Into<String>, provider: Arc<dyn ProxyProvider>) {
        let name = name.into();
        debug!(provider = %name, "Added proxy provider");
        self.proxy_providers.write().insert(name, provider);
    }

    pub fn add_target_provider(&self, provider: Arc<dyn TargetProvider>) {
        let name = provider.name().to_string();
        debug!(provider = %name, "Added target provider");
        self.target_providers.write().insert(name, provider);
    }

    /// Check the provider registries and start the LAN listener if enabled.
    ///
    /// Every error here is fatal to startup.
    pub async fn start(&self) -> Result<(), Error> {
        if self.proxy_providers.read().is_empty() {
            error!("No proxy providers found");
            return Err(Error::NoProxyProviders);
        }
        if self.target_providers.read().is_empty() {
            error!("No target providers found");
            return Err(Error::NoTargetProviders);
        }

        if let Some(settings) = &self.settings.lan {
            let lan = Arc::new(LanListener::new(settings.addr.clone(), settings.read_header_timeout));
            lan.start().await?;
            *self.lan.write() = Some(lan);
        }

        info!(
            proxy_providers = self.proxy_providers.read().len(),
            target_providers = self.target_providers.read().len(),
            lan = self.settings.lan.is_some(),
            "Proxy manager started"
        );
        Ok(())
    }

    /// The running LAN listener, if any
    pub fn lan_listener(&self) -> Option<Arc<LanListener>> {
        self.lan.read().clone()
    }

    /// Spawn one supervised watch per target provider
    pub fn watch_events(self: &Arc<Self>) {
        let providers: Vec<Arc<dyn TargetProvider>> = self.target_providers.read().values().cloned().collect();

        let mut watchers = self.watchers.lock();
        for provider in providers {
            let manager = Arc::clone(self);
            watchers.push(tokio::spawn(manager.supervise_watch(provider)));
        }
    }

    /// Run a provider's watch, restarting it with backoff after errors
    async fn supervise_watch(self: Arc<Self>, provider: Arc<dyn TargetProvider>) {
        let name = provider.name().to_string();
        let mut failures: u32 = 0;

        loop {
            let token = self.token.child_token();
            let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
            let (errors_tx, mut errors_rx) = mpsc::channel(1);
            let mut watcher = tokio::spawn(Arc::clone(&provider).watch_events(token.clone(), events_tx, errors_tx));

            info!(provider = %name, "Watching target events");

            let mut errors_open = true;
            let failure = loop {
                tokio::select! {
                    _ = self.token.cancelled() => break None,
                    event = events_rx.recv() => match event {
                        Some(event) => {
                            failures = 0;
                            self.handle_proxy_event(event);
                        }
                        // The watch returned; it may have reported why first
                        None => break errors_rx.try_recv().ok(),
                    },
                    error = errors_rx.recv(), if errors_open => match error {
                        Some(e) => break Some(e),
                        None => errors_open = false,
                    },
                }
            };

            token.cancel();
            if tokio::time::timeout(WATCH_STOP_GRACE, &mut watcher).await.is_err() {
                warn!(provider = %name, "Target provider ignored cancellation, aborting its watch");
                watcher.abort();
            }

            let Some(e) = failure else {
                info!(provider = %name, "Stopped watching target events");
                return;
            };

            failures += 1;
            error!(provider = %name, attempt = failures, error = %format!("{:#}", e), "Error watching events");

            let policy = &self.settings.watch;
            if policy.max_attempts != 0 && failures >= policy.max_attempts {
                error!(provider = %name, attempts = failures, "Giving up on target provider");
                return;
            }

            let delay = watch_backoff(failures, policy);
            debug!(provider = %name, delay_ms = delay.as_millis() as u64, "Restarting watch after backoff");
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Dispatch a target event on its own task so a slow proxy never stalls
    /// the watch loop
    pub fn handle_proxy_event(self: &Arc<Self>, event: TargetEvent) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.process_event(event).await })
    }

    async fn process_event(&self, event: TargetEvent) {
        debug!(target_id = %event.id, action = %event.action, provider = event.provider.name(), "Target event");
        match event.action {
            TargetAction::Start => self.event_start(&event).await,
            TargetAction::Stop => self.event_stop(&event).await,
            TargetAction::Restart => {
                self.event_stop(&event).await;
                self.event_start(&event).await;
            }
        }
    }

    async fn event_start(&self, event: &TargetEvent) {
        debug!(target_id = %event.id, "Adding target");

        let config = match event.provider.add_target(&event.id).await {
            Ok(config) => config,
            Err(e) => {
                error!(target_id = %event.id, error = %format!("{:#}", e), "Error adding target");
                return;
            }
        };

        let hostname = config.hostname.clone();
        if let Err(e) = self.new_and_start_proxy(config).await {
            error!(target_id = %event.id, hostname, error = %e, "Error starting proxy");
        }
    }

    async fn event_stop(&self, event: &TargetEvent) {
        debug!(target_id = %event.id, "Stopping target");

        let Some((key, proxy)) = self.find_by_target(&event.id, event.provider.name()) else {
            error!(target_id = %event.id, action = %event.action, "No proxy found for target");
            return;
        };

        if let Err(e) = event.provider.delete_proxy(&event.id).await {
            error!(target_id = %event.id, error = %format!("{:#}", e), "Error deleting proxy for target");
            return;
        }

        self.remove_proxy(&key, &proxy).await;
    }

    fn find_by_target(&self, target_id: &str, provider: &str) -> Option<(String, Arc<dyn Proxy>)> {
        self.proxies
            .read()
            .iter()
            .find(|(_, proxy)| {
                let config = proxy.config();
                config.target_id == target_id && config.target_provider == provider
            })
            .map(|(key, proxy)| (key.clone(), Arc::clone(proxy)))
    }

    /// Build, register and start a proxy for `config`
    pub async fn new_and_start_proxy(&self, config: ProxyConfig) -> Result<(), Error> {
        let key = normalize_hostname(&config.hostname);
        if key.is_empty() {
            return Err(Error::InvalidHostname(config.hostname));
        }
        debug!(proxy = %key, "Creating proxy");

        let provider = self.get_proxy_provider(&config)?;
        let proxy = provider.new_proxy(config, self.status_sink()).map_err(Error::Proxy)?;

        if let Some(lan) = self.lan_listener() {
            if let Err(e) = lan.register(&proxy) {
                error!(proxy = %key, error = %e, "Invalid proxy configuration for LAN listener, dropping proxy");
                proxy.close().await;
                return Err(e);
            }
        }

        let replaced = self.proxies.write().insert(key.clone(), Arc::clone(&proxy));
        if let Some(old) = replaced.filter(|old| !same_proxy(old, &proxy)) {
            info!(proxy = %key, "Replacing running proxy");
            if let Some(lan) = self.lan_listener() {
                lan.unregister_proxy(&old);
            }
            old.close().await;
        }

        self.broadcast(ProxyEvent::new(key, ProxyStatus::Initializing));

        proxy.start().await;
        Ok(())
    }

    /// Unroute, forget and close one proxy instance.
    ///
    /// The registry entry is only removed while it still holds this exact
    /// instance, so a stale removal never drops a replacement.
    async fn remove_proxy(&self, key: &str, proxy: &Arc<dyn Proxy>) {
        if let Some(lan) = self.lan_listener() {
            lan.unregister_proxy(proxy);
        }

        {
            let mut proxies = self.proxies.write();
            if proxies.get(key).is_some_and(|current| same_proxy(current, proxy)) {
                proxies.remove(key);
            }
        }

        proxy.close().await;
        debug!(proxy = %key, "Removed proxy");
    }

    /// Proxy provider for a config: the config's own choice, then the target
    /// provider's default, then the global default
    pub fn get_proxy_provider(&self, config: &ProxyConfig) -> Result<Arc<dyn ProxyProvider>, Error> {
        let proxy_providers = self.proxy_providers.read();

        if let Some(name) = config.proxy_provider.as_deref().filter(|name| !name.is_empty()) {
            return proxy_providers
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ProxyProviderNotFound(name.to_string()));
        }

        let target_provider = self
            .target_providers
            .read()
            .get(&config.target_provider)
            .cloned()
            .ok_or_else(|| Error::TargetProviderNotFound(config.target_provider.clone()))?;

        let default_name = target_provider.default_proxy_provider_name();
        if let Some(provider) = proxy_providers.get(&default_name) {
            return Ok(Arc::clone(provider));
        }

        proxy_providers
            .get(&self.settings.default_proxy_provider)
            .cloned()
            .ok_or_else(|| Error::ProxyProviderNotFound(self.settings.default_proxy_provider.clone()))
    }

    fn status_sink(&self) -> StatusSink {
        let manager = self.this.clone();
        Arc::new(move |event| {
            if let Some(manager) = manager.upgrade() {
                manager.broadcast(event);
            }
        })
    }

    /// Subscribe to proxy status changes
    pub fn subscribe_status_events(&self) -> (SubscriptionId, mpsc::Receiver<ProxyEvent>) {
        let (tx, rx) = mpsc::channel(self.settings.status_buffer.max(1));
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        (id, rx)
    }

    /// Drop a subscription; its receiver sees the channel close once drained
    pub fn unsubscribe_status_events(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sub, _)| *sub != id);
    }

    /// Send an event to every subscriber without waiting on any of them.
    ///
    /// Full subscribers miss the event; closed ones are dropped.
    pub fn broadcast(&self, event: ProxyEvent) {
        self.subscribers.lock().retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscription = id, proxy = %event.id, "Status subscriber full, skipping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Snapshot of the registry
    pub fn get_proxies(&self) -> HashMap<String, Arc<dyn Proxy>> {
        self.proxies.read().clone()
    }

    pub fn get_proxy(&self, name: &str) -> Option<Arc<dyn Proxy>> {
        self.proxies.read().get(&normalize_hostname(name)).cloned()
    }

    /// Stop watching, close the LAN listener and close every proxy
    /// concurrently, returning once all of them have closed
    pub async fn stop_all_proxies(&self) {
        info!("Shutdown all proxies");
        self.token.cancel();

        let watchers = std::mem::take(&mut *self.watchers.lock());
        join_all(watchers).await;

        let lan = self.lan.write().take();
        if let Some(lan) = lan {
            let timeout = self
                .settings
                .lan
                .as_ref()
                .map(|settings| settings.shutdown_timeout)
                .unwrap_or_default();
            if let Err(e) = lan.close(timeout).await {
                error!(error = %e, "Error stopping LAN listener");
            }
        }

        let proxies = self.get_proxies();
        join_all(proxies.iter().map(|(key, proxy)| self.remove_proxy(key, proxy))).await;
        info!(count = proxies.len(), "All proxies stopped");
    }
}

/// Capped exponential backoff with up to 10% jitter
fn watch_backoff(attempt: u32, policy: &WatchSettings) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base = policy.base_delay.as_millis() as u64;
    let max = policy.max_delay.as_millis() as u64;
    let delay = base.saturating_mul(2u64.saturating_pow(attempt - 1)).min(max);

    let jitter_range = delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{full_body, handler_fn, Handler};
    use async_trait::async_trait;
    use hyper::Response;
    use rustls::sign::CertifiedKey;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Instant;

    struct FakeProxy {
        config: ProxyConfig,
        status: StatusSink,
        close_delay: Duration,
        closed: AtomicBool,
    }

    impl FakeProxy {
        fn id(&self) -> String {
            normalize_hostname(&self.config.hostname)
        }
    }

    #[async_trait]
    impl Proxy for FakeProxy {
        fn config(&self) -> &ProxyConfig {
            &self.config
        }

        fn lan_handler(&self) -> anyhow::Result<Handler> {
            Ok(handler_fn(|_req| async { Response::new(full_body("fake")) }))
        }

        fn tls_certificate(&self, hostname: &str) -> anyhow::Result<Arc<CertifiedKey>> {
            anyhow::bail!("no certificate for {}", hostname)
        }

        fn url(&self) -> String {
            format!("https://{}.tailnet.test", self.id())
        }

        async fn start(&self) {
            (self.status)(ProxyEvent::new(self.id(), ProxyStatus::Running));
        }

        async fn close(&self) {
            tokio::time::sleep(self.close_delay).await;
            self.closed.store(true, Ordering::SeqCst);
            (self.status)(ProxyEvent::new(self.id(), ProxyStatus::Stopped));
        }
    }

    #[derive(Default)]
    struct FakeProxyProvider {
        close_delay: Duration,
        built: Mutex<Vec<Arc<FakeProxy>>>,
    }

    impl ProxyProvider for FakeProxyProvider {
        fn new_proxy(&self, config: ProxyConfig, status: StatusSink) -> anyhow::Result<Arc<dyn Proxy>> {
            let proxy = Arc::new(FakeProxy {
                config,
                status,
                close_delay: self.close_delay,
                closed: AtomicBool::new(false),
            });
            self.built.lock().push(Arc::clone(&proxy));
            Ok(proxy)
        }
    }

    /// Target provider whose watch fails `fail_first` times, then emits one
    /// Start per target
    struct FakeTargets {
        name: String,
        default_proxy_provider: String,
        hostnames: HashMap<String, String>,
        deleted: Mutex<Vec<String>>,
        watches: AtomicU32,
        fail_first: u32,
    }

    impl FakeTargets {
        fn new(name: &str, targets: &[(&str, &str)]) -> Self {
            Self {
                name: name.to_string(),
                default_proxy_provider: "fake".to_string(),
                hostnames: targets
                    .iter()
                    .map(|(id, host)| (id.to_string(), host.to_string()))
                    .collect(),
                deleted: Mutex::new(Vec::new()),
                watches: AtomicU32::new(0),
                fail_first: 0,
            }
        }
    }

    #[async_trait]
    impl TargetProvider for FakeTargets {
        fn name(&self) -> &str {
            &self.name
        }

        async fn watch_events(
            self: Arc<Self>,
            token: CancellationToken,
            events: mpsc::Sender<TargetEvent>,
            errors: mpsc::Sender<anyhow::Error>,
        ) {
            let attempt = self.watches.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                let _ = errors.send(anyhow::anyhow!("watch attempt {} failed", attempt)).await;
            } else {
                let ids: Vec<String> = self.hostnames.keys().cloned().collect();
                for id in ids {
                    let provider: Arc<dyn TargetProvider> = self.clone();
                    let _ = events.send(TargetEvent::new(id, TargetAction::Start, provider)).await;
                }
            }
            token.cancelled().await;
        }

        async fn add_target(&self, id: &str) -> anyhow::Result<ProxyConfig> {
            let hostname = self
                .hostnames
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("unknown target {}", id))?;
            Ok(ProxyConfig {
                hostname: hostname.clone(),
                target_id: id.to_string(),
                target_provider: self.name.clone(),
                proxy_provider: None,
                ports: Vec::new(),
            })
        }

        async fn delete_proxy(&self, id: &str) -> anyhow::Result<()> {
            self.deleted.lock().push(id.to_string());
            Ok(())
        }

        fn default_proxy_provider_name(&self) -> String {
            self.default_proxy_provider.clone()
        }
    }

    fn settings_with_lan() -> ManagerSettings {
        ManagerSettings {
            lan: Some(LanSettings::new("127.0.0.1:0")),
            ..ManagerSettings::default()
        }
    }

    async fn started_manager(
        settings: ManagerSettings,
        targets: Arc<FakeTargets>,
        proxies: Arc<FakeProxyProvider>,
    ) -> Arc<ProxyManager> {
        let manager = ProxyManager::new(settings);
        manager.add_proxy_provider("fake", proxies);
        manager.add_target_provider(targets);
        manager.start().await.unwrap();
        manager
    }

    fn event(id: &str, action: TargetAction, targets: &Arc<FakeTargets>) -> TargetEvent {
        let provider: Arc<dyn TargetProvider> = targets.clone();
        TargetEvent::new(id, action, provider)
    }

    #[tokio::test]
    async fn test_start_requires_providers() {
        let manager = ProxyManager::new(ManagerSettings::default());
        assert!(matches!(manager.start().await, Err(Error::NoProxyProviders)));

        manager.add_proxy_provider("fake", Arc::new(FakeProxyProvider::default()));
        assert!(matches!(manager.start().await, Err(Error::NoTargetProviders)));

        manager.add_target_provider(Arc::new(FakeTargets::new("list", &[])));
        assert!(manager.start().await.is_ok());
        assert!(manager.lan_listener().is_none());
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_no_trace() {
        let hosts: Vec<(String, String)> = (0..10)
            .map(|i| (format!("t{}", i), format!("other{}", i)))
            .collect();
        let mut targets: Vec<(&str, &str)> = hosts.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        targets.push(("app-id", "App"));
        let targets = Arc::new(FakeTargets::new("list", &targets));
        let manager = started_manager(settings_with_lan(), targets.clone(), Arc::default()).await;

        let unrelated: Vec<_> = hosts
            .iter()
            .map(|(id, _)| manager.handle_proxy_event(event(id, TargetAction::Start, &targets)))
            .collect();

        manager
            .handle_proxy_event(event("app-id", TargetAction::Start, &targets))
            .await
            .unwrap();
        assert!(manager.get_proxy("APP").is_some());
        let lan = manager.lan_listener().unwrap();
        assert!(lan.hostnames().contains(&"app.tailnet.test".to_string()));

        manager
            .handle_proxy_event(event("app-id", TargetAction::Stop, &targets))
            .await
            .unwrap();
        for task in unrelated {
            task.await.unwrap();
        }

        assert!(manager.get_proxy("app").is_none());
        assert!(!lan.hostnames().iter().any(|h| h.starts_with("app")));
        assert_eq!(manager.get_proxies().len(), 10);
        assert_eq!(*targets.deleted.lock(), vec!["app-id".to_string()]);

        manager.stop_all_proxies().await;
    }

    #[tokio::test]
    async fn test_status_events_reach_subscribers() {
        let targets = Arc::new(FakeTargets::new("list", &[("1", "app")]));
        let manager = started_manager(ManagerSettings::default(), targets.clone(), Arc::default()).await;
        let (id, mut rx) = manager.subscribe_status_events();

        manager
            .handle_proxy_event(event("1", TargetAction::Start, &targets))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), ProxyEvent::new("app", ProxyStatus::Initializing));
        assert_eq!(rx.recv().await.unwrap(), ProxyEvent::new("app", ProxyStatus::Running));

        manager.unsubscribe_status_events(id);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_subscriber_never_blocks_broadcast() {
        let manager = ProxyManager::new(ManagerSettings {
            status_buffer: 1,
            ..ManagerSettings::default()
        });
        let (_id, _stalled) = manager.subscribe_status_events();
        let (_id, mut live) = manager.subscribe_status_events();
        let (_id, closed) = manager.subscribe_status_events();
        drop(closed);

        let started = Instant::now();
        for i in 0..1000 {
            manager.broadcast(ProxyEvent::new(format!("p{}", i), ProxyStatus::Running));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(live.recv().await.unwrap().id, "p0");
        assert_eq!(manager.subscribers.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_all_closes_proxies_concurrently() {
        let ids: Vec<(String, String)> = (0..50).map(|i| (i.to_string(), format!("proxy{}", i))).collect();
        let targets: Vec<(&str, &str)> = ids.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let targets = Arc::new(FakeTargets::new("list", &targets));
        let proxies = Arc::new(FakeProxyProvider {
            close_delay: Duration::from_millis(100),
            ..FakeProxyProvider::default()
        });
        let manager = started_manager(settings_with_lan(), targets.clone(), proxies.clone()).await;

        let starts: Vec<_> = ids
            .iter()
            .map(|(id, _)| manager.handle_proxy_event(event(id, TargetAction::Start, &targets)))
            .collect();
        for task in starts {
            task.await.unwrap();
        }
        assert_eq!(manager.get_proxies().len(), 50);
        let lan_addr = manager.lan_listener().unwrap().local_addr().unwrap();

        let started = Instant::now();
        manager.stop_all_proxies().await;
        assert!(started.elapsed() < Duration::from_secs(3));

        assert!(manager.get_proxies().is_empty());
        assert!(manager.lan_listener().is_none());
        assert!(proxies.built.lock().iter().all(|p| p.closed.load(Ordering::SeqCst)));
        assert!(tokio::net::TcpStream::connect(lan_addr).await.is_err());
    }

    #[tokio::test]
    async fn test_proxy_provider_resolution_order() {
        let manager = ProxyManager::new(ManagerSettings {
            default_proxy_provider: "global".to_string(),
            ..ManagerSettings::default()
        });
        let mut targets = FakeTargets::new("list", &[]);
        targets.default_proxy_provider = "from-target".to_string();
        manager.add_target_provider(Arc::new(targets));

        let global: Arc<dyn ProxyProvider> = Arc::new(FakeProxyProvider::default());
        let from_target: Arc<dyn ProxyProvider> = Arc::new(FakeProxyProvider::default());
        let explicit: Arc<dyn ProxyProvider> = Arc::new(FakeProxyProvider::default());
        manager.add_proxy_provider("global", global.clone());

        let mut config = ProxyConfig {
            hostname: "app".to_string(),
            target_id: "1".to_string(),
            target_provider: "list".to_string(),
            proxy_provider: None,
            ports: Vec::new(),
        };
        let resolved = manager.get_proxy_provider(&config).unwrap();
        assert!(Arc::ptr_eq(&resolved, &global));

        manager.add_proxy_provider("from-target", from_target.clone());
        let resolved = manager.get_proxy_provider(&config).unwrap();
        assert!(Arc::ptr_eq(&resolved, &from_target));

        manager.add_proxy_provider("explicit", explicit.clone());
        config.proxy_provider = Some("explicit".to_string());
        let resolved = manager.get_proxy_provider(&config).unwrap();
        assert!(Arc::ptr_eq(&resolved, &explicit));

        config.proxy_provider = Some("missing".to_string());
        assert!(matches!(
            manager.get_proxy_provider(&config),
            Err(Error::ProxyProviderNotFound(name)) if name == "missing"
        ));

        config.proxy_provider = None;
        config.target_provider = "nobody".to_string();
        assert!(matches!(
            manager.get_proxy_provider(&config),
            Err(Error::TargetProviderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replacement_closes_previous_proxy() {
        let targets = Arc::new(FakeTargets::new("list", &[("1", "app")]));
        let proxies = Arc::new(FakeProxyProvider::default());
        let manager = started_manager(settings_with_lan(), targets.clone(), proxies.clone()).await;

        for _ in 0..2 {
            manager
                .handle_proxy_event(event("1", TargetAction::Start, &targets))
                .await
                .unwrap();
        }

        let built = proxies.built.lock().clone();
        assert_eq!(built.len(), 2);
        assert!(built[0].closed.load(Ordering::SeqCst));
        assert!(!built[1].closed.load(Ordering::SeqCst));

        let current = manager.get_proxy("app").unwrap();
        let newest: Arc<dyn Proxy> = built[1].clone();
        assert!(same_proxy(&current, &newest));
        assert_eq!(manager.lan_listener().unwrap().hostnames(), vec!["app", "app.tailnet.test"]);

        manager.stop_all_proxies().await;
    }

    #[tokio::test]
    async fn test_stale_removal_keeps_replacement() {
        let targets = Arc::new(FakeTargets::new("list", &[("1", "app")]));
        let manager = started_manager(ManagerSettings::default(), targets.clone(), Arc::default()).await;
        manager
            .handle_proxy_event(event("1", TargetAction::Start, &targets))
            .await
            .unwrap();

        let stale: Arc<dyn Proxy> = Arc::new(FakeProxy {
            config: targets.add_target("1").await.unwrap(),
            status: Arc::new(|_: ProxyEvent| {}),
            close_delay: Duration::ZERO,
            closed: AtomicBool::new(false),
        });
        manager.remove_proxy("app", &stale).await;

        assert!(manager.get_proxy("app").is_some());
    }

    #[tokio::test]
    async fn test_stop_matches_owning_provider() {
        let targets = Arc::new(FakeTargets::new("list", &[("1", "app")]));
        let strangers = Arc::new(FakeTargets::new("other", &[("1", "elsewhere")]));
        let manager = started_manager(ManagerSettings::default(), targets.clone(), Arc::default()).await;
        manager.add_target_provider(strangers.clone());

        manager
            .handle_proxy_event(event("1", TargetAction::Start, &targets))
            .await
            .unwrap();
        manager
            .handle_proxy_event(event("1", TargetAction::Stop, &strangers))
            .await
            .unwrap();

        assert!(manager.get_proxy("app").is_some());
        assert!(strangers.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_restart_rebuilds_proxy() {
        let targets = Arc::new(FakeTargets::new("list", &[("1", "app")]));
        let proxies = Arc::new(FakeProxyProvider::default());
        let manager = started_manager(ManagerSettings::default(), targets.clone(), proxies.clone()).await;

        manager
            .handle_proxy_event(event("1", TargetAction::Start, &targets))
            .await
            .unwrap();
        manager
            .handle_proxy_event(event("1", TargetAction::Restart, &targets))
            .await
            .unwrap();

        assert_eq!(proxies.built.lock().len(), 2);
        assert!(proxies.built.lock()[0].closed.load(Ordering::SeqCst));
        assert!(manager.get_proxy("app").is_some());
        assert_eq!(*targets.deleted.lock(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_restarts_after_error() {
        let mut targets = FakeTargets::new("list", &[("1", "app")]);
        targets.fail_first = 2;
        let targets = Arc::new(targets);
        let manager = started_manager(
            ManagerSettings {
                watch: WatchSettings {
                    max_attempts: 0,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                },
                ..ManagerSettings::default()
            },
            targets.clone(),
            Arc::default(),
        )
        .await;

        manager.watch_events();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.get_proxy("app").is_none() {
            assert!(Instant::now() < deadline, "watch never recovered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(targets.watches.load(Ordering::SeqCst), 3);

        manager.stop_all_proxies().await;
        assert!(manager.get_proxies().is_empty());
    }

    #[tokio::test]
    async fn test_watch_gives_up_after_max_attempts() {
        let mut targets = FakeTargets::new("list", &[("1", "app")]);
        targets.fail_first = 10;
        let targets = Arc::new(targets);
        let manager = started_manager(
            ManagerSettings {
                watch: WatchSettings {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(5),
                },
                ..ManagerSettings::default()
            },
            targets.clone(),
            Arc::default(),
        )
        .await;

        manager.watch_events();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(targets.watches.load(Ordering::SeqCst), 2);
        assert!(manager.get_proxy("app").is_none());
        manager.stop_all_proxies().await;
    }

    #[test]
    fn test_watch_backoff_is_capped() {
        let policy = WatchSettings {
            max_attempts: 0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };

        assert_eq!(watch_backoff(0, &policy), Duration::ZERO);
        assert!(watch_backoff(1, &policy) >= Duration::from_millis(100));
        assert!(watch_backoff(2, &policy) >= Duration::from_millis(200));
        let capped = watch_backoff(20, &policy);
        assert!(capped >= Duration::from_millis(1000) && capped < Duration::from_millis(1100));
    }
}
