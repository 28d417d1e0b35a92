//! Target providers: pluggable sources of target lifecycle events

use crate::model::ProxyConfig;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    Start,
    Stop,
    /// Stop followed by Start; not atomic
    Restart,
}

impl fmt::Display for TargetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAction::Start => f.write_str("start"),
            TargetAction::Stop => f.write_str("stop"),
            TargetAction::Restart => f.write_str("restart"),
        }
    }
}

/// A lifecycle change of one target, consumed once by the manager
#[derive(Clone)]
pub struct TargetEvent {
    pub id: String,
    pub action: TargetAction,
    pub provider: Arc<dyn TargetProvider>,
}

impl TargetEvent {
    pub fn new(id: impl Into<String>, action: TargetAction, provider: Arc<dyn TargetProvider>) -> Self {
        Self {
            id: id.into(),
            action,
            provider,
        }
    }
}

impl fmt::Debug for TargetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetEvent")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Source of targets, authoritative for the configuration each one gets
#[async_trait]
pub trait TargetProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Emit events until `token` is cancelled or the provider hits a fatal
    /// condition. Recoverable problems go to `errors`.
    async fn watch_events(
        self: Arc<Self>,
        token: CancellationToken,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<anyhow::Error>,
    );

    /// Materialize the proxy configuration for a target
    async fn add_target(&self, id: &str) -> anyhow::Result<ProxyConfig>;

    /// Forget the proxy configuration of a target
    async fn delete_proxy(&self, id: &str) -> anyhow::Result<()>;

    /// Proxy provider used when a target does not name one
    fn default_proxy_provider_name(&self) -> String;
}
