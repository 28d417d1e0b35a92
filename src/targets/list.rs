//! Target list provider.
//!
//! Targets are declared in a TOML file:
//!
//! ```toml
//! [targets.whoami]
//! hostname = "whoami"
//!
//! [[targets.whoami.ports]]
//! proxy_port = 443
//! targets = ["http://127.0.0.1:8080"]
//! ```
//!
//! The file is polled; added targets start, removed ones stop and changed
//! ones restart.

use crate::model::{PortConfig, ProxyConfig};
use crate::target::{TargetAction, TargetEvent, TargetProvider};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One declared target
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetEntry {
    /// Defaults to the target's id
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub proxy_provider: Option<String>,

    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct TargetFile {
    #[serde(default)]
    targets: BTreeMap<String, TargetEntry>,
}

#[derive(Debug, Clone)]
pub struct ListSettings {
    pub path: PathBuf,
    /// Proxy provider for targets that do not name one
    pub default_proxy_provider: String,
    pub poll_interval: Duration,
}

pub struct ListProvider {
    name: String,
    settings: ListSettings,
    /// Last successfully loaded file contents
    targets: RwLock<BTreeMap<String, TargetEntry>>,
}

impl ListProvider {
    pub fn new(name: impl Into<String>, settings: ListSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            targets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Read and validate the target file
    pub async fn load(&self) -> anyhow::Result<BTreeMap<String, TargetEntry>> {
        let path = &self.settings.path;
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read target list: {}", path.display()))?;
        parse_targets(&content).with_context(|| format!("Invalid target list: {}", path.display()))
    }

    /// Reload the file, returning the events that bring the manager in line
    /// with it
    async fn refresh(&self) -> anyhow::Result<Vec<(String, TargetAction)>> {
        let current = self.load().await?;
        let mut known = self.targets.write();
        let changes = diff_targets(&known, &current);
        *known = current;
        Ok(changes)
    }
}

fn parse_targets(content: &str) -> anyhow::Result<BTreeMap<String, TargetEntry>> {
    let file: TargetFile = toml::from_str(content)?;

    let mut errors = Vec::new();
    for (id, entry) in &file.targets {
        if entry.ports.is_empty() {
            errors.push(format!("target '{}' has no ports", id));
        }
        let mut seen = BTreeSet::new();
        for port in &entry.ports {
            if let Err(e) = port.validate() {
                errors.push(format!("target '{}' port {}: {}", id, port.proxy_port, e));
            }
            if port.proxy_port != 0 && !seen.insert(port.proxy_port) {
                errors.push(format!("target '{}' publishes port {} more than once", id, port.proxy_port));
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Target list errors:\n  - {}", errors.join("\n  - "));
    }
    Ok(file.targets)
}

/// Start for added, Stop for removed, Restart for changed targets
fn diff_targets(
    known: &BTreeMap<String, TargetEntry>,
    current: &BTreeMap<String, TargetEntry>,
) -> Vec<(String, TargetAction)> {
    let mut changes = Vec::new();
    for id in known.keys() {
        if !current.contains_key(id) {
            changes.push((id.clone(), TargetAction::Stop));
        }
    }
    for (id, entry) in current {
        match known.get(id) {
            None => changes.push((id.clone(), TargetAction::Start)),
            Some(previous) if previous != entry => changes.push((id.clone(), TargetAction::Restart)),
            Some(_) => {}
        }
    }
    changes
}

#[async_trait]
impl TargetProvider for ListProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch_events(
        self: Arc<Self>,
        token: CancellationToken,
        events: mpsc::Sender<TargetEvent>,
        errors: mpsc::Sender<anyhow::Error>,
    ) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(provider = %self.name, path = %self.settings.path.display(), "Watching target list");

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }

            let changes = match self.refresh().await {
                Ok(changes) => changes,
                Err(e) => {
                    let _ = errors.send(e).await;
                    token.cancelled().await;
                    return;
                }
            };

            for (id, action) in changes {
                debug!(provider = %self.name, target_id = %id, action = %action, "Target list changed");
                let provider: Arc<dyn TargetProvider> = self.clone();
                if events.send(TargetEvent::new(id, action, provider)).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn add_target(&self, id: &str) -> anyhow::Result<ProxyConfig> {
        let entry = self
            .targets
            .read()
            .get(id)
            .cloned()
            .with_context(|| format!("target '{}' not found in {}", id, self.name))?;

        Ok(ProxyConfig {
            hostname: entry.hostname.unwrap_or_else(|| id.to_string()),
            target_id: id.to_string(),
            target_provider: self.name.clone(),
            proxy_provider: entry.proxy_provider,
            ports: entry.ports,
        })
    }

    async fn delete_proxy(&self, id: &str) -> anyhow::Result<()> {
        // The file stays authoritative; nothing to tear down here
        debug!(provider = %self.name, target_id = %id, "Released target");
        Ok(())
    }

    fn default_proxy_provider_name(&self) -> String {
        self.settings.default_proxy_provider.clone()
    }
}
