//! GitOps reconciler: polls a change source on a fixed interval and emits
//! newly committed configs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{probability, GitOpsConfig};

use super::types::{Config, Environment};

/// Opaque producer of configs (a Git repository in production).
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// The latest committed config, or `None` when nothing new was pushed.
    async fn poll(&self) -> Result<Option<Config>>;
}

/// Produces a new commit with probability `change_probability` per poll.
pub struct SimulatedGitSource {
    service: String,
    environment: Environment,
    change_probability: f64,
}

impl SimulatedGitSource {
    pub fn new(config: &GitOpsConfig, environment: Environment) -> Self {
        Self {
            service: config.service.clone(),
            environment,
            change_probability: probability(config.change_probability),
        }
    }

    fn draw(&self) -> Option<Config> {
        let mut rng = rand::rng();
        if !rng.random_bool(self.change_probability) {
            return None;
        }

        let workers = [2, 4, 8, 16].choose(&mut rng).copied().unwrap_or(8);
        let log_level = ["info", "warn", "debug"].choose(&mut rng).copied().unwrap_or("info");
        let content = json!({
            "worker_processes": workers,
            "max_connections": 1000,
            "memory_limit": "2GB",
            "tls_verify": true,
            "log_level": log_level,
        });

        Some(Config::new(
            self.service.clone(),
            self.environment,
            content,
            "gitops",
        ))
    }
}

#[async_trait]
impl ChangeSource for SimulatedGitSource {
    async fn poll(&self) -> Result<Option<Config>> {
        Ok(self.draw())
    }
}

struct Applied {
    version: String,
    checksum: Option<String>,
}

pub struct GitOpsReconciler {
    interval: Duration,
    source: Arc<dyn ChangeSource>,
    current: RwLock<Applied>,
    shutdown: watch::Sender<bool>,
}

impl GitOpsReconciler {
    pub fn new(config: &GitOpsConfig, initial_version: &str, source: Arc<dyn ChangeSource>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            interval: Duration::from_secs(config.interval_secs),
            source,
            current: RwLock::new(Applied {
                version: initial_version.to_string(),
                checksum: None,
            }),
            shutdown,
        }
    }

    /// Version of the most recently emitted config.
    pub async fn current_version(&self) -> String {
        self.current.read().await.version.clone()
    }

    /// Poll once. Returns the config when it differs from the last one
    /// emitted (by version or content checksum).
    pub async fn reconcile_once(&self) -> Result<Option<Config>> {
        let Some(config) = self.source.poll().await? else {
            return Ok(None);
        };

        let checksum = config.checksum();
        let mut current = self.current.write().await;
        if current.version == config.version && current.checksum.as_deref() == Some(checksum.as_str()) {
            debug!(version = %config.version, "config already applied");
            return Ok(None);
        }

        current.version = config.version.clone();
        current.checksum = Some(checksum);
        Ok(Some(config))
    }

    /// Poll every interval until `stop()`, sending new configs to `on_change`.
    pub fn start(self: &Arc<Self>, on_change: UnboundedSender<Config>) -> JoinHandle<()> {
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let reconciler = self.clone();

        tokio::spawn(async move {
            info!(
                interval_secs = reconciler.interval.as_secs(),
                "starting gitops reconciliation"
            );
            let mut interval = interval_at(Instant::now() + reconciler.interval, reconciler.interval);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                match reconciler.reconcile_once().await {
                    Ok(Some(config)) => {
                        info!(
                            version = %config.version,
                            checksum = %config.checksum(),
                            "new configuration detected from git"
                        );
                        if on_change.send(config).is_err() {
                            warn!("config change receiver dropped, stopping reconciliation");
                            break;
                        }
                    }
                    Ok(None) => debug!("no configuration change"),
                    Err(e) => warn!(error = %e, "failed to poll change source"),
                }
            }

            info!("gitops reconciliation stopped");
        })
    }

    /// Halt future ticks.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}
