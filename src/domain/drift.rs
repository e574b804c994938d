//! Drift detector: diffs desired vs. actual config per server and
//! auto-remediates non-critical drift.
//!
//! Servers that are `deploying` are out of scope for both detection and
//! remediation. Remediation only writes through a server lease taken with
//! `try_lease`, so a server a rollout currently owns is never touched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::DriftConfig;

use super::fleet::{Fleet, ServerSlot};
use super::types::{Config, DriftDifference, DriftResult, DriftSeverity, Server, ServerStatus};

const CRITICAL_FIELDS: &[&str] = &["database_url", "api_key", "auth_secret", "tls_cert"];
const MAJOR_FIELDS: &[&str] = &["max_connections", "memory_limit", "worker_processes"];

/// Where desired and actual configs come from.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn desired(&self, server: &Server) -> Result<Config>;
    async fn actual(&self, server: &Server) -> Result<Config>;
}

/// Which non-critical tiers may be remediated automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationPolicy {
    pub remediate_major: bool,
    pub remediate_minor: bool,
}

impl Default for RemediationPolicy {
    fn default() -> Self {
        Self {
            remediate_major: true,
            remediate_minor: true,
        }
    }
}

impl RemediationPolicy {
    pub fn allows(&self, drift: &DriftResult) -> bool {
        drift.auto_remediate
            && drift.differences.iter().all(|d| match d.severity {
                DriftSeverity::Critical => false,
                DriftSeverity::Major => self.remediate_major,
                DriftSeverity::Minor => self.remediate_minor,
            })
    }
}

/// Counters for one detection pass over the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub scanned: usize,
    pub skipped: usize,
    pub drifted: usize,
    pub remediated: usize,
    pub failed: usize,
}

enum Outcome {
    Clean,
    Drifted,
    Remediated,
}

pub struct DriftDetector {
    interval: Duration,
    remediation_delay: Duration,
    policy: RemediationPolicy,
    shutdown: watch::Sender<bool>,
}

impl DriftDetector {
    pub fn new(config: &DriftConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            interval: Duration::from_secs(config.interval_secs),
            remediation_delay: Duration::from_millis(config.remediation_delay_ms),
            policy: RemediationPolicy {
                remediate_major: config.remediate_major,
                remediate_minor: config.remediate_minor,
            },
            shutdown,
        }
    }

    /// Structural diff of `desired.content` against `actual.content`.
    pub fn detect_drift(server: &Server, desired: &Config, actual: &Config) -> DriftResult {
        let mut differences = Vec::new();

        match (desired.content.as_object(), actual.content.as_object()) {
            (Some(d), Some(a)) => diff_maps("", None, d, a, &mut differences),
            _ if desired.content != actual.content => differences.push(DriftDifference {
                path: "root".to_string(),
                desired: Some(desired.content.clone()),
                actual: Some(actual.content.clone()),
                severity: classify(""),
            }),
            _ => {}
        }

        let has_critical = differences
            .iter()
            .any(|d| d.severity == DriftSeverity::Critical);

        DriftResult {
            server_id: server.id.clone(),
            detected: !differences.is_empty(),
            differences,
            auto_remediate: !has_critical,
            timestamp: Utc::now(),
        }
    }

    /// Run detection on a fixed interval until `stop()`. The first cycle
    /// runs immediately.
    pub fn start(
        self: &Arc<Self>,
        fleet: Fleet,
        provider: Arc<dyn ConfigProvider>,
        on_drift: UnboundedSender<DriftResult>,
    ) -> JoinHandle<()> {
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let detector = self.clone();

        tokio::spawn(async move {
            info!(
                interval_secs = detector.interval.as_secs(),
                servers = fleet.len(),
                "starting continuous drift detection"
            );
            let mut interval = tokio::time::interval(detector.interval);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                info!(servers = fleet.len(), "running drift detection");
                let summary = detector.run_cycle(&fleet, provider.as_ref(), &on_drift).await;
                info!(
                    scanned = summary.scanned,
                    skipped = summary.skipped,
                    drifted = summary.drifted,
                    remediated = summary.remediated,
                    failed = summary.failed,
                    "drift detection cycle finished"
                );
            }

            info!("drift detection stopped");
        })
    }

    /// Stop before the next tick. A cycle already running finishes.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// One pass over the fleet in stable order. Per-server failures are
    /// logged and counted, never propagated.
    pub async fn run_cycle(
        &self,
        fleet: &Fleet,
        provider: &dyn ConfigProvider,
        on_drift: &UnboundedSender<DriftResult>,
    ) -> CycleSummary {
        let mut summary = CycleSummary::default();

        for slot in fleet.slots() {
            let server = slot.read().await;
            summary.scanned += 1;

            if server.status == ServerStatus::Deploying {
                debug!(server_id = %server.id, "server is deploying, skipping drift check");
                summary.skipped += 1;
                continue;
            }

            match self.check_server(slot, &server, provider, on_drift).await {
                Ok(Outcome::Clean) => {}
                Ok(Outcome::Drifted) => summary.drifted += 1,
                Ok(Outcome::Remediated) => {
                    summary.drifted += 1;
                    summary.remediated += 1;
                }
                Err(e) => {
                    warn!(server_id = %server.id, error = %e, "error detecting drift");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn check_server(
        &self,
        slot: &ServerSlot,
        server: &Server,
        provider: &dyn ConfigProvider,
        on_drift: &UnboundedSender<DriftResult>,
    ) -> Result<Outcome> {
        let desired = provider
            .desired(server)
            .await
            .with_context(|| format!("fetching desired config for {}", server.id))?;
        let actual = provider
            .actual(server)
            .await
            .with_context(|| format!("fetching actual config for {}", server.id))?;

        let drift = Self::detect_drift(server, &desired, &actual);
        if !drift.detected {
            return Ok(Outcome::Clean);
        }

        info!(
            server_id = %server.id,
            differences = drift.differences.len(),
            auto_remediate = drift.auto_remediate,
            "drift detected"
        );
        let remediate = self.policy.allows(&drift);
        let _ = on_drift.send(drift);

        if remediate && self.remediate(slot, &server.id, &desired).await {
            return Ok(Outcome::Remediated);
        }
        Ok(Outcome::Drifted)
    }

    async fn remediate(&self, slot: &ServerSlot, server_id: &str, desired: &Config) -> bool {
        let Some(lease) = slot.try_lease() else {
            debug!(server_id, "server owned by a deployment, skipping remediation");
            return false;
        };

        let current = lease.server().await;
        if current.status == ServerStatus::Deploying || current.id != server_id {
            warn!(server_id, "server changed since detection, remediation aborted");
            return false;
        }

        info!(server_id, version = %desired.version, "auto-remediating drift");
        sleep(self.remediation_delay).await;

        lease
            .update(|s| {
                s.current_config_version = desired.version.clone();
                s.last_sync = Utc::now();
            })
            .await;

        info!(server_id, "remediation completed");
        true
    }
}

/// Severity of a difference, keyed on the top-level field name.
pub fn classify(field: &str) -> DriftSeverity {
    if CRITICAL_FIELDS.iter().any(|f| field.contains(f)) {
        DriftSeverity::Critical
    } else if MAJOR_FIELDS.iter().any(|f| field.contains(f)) {
        DriftSeverity::Major
    } else {
        DriftSeverity::Minor
    }
}

fn diff_maps(
    prefix: &str,
    root_key: Option<&str>,
    desired: &Map<String, Value>,
    actual: &Map<String, Value>,
    out: &mut Vec<DriftDifference>,
) {
    let keys = desired
        .keys()
        .chain(actual.keys().filter(|k| !desired.contains_key(k.as_str())));

    for key in keys {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let root = root_key.unwrap_or(key);

        match (desired.get(key), actual.get(key)) {
            (Some(Value::Object(d)), Some(Value::Object(a))) => {
                diff_maps(&path, Some(root), d, a, out);
            }
            // Scalars and arrays compare as a whole.
            (d, a) if d != a => out.push(DriftDifference {
                path,
                desired: d.cloned(),
                actual: a.cloned(),
                severity: classify(root),
            }),
            _ => {}
        }
    }
}
