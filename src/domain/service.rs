//! Config management service: owns the fleet and wires the reconciler,
//! canary controller, drift detector, and validator together.
//!
//! Two call sites reach the rollout critical section:
//!   GitOps commit  → deploy_configuration (trusted, not validated)
//!   Operator       → trigger_deployment → validate → deploy_configuration
//! Both go through the controller's single in-progress guard.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{probability, EngineConfig};

use super::canary::{CanaryController, HealthProbe, SimulatedHealthProbe};
use super::drift::{ConfigProvider, CycleSummary, DriftDetector};
use super::error::DeployError;
use super::fleet::{Fleet, FleetSummary};
use super::gitops::{ChangeSource, GitOpsReconciler, SimulatedGitSource};
use super::types::{
    Config, DeploymentStatus, DriftResult, Environment, Server, ValidationResult,
};
use super::validator::ConfigValidator;

/// Version marker written by `simulate_drift`.
pub const MANUAL_CHANGE_VERSION: &str = "manual-change";

/// Streams handed to the caller by `initialize`.
pub struct ServiceEvents {
    pub progress: UnboundedReceiver<DeploymentStatus>,
    pub drift: UnboundedReceiver<DriftResult>,
    pub servers: watch::Receiver<Vec<Server>>,
}

fn baseline_content() -> Value {
    json!({
        "worker_processes": 8,
        "max_connections": 1000,
        "memory_limit": "2GB",
    })
}

/// Desired config follows the reconciler; actual config is simulated from
/// each server's current version.
pub struct SimulatedConfigProvider {
    reconciler: Arc<GitOpsReconciler>,
    service: String,
    environment: Environment,
    drift_rate: f64,
}

impl SimulatedConfigProvider {
    pub fn new(
        reconciler: Arc<GitOpsReconciler>,
        service: &str,
        environment: Environment,
        drift_rate: f64,
    ) -> Self {
        Self {
            reconciler,
            service: service.to_string(),
            environment,
            drift_rate: probability(drift_rate),
        }
    }

    fn config(&self, id: &str, version: String, content: Value, author: &str) -> Config {
        let mut config = Config::new(self.service.clone(), self.environment, content, author);
        config.id = id.to_string();
        config.version = version;
        config
    }
}

#[async_trait]
impl ConfigProvider for SimulatedConfigProvider {
    async fn desired(&self, _server: &Server) -> Result<Config> {
        let version = self.reconciler.current_version().await;
        Ok(self.config("desired", version, baseline_content(), "system"))
    }

    async fn actual(&self, server: &Server) -> Result<Config> {
        let manual = server.current_config_version == MANUAL_CHANGE_VERSION;
        let drifted = manual || rand::rng().random_bool(self.drift_rate);

        let mut content = baseline_content();
        if drifted {
            content["worker_processes"] = json!(4);
        }
        if manual {
            content["log_level"] = json!("debug");
        }

        let author = if drifted { "manual" } else { "system" };
        Ok(self.config("actual", server.current_config_version.clone(), content, author))
    }
}

pub struct ConfigManagementService {
    config: EngineConfig,
    validator: ConfigValidator,
    canary: Arc<CanaryController>,
    drift: Arc<DriftDetector>,
    reconciler: Arc<GitOpsReconciler>,
    provider: Arc<dyn ConfigProvider>,
    fleet: Fleet,
    progress_tx: UnboundedSender<DeploymentStatus>,
    drift_tx: UnboundedSender<DriftResult>,
    servers_tx: watch::Sender<Vec<Server>>,
    shutdown: watch::Sender<bool>,
    events: Mutex<Option<ServiceEvents>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConfigManagementService {
    /// Service with simulated health, git, and actual-config sources.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let probe = Arc::new(SimulatedHealthProbe::new(config.canary.simulated_failure_rate));
        let source = Arc::new(SimulatedGitSource::new(&config.gitops, config.fleet.environment));
        Self::with_collaborators(config, probe, source)
    }

    /// Fails when `config` does not pass `EngineConfig::validate`.
    pub fn with_collaborators(
        config: EngineConfig,
        probe: Arc<dyn HealthProbe>,
        source: Arc<dyn ChangeSource>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let canary = Arc::new(CanaryController::new(&config.canary, probe)?);

        let fleet = Fleet::generate(
            config.fleet.size,
            config.fleet.environment,
            &config.fleet.initial_version,
            &config.fleet.domain,
        );
        let reconciler = Arc::new(GitOpsReconciler::new(
            &config.gitops,
            &config.fleet.initial_version,
            source,
        ));
        let provider = Arc::new(SimulatedConfigProvider::new(
            reconciler.clone(),
            &config.gitops.service,
            config.fleet.environment,
            config.drift.simulated_drift_rate,
        ));

        let (progress_tx, progress) = mpsc::unbounded_channel();
        let (drift_tx, drift) = mpsc::unbounded_channel();
        let (servers_tx, servers) = watch::channel(Vec::new());
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            validator: ConfigValidator::new(config.validation.clone()),
            canary,
            drift: Arc::new(DriftDetector::new(&config.drift)),
            reconciler,
            provider,
            fleet,
            progress_tx,
            drift_tx,
            servers_tx,
            shutdown,
            events: Mutex::new(Some(ServiceEvents {
                progress,
                drift,
                servers,
            })),
            tasks: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Start reconciliation (commits deploy without validation), continuous
    /// drift detection, and fleet publishing. Returns the event streams.
    pub async fn initialize(self: &Arc<Self>) -> Result<ServiceEvents> {
        let events = self.take_events().await?;

        info!(
            servers = self.fleet.len(),
            environment = %self.config.fleet.environment,
            "initializing config management service"
        );
        self.publish_servers().await;

        let mut tasks = self.tasks.lock().await;

        let (change_tx, change_rx) = mpsc::unbounded_channel();
        tasks.push(self.reconciler.start(change_tx));
        tasks.push(self.spawn_change_consumer(change_rx));

        tasks.push(self.drift.start(
            self.fleet.clone(),
            self.provider.clone(),
            self.drift_tx.clone(),
        ));

        tasks.push(self.spawn_fleet_publisher());

        Ok(events)
    }

    /// Hand out the event streams without starting any background loop.
    /// Only one caller ever gets them.
    pub async fn take_events(&self) -> Result<ServiceEvents> {
        match self.events.lock().await.take() {
            Some(events) => Ok(events),
            None => bail!("service events already taken"),
        }
    }

    fn spawn_change_consumer(self: &Arc<Self>, mut changes: UnboundedReceiver<Config>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(config) = changes.recv().await {
                // One task per commit: a commit arriving mid-rollout hits the
                // in-progress guard and is skipped rather than queued.
                let service = service.clone();
                tokio::spawn(async move {
                    info!(version = %config.version, "deploying configuration from git");
                    match service.deploy_configuration(&config).await {
                        Ok(_) => info!(version = %config.version, "configuration deployed successfully"),
                        Err(DeployError::AlreadyInProgress) => {
                            warn!(version = %config.version, "deployment already in progress, skipping")
                        }
                        Err(e) => error!(error = %e, "deployment failed"),
                    }
                });
            }
        })
    }

    fn spawn_fleet_publisher(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_millis(self.config.fleet.publish_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                service.publish_servers().await;
            }
        })
    }

    /// The operator path: validate a fresh candidate and deploy it if valid.
    pub async fn trigger_deployment(&self) -> Result<ValidationResult, DeployError> {
        self.deploy_candidate(self.candidate_config()).await
    }

    /// Validate `config` and roll it out if valid. A running deployment
    /// yields a synthetic `deployment` error instead of blocking.
    pub async fn deploy_candidate(&self, config: Config) -> Result<ValidationResult, DeployError> {
        if self.canary.is_deploying() {
            warn!("deployment already in progress");
            return Ok(ValidationResult::deployment_in_progress());
        }

        let validation = self.validator.validate(&config);
        if !validation.valid {
            info!(
                version = %config.version,
                errors = validation.errors.len(),
                "candidate rejected by validation"
            );
            return Ok(validation);
        }

        match self.deploy_configuration(&config).await {
            Ok(_) => Ok(validation),
            Err(DeployError::AlreadyInProgress) => Ok(ValidationResult::deployment_in_progress()),
            Err(e) => Err(e),
        }
    }

    /// The candidate an operator trigger deploys.
    pub fn candidate_config(&self) -> Config {
        Config::new(
            self.config.gitops.service.clone(),
            self.config.fleet.environment,
            json!({
                "worker_processes": 8,
                "max_connections": 1000,
                "memory_limit": "2GB",
                "tls_verify": true,
                "log_level": "info",
            }),
            "ops-team",
        )
    }

    async fn deploy_configuration(&self, config: &Config) -> Result<DeploymentStatus, DeployError> {
        let result = self
            .canary
            .deploy(config, &self.fleet, &self.progress_tx)
            .await;

        match &result {
            Ok(status) => info!(deployment_id = %status.id, "configuration deployed"),
            Err(DeployError::AlreadyInProgress) => {}
            Err(e) => error!(error = %e, "deployment failed"),
        }

        self.publish_servers().await;
        result
    }

    /// Overwrite a random server's version as if someone edited it by hand.
    /// Returns the server id, or `None` if that server is mid-rollout.
    pub async fn simulate_drift(&self) -> Option<String> {
        if self.fleet.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.fleet.len());
        let slot = self.fleet.slot(index)?;

        let Some(lease) = slot.try_lease() else {
            warn!(index, "server owned by a deployment, not simulating drift");
            return None;
        };
        let id = lease
            .update(|s| {
                s.current_config_version = MANUAL_CHANGE_VERSION.to_string();
                s.id.clone()
            })
            .await;
        drop(lease);

        info!(server_id = %id, "simulating drift");
        self.publish_servers().await;
        Some(id)
    }

    /// One drift pass outside the continuous loop.
    pub async fn run_drift_cycle(&self) -> CycleSummary {
        let summary = self
            .drift
            .run_cycle(&self.fleet, self.provider.as_ref(), &self.drift_tx)
            .await;
        self.publish_servers().await;
        summary
    }

    pub async fn servers(&self) -> Vec<Server> {
        self.fleet.snapshot().await
    }

    pub async fn summary(&self) -> FleetSummary {
        self.fleet.summary().await
    }

    pub fn is_deploying(&self) -> bool {
        self.canary.is_deploying()
    }

    pub async fn current_version(&self) -> String {
        self.reconciler.current_version().await
    }

    pub fn validator(&self) -> &ConfigValidator {
        &self.validator
    }

    /// Stop the background loops before their next tick. In-flight cycles
    /// and rollouts run to completion.
    pub fn stop(&self) {
        info!("stopping config management service");
        self.reconciler.stop();
        self.drift.stop();
        self.shutdown.send_replace(true);
    }

    /// Wait for the background loops to exit, up to `timeout`.
    pub async fn join(&self, timeout: Duration) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "background task failed"),
                Err(_) => warn!("background task did not stop in time"),
            }
        }
    }

    async fn publish_servers(&self) {
        let snapshot = self.fleet.snapshot().await;
        self.servers_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CanaryStage, DeploymentState, HealthMetrics};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct FixedProbe {
        healthy: bool,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn sample(&self, _targets: &[Server]) -> Result<HealthMetrics> {
            Ok(HealthMetrics {
                error_rate: if self.healthy { 0.1 } else { 9.0 },
                latency_p95: 50.0,
                cpu_usage: 40.0,
                memory_usage: 50.0,
                is_healthy: self.healthy,
            })
        }
    }

    struct QueuedSource {
        commits: StdMutex<VecDeque<Config>>,
    }

    #[async_trait]
    impl ChangeSource for QueuedSource {
        async fn poll(&self) -> Result<Option<Config>> {
            Ok(self.commits.lock().unwrap().pop_front())
        }
    }

    fn engine_config(size: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.fleet.size = size;
        config.drift.simulated_drift_rate = 0.0;
        config
    }

    fn service(size: usize, healthy: bool, commits: Vec<Config>) -> Arc<ConfigManagementService> {
        ConfigManagementService::with_collaborators(
            engine_config(size),
            Arc::new(FixedProbe { healthy }),
            Arc::new(QueuedSource {
                commits: StdMutex::new(commits.into()),
            }),
        )
        .unwrap()
    }

    fn git_commit(version: &str) -> Config {
        let mut commit = Config::new(
            "nginx",
            Environment::Prod,
            json!({"worker_processes": 4, "tls_verify": true}),
            "gitops",
        );
        commit.version = version.to_string();
        commit
    }

    #[test]
    fn rejects_config_the_controller_cannot_run() {
        let mut config = engine_config(10);
        config.canary.stages = vec![CanaryStage::new(150, 0, 0)];
        let built = ConfigManagementService::with_collaborators(
            config,
            Arc::new(FixedProbe { healthy: true }),
            Arc::new(QueuedSource {
                commits: StdMutex::new(VecDeque::new()),
            }),
        );
        assert!(built.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn git_commit_during_operator_rollout_is_skipped() {
        let svc = service(10, true, vec![git_commit("v9.9.9")]);
        let mut events = svc.initialize().await.unwrap();

        // The reconciler's first poll lands 30s in, inside the first stage.
        let mut candidate = svc.candidate_config();
        candidate.version = "v2.0.0".to_string();
        let operator = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.deploy_candidate(candidate).await })
        };
        assert!(operator.await.unwrap().unwrap().valid);
        assert_eq!(svc.current_version().await, "v9.9.9");

        // A queued commit would start its own rollout here.
        tokio::time::sleep(Duration::from_secs(120)).await;

        let mut snapshots = Vec::new();
        while let Ok(status) = events.progress.try_recv() {
            snapshots.push(status);
        }
        let terminal: Vec<_> = snapshots
            .iter()
            .filter(|s| s.status.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].status, DeploymentState::Completed);
        assert!(snapshots.iter().all(|s| s.config_version == "v2.0.0"));
        assert_eq!(svc.summary().await.versions.get("v2.0.0"), Some(&10));
        assert!(!svc.is_deploying());

        svc.stop();
        svc.join(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_deploys_valid_candidate_fleet_wide() {
        let svc = service(100, true, vec![]);
        let result = svc.trigger_deployment().await.unwrap();

        assert!(result.valid);
        // prod target is advisory only
        assert!(result.warnings.iter().any(|w| w.rule == "impact"));

        let summary = svc.summary().await;
        assert_eq!(summary.total, 100);
        assert_eq!(summary.healthy, 100);
        assert_eq!(summary.versions.len(), 1);
        assert!(!summary.versions.contains_key("v1.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_candidate_never_reaches_the_fleet() {
        let svc = service(10, true, vec![]);
        let mut candidate = svc.candidate_config();
        candidate.content["tls_verify"] = json!(false);

        let result = svc.deploy_candidate(candidate).await.unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors[0].rule, "security");
        assert!(svc
            .servers()
            .await
            .iter()
            .all(|s| s.current_config_version == "v1.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_trigger_gets_deployment_error() {
        let svc = service(20, true, vec![]);

        let first = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.trigger_deployment().await })
        };
        while !svc.is_deploying() {
            tokio::task::yield_now().await;
        }

        let second = svc.trigger_deployment().await.unwrap();
        assert!(!second.valid);
        assert_eq!(second.errors.len(), 1);
        assert_eq!(second.errors[0].rule, "deployment");
        assert!(second.warnings.is_empty());

        assert!(first.await.unwrap().unwrap().valid);
    }

    #[tokio::test(start_paused = true)]
    async fn health_regression_surfaces_as_error() {
        let svc = service(100, false, vec![]);
        let err = svc.trigger_deployment().await.unwrap_err();
        assert!(matches!(err, DeployError::RolledBack { stage: 1, .. }));

        let summary = svc.summary().await;
        assert_eq!(summary.healthy, 100);
        assert_eq!(summary.versions.get("v1.0.0"), Some(&100));
        assert!(!svc.is_deploying());
    }

    #[tokio::test(start_paused = true)]
    async fn gitops_commit_is_rolled_out_without_validation() {
        let mut commit = Config::new(
            "nginx",
            Environment::Prod,
            // Would fail validation; git commits are trusted.
            json!({"worker_processes": 8, "tls_verify": false}),
            "gitops",
        );
        commit.version = "v2.0.0".to_string();
        let svc = service(10, true, vec![commit]);

        let mut events = svc.initialize().await.unwrap();
        assert_eq!(events.servers.borrow().len(), 10);

        loop {
            let status = events.progress.recv().await.unwrap();
            assert_eq!(status.config_version, "v2.0.0");
            if status.status.is_terminal() {
                assert_eq!(status.status, DeploymentState::Completed);
                break;
            }
        }

        assert_eq!(svc.current_version().await, "v2.0.0");
        assert_eq!(svc.summary().await.versions.get("v2.0.0"), Some(&10));

        svc.stop();
        svc.join(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_only_once() {
        let svc = service(2, true, vec![]);
        let _events = svc.initialize().await.unwrap();
        assert!(svc.initialize().await.is_err());
        svc.stop();
        svc.join(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_drift_is_detected_and_remediated() {
        let svc = service(5, true, vec![]);
        let id = svc.simulate_drift().await.unwrap();

        let drifted = svc
            .servers()
            .await
            .into_iter()
            .find(|s| s.id == id)
            .unwrap();
        assert_eq!(drifted.current_config_version, MANUAL_CHANGE_VERSION);

        let summary = svc.run_drift_cycle().await;
        assert_eq!(summary.drifted, 1);
        assert_eq!(summary.remediated, 1);

        let mut drift_rx = svc.take_events().await.unwrap().drift;
        let result = drift_rx.try_recv().unwrap();
        assert_eq!(result.server_id, id);
        assert!(result.auto_remediate);

        assert!(svc
            .servers()
            .await
            .iter()
            .all(|s| s.current_config_version == "v1.0.0"));
    }
}
