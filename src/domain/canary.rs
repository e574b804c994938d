//! Canary controller: progressive rollout gated on live health samples.
//!
//! A rollout walks the stage table in ascending percentage order. Each stage
//! applies the config to the first `ceil(total * pct / 100)` servers, then
//! samples health every `health_check_interval` until the stage duration
//! elapses. The first unhealthy sample rolls back every server targeted by
//! that stage and fails the rollout; later stages never run.
//!
//! At most one rollout runs at a time. Entry is a compare-and-set on the
//! `deploying` flag and exit is a drop guard, so the flag is cleared on
//! success, rollback, or panic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{probability, CanaryConfig};

use super::error::DeployError;
use super::fleet::Fleet;
use super::types::{
    CanaryStage, Config, DeploymentState, DeploymentStatus, HealthMetrics, Server, ServerStatus,
};

/// Source of health samples for the servers a stage targets.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn sample(&self, targets: &[Server]) -> Result<HealthMetrics>;
}

/// Random health samples with an injected failure rate.
pub struct SimulatedHealthProbe {
    failure_rate: f64,
}

impl SimulatedHealthProbe {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: probability(failure_rate),
        }
    }

    fn draw(&self) -> HealthMetrics {
        let mut rng = rand::rng();
        let error_rate = rng.random_range(0.0..0.3);
        let latency_p95 = rng.random_range(50.0..80.0);
        let cpu_usage = rng.random_range(40.0..60.0);
        let memory_usage = rng.random_range(50.0..70.0);

        if rng.random_bool(self.failure_rate) {
            return HealthMetrics {
                error_rate: 5.0,
                latency_p95: 500.0,
                cpu_usage,
                memory_usage,
                is_healthy: false,
            };
        }

        HealthMetrics {
            error_rate,
            latency_p95,
            cpu_usage,
            memory_usage,
            is_healthy: true,
        }
    }
}

#[async_trait]
impl HealthProbe for SimulatedHealthProbe {
    async fn sample(&self, _targets: &[Server]) -> Result<HealthMetrics> {
        Ok(self.draw())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub max_error_rate: f64,
    pub max_latency_p95_ms: f64,
}

impl HealthThresholds {
    pub fn is_healthy(&self, metrics: &HealthMetrics) -> bool {
        metrics.is_healthy
            && metrics.error_rate < self.max_error_rate
            && metrics.latency_p95 < self.max_latency_p95_ms
    }
}

/// Versions a server carried before this rollout first touched it.
struct PriorVersion {
    current: String,
    desired: String,
}

/// Per-rollout context shared by the stage steps.
struct Rollout<'a> {
    id: String,
    config: &'a Config,
    fleet: &'a Fleet,
    progress: &'a UnboundedSender<DeploymentStatus>,
    start_time: DateTime<Utc>,
    total_stages: usize,
}

impl Rollout<'_> {
    fn emit(
        &self,
        stage: usize,
        affected: usize,
        healthy: usize,
        status: DeploymentState,
    ) -> DeploymentStatus {
        let snapshot = DeploymentStatus {
            id: self.id.clone(),
            config_version: self.config.version.clone(),
            stage,
            total_stages: self.total_stages,
            affected_servers: affected,
            healthy_servers: healthy,
            unhealthy_servers: affected.saturating_sub(healthy),
            status,
            start_time: self.start_time,
            end_time: status.is_terminal().then(Utc::now),
        };
        // A dropped receiver only means nobody is watching.
        let _ = self.progress.send(snapshot.clone());
        snapshot
    }

    async fn targets(&self, count: usize) -> Vec<Server> {
        let mut servers = Vec::with_capacity(count);
        for slot in &self.fleet.slots()[..count] {
            servers.push(slot.read().await);
        }
        servers
    }
}

struct DeploymentGuard<'a>(&'a AtomicBool);

impl Drop for DeploymentGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CanaryController {
    stages: Vec<CanaryStage>,
    propagation_delay: Duration,
    rollback_delay: Duration,
    thresholds: HealthThresholds,
    probe: Arc<dyn HealthProbe>,
    deploying: AtomicBool,
}

impl CanaryController {
    /// Fails when the stage table or thresholds do not pass
    /// `CanaryConfig::validate`.
    pub fn new(config: &CanaryConfig, probe: Arc<dyn HealthProbe>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            stages: config.stages.clone(),
            propagation_delay: Duration::from_millis(config.propagation_delay_ms),
            rollback_delay: Duration::from_millis(config.rollback_delay_ms),
            thresholds: HealthThresholds {
                max_error_rate: config.max_error_rate,
                max_latency_p95_ms: config.max_latency_p95_ms,
            },
            probe,
            deploying: AtomicBool::new(false),
        })
    }

    pub fn stages(&self) -> &[CanaryStage] {
        &self.stages
    }

    pub fn is_deploying(&self) -> bool {
        self.deploying.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<DeploymentGuard<'_>, DeployError> {
        self.deploying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DeployError::AlreadyInProgress)?;
        Ok(DeploymentGuard(&self.deploying))
    }

    /// Roll `config` out across `fleet`, streaming snapshots to `progress`.
    ///
    /// Returns the terminal `completed` snapshot, or `RolledBack` after the
    /// failing stage's servers have been restored.
    pub async fn deploy(
        &self,
        config: &Config,
        fleet: &Fleet,
        progress: &UnboundedSender<DeploymentStatus>,
    ) -> Result<DeploymentStatus, DeployError> {
        let _guard = match self.begin() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("deployment already in progress, rejecting new deployment request");
                return Err(e);
            }
        };

        let start_time = Utc::now();
        let rollout = Rollout {
            id: format!("deploy-{}", start_time.timestamp_millis()),
            config,
            fleet,
            progress,
            start_time,
            total_stages: self.stages.len(),
        };
        let mut prior = HashMap::new();

        info!(
            deployment_id = %rollout.id,
            version = %config.version,
            servers = fleet.len(),
            "starting canary deployment"
        );
        rollout.emit(0, 0, 0, DeploymentState::Pending);

        for (index, stage) in self.stages.iter().enumerate() {
            let stage_no = index + 1;
            let target_count = stage.target_count(fleet.len());

            info!(
                deployment_id = %rollout.id,
                stage = stage_no,
                percentage = stage.percentage,
                targets = target_count,
                "deploying stage"
            );

            self.apply(&rollout, target_count, &mut prior).await;
            let healthy = count_healthy(&rollout.targets(target_count).await);
            rollout.emit(stage_no, target_count, healthy, DeploymentState::InProgress);

            if stage.duration_secs == 0 {
                continue;
            }

            if !self.monitor(&rollout, stage, stage_no, target_count).await {
                warn!(
                    deployment_id = %rollout.id,
                    stage = stage_no,
                    "health check failed - rolling back"
                );
                self.rollback(&rollout, target_count, &prior).await;
                rollout.emit(stage_no, target_count, 0, DeploymentState::RolledBack);

                return Err(DeployError::RolledBack {
                    deployment_id: rollout.id,
                    stage: stage_no,
                    percentage: stage.percentage,
                });
            }
        }

        let healthy = count_healthy(&fleet.snapshot().await);
        let completed = rollout.emit(
            self.stages.len(),
            fleet.len(),
            healthy,
            DeploymentState::Completed,
        );

        info!(deployment_id = %rollout.id, "canary deployment completed successfully");
        Ok(completed)
    }

    async fn apply(
        &self,
        rollout: &Rollout<'_>,
        target_count: usize,
        prior: &mut HashMap<usize, PriorVersion>,
    ) {
        let version = &rollout.config.version;

        for (index, slot) in rollout.fleet.slots()[..target_count].iter().enumerate() {
            let lease = slot.lease().await;
            let server = lease.server().await;

            if server.current_config_version == *version && server.status == ServerStatus::Healthy {
                debug!(server_id = %server.id, "already converged, skipping");
                continue;
            }

            prior.entry(index).or_insert_with(|| PriorVersion {
                current: server.current_config_version.clone(),
                desired: server.desired_config_version.clone(),
            });

            lease
                .update(|s| {
                    s.status = ServerStatus::Deploying;
                    s.desired_config_version = version.clone();
                })
                .await;

            sleep(self.propagation_delay).await;

            lease
                .update(|s| {
                    s.current_config_version = version.clone();
                    s.status = ServerStatus::Healthy;
                    s.last_sync = Utc::now();
                })
                .await;
        }
    }

    /// Sample health until the stage duration elapses. False on the first
    /// unhealthy sample.
    async fn monitor(
        &self,
        rollout: &Rollout<'_>,
        stage: &CanaryStage,
        stage_no: usize,
        target_count: usize,
    ) -> bool {
        let started = Instant::now();
        let mut checks = 0u32;

        while started.elapsed() < stage.duration() {
            sleep(stage.health_check_interval()).await;

            let targets = rollout.targets(target_count).await;
            checks += 1;

            let sample_ok = match self.probe.sample(&targets).await {
                Ok(metrics) => {
                    let ok = self.thresholds.is_healthy(&metrics);
                    if checks % 2 == 0 || !ok {
                        info!(
                            deployment_id = %rollout.id,
                            check = checks,
                            healthy = ok,
                            error_rate = format_args!("{:.2}", metrics.error_rate),
                            latency_p95_ms = format_args!("{:.0}", metrics.latency_p95),
                            "health check"
                        );
                    }
                    ok
                }
                Err(e) => {
                    warn!(
                        deployment_id = %rollout.id,
                        error = %e,
                        "health probe failed, treating sample as unhealthy"
                    );
                    false
                }
            };

            rollout.emit(
                stage_no,
                target_count,
                count_healthy(&targets),
                DeploymentState::InProgress,
            );

            if !sample_ok {
                return false;
            }
        }

        true
    }

    async fn rollback(
        &self,
        rollout: &Rollout<'_>,
        target_count: usize,
        prior: &HashMap<usize, PriorVersion>,
    ) {
        info!(deployment_id = %rollout.id, targets = target_count, "executing rollback");

        for (index, slot) in rollout.fleet.slots()[..target_count].iter().enumerate() {
            let lease = slot.lease().await;
            sleep(self.rollback_delay).await;

            let restore = prior.get(&index);
            lease
                .update(|s| {
                    if let Some(p) = restore {
                        s.current_config_version = p.current.clone();
                        s.desired_config_version = p.desired.clone();
                    }
                    s.status = ServerStatus::Healthy;
                    s.last_sync = Utc::now();
                })
                .await;
        }

        info!(deployment_id = %rollout.id, "rollback completed");
    }
}

fn count_healthy(servers: &[Server]) -> usize {
    servers
        .iter()
        .filter(|s| s.status == ServerStatus::Healthy)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Environment;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    /// Healthy samples, except when the stage targets exactly `fail_at` servers.
    struct ScriptedProbe {
        fail_at: Option<usize>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                fail_at: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing_at(targets: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_at: Some(targets),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn sample(&self, targets: &[Server]) -> Result<HealthMetrics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.fail_at == Some(targets.len());
            Ok(HealthMetrics {
                error_rate: if failing { 5.0 } else { 0.1 },
                latency_p95: 60.0,
                cpu_usage: 45.0,
                memory_usage: 55.0,
                is_healthy: true,
            })
        }
    }

    struct BrokenProbe;

    #[async_trait]
    impl HealthProbe for BrokenProbe {
        async fn sample(&self, _targets: &[Server]) -> Result<HealthMetrics> {
            anyhow::bail!("metrics backend unreachable")
        }
    }

    fn fleet(size: usize) -> Fleet {
        Fleet::generate(size, Environment::Prod, "v1.0.0", "example.com")
    }

    fn candidate() -> Config {
        let mut config = Config::new(
            "nginx",
            Environment::Prod,
            json!({"worker_processes": 8}),
            "test",
        );
        config.version = "v2.0.0".to_string();
        config
    }

    fn default_controller(probe: Arc<dyn HealthProbe>) -> CanaryController {
        CanaryController::new(&CanaryConfig::default(), probe).unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<DeploymentStatus>) -> Vec<DeploymentStatus> {
        let mut out = Vec::new();
        while let Ok(status) = rx.try_recv() {
            out.push(status);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_rollout_completes_across_all_stages() {
        let controller = default_controller(ScriptedProbe::healthy());
        let fleet = fleet(100);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let done = controller.deploy(&candidate(), &fleet, &tx).await.unwrap();
        assert_eq!(done.status, DeploymentState::Completed);
        assert_eq!(done.stage, 4);
        assert_eq!(done.total_stages, 4);
        assert_eq!(done.healthy_servers, 100);
        assert_eq!(done.unhealthy_servers, 0);
        assert!(done.end_time.is_some());

        let servers = fleet.snapshot().await;
        assert!(servers.iter().all(|s| s.current_config_version == "v2.0.0"));
        assert!(servers.iter().all(|s| s.status == ServerStatus::Healthy));
        assert!(!controller.is_deploying());

        let snapshots = drain(&mut rx);
        assert!(snapshots.windows(2).all(|w| w[0].stage <= w[1].stage));
        assert!(snapshots.iter().all(|s| s.id == done.id));
        assert!(snapshots.iter().all(|s| s.start_time == done.start_time));
        assert_eq!(snapshots.first().unwrap().status, DeploymentState::Pending);
        assert_eq!(snapshots.last().unwrap(), &done);
        let terminal = snapshots.iter().filter(|s| s.status.is_terminal()).count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_sample_in_ten_percent_stage_rolls_back_that_subset() {
        let controller = default_controller(ScriptedProbe::failing_at(10));
        let fleet = fleet(100);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = controller.deploy(&candidate(), &fleet, &tx).await.unwrap_err();
        match &err {
            DeployError::RolledBack {
                stage, percentage, ..
            } => {
                assert_eq!(*stage, 2);
                assert_eq!(*percentage, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("automatic rollback completed"));

        let servers = fleet.snapshot().await;
        assert!(servers.iter().all(|s| s.status == ServerStatus::Healthy));
        assert!(servers.iter().all(|s| s.current_config_version == "v1.0.0"));
        assert!(servers.iter().all(|s| s.desired_config_version == "v1.0.0"));

        let snapshots = drain(&mut rx);
        let last = snapshots.last().unwrap();
        assert_eq!(last.status, DeploymentState::RolledBack);
        assert_eq!(last.affected_servers, 10);
        assert_eq!(last.unhealthy_servers, 10);
        assert!(snapshots.iter().all(|s| s.stage <= 2));
        assert!(!snapshots
            .iter()
            .any(|s| s.status == DeploymentState::Completed));
        assert!(!controller.is_deploying());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_leaves_untargeted_servers_alone() {
        let controller = default_controller(ScriptedProbe::failing_at(10));
        let fleet = fleet(100);
        let untouched_before = fleet.slot(50).unwrap().read().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        controller.deploy(&candidate(), &fleet, &tx).await.unwrap_err();

        assert_eq!(fleet.slot(50).unwrap().read().await, untouched_before);
        assert_eq!(
            fleet.slot(9).unwrap().read().await.current_config_version,
            "v1.0.0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_deployment_is_rejected_while_first_runs() {
        let controller = Arc::new(default_controller(ScriptedProbe::healthy()));
        let fleet = fleet(20);
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = {
            let controller = controller.clone();
            let fleet = fleet.clone();
            let tx = tx.clone();
            tokio::spawn(async move { controller.deploy(&candidate(), &fleet, &tx).await })
        };

        while !controller.is_deploying() {
            tokio::task::yield_now().await;
        }

        let second = controller.deploy(&candidate(), &fleet, &tx).await;
        assert!(matches!(second, Err(DeployError::AlreadyInProgress)));

        let done = first.await.unwrap().unwrap();
        assert_eq!(done.status, DeploymentState::Completed);
        assert!(!controller.is_deploying());
    }

    #[tokio::test(start_paused = true)]
    async fn flag_is_released_after_rollback() {
        let controller = default_controller(ScriptedProbe::failing_at(1));
        let fleet = fleet(100);
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = controller.deploy(&candidate(), &fleet, &tx).await;
        assert!(matches!(first, Err(DeployError::RolledBack { stage: 1, .. })));

        // The guard is gone, so the next attempt runs (and fails the same way).
        let second = controller.deploy(&candidate(), &fleet, &tx).await;
        assert!(matches!(second, Err(DeployError::RolledBack { stage: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_count_as_unhealthy() {
        let controller = default_controller(Arc::new(BrokenProbe));
        let fleet = fleet(10);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = controller.deploy(&candidate(), &fleet, &tx).await;
        assert!(matches!(result, Err(DeployError::RolledBack { stage: 1, .. })));
        assert_eq!(
            fleet.slot(0).unwrap().read().await.current_config_version,
            "v1.0.0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_stage_skips_health_gating() {
        let config = CanaryConfig {
            stages: vec![CanaryStage::new(100, 0, 0)],
            ..CanaryConfig::default()
        };
        let probe = ScriptedProbe::failing_at(5);
        let controller = CanaryController::new(&config, probe.clone()).unwrap();
        let fleet = fleet(5);
        let (tx, _rx) = mpsc::unbounded_channel();

        let done = controller.deploy(&candidate(), &fleet, &tx).await.unwrap();
        assert_eq!(done.status, DeploymentState::Completed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_samples_at_configured_interval() {
        let config = CanaryConfig {
            stages: vec![CanaryStage::new(50, 30, 5), CanaryStage::new(100, 0, 0)],
            ..CanaryConfig::default()
        };
        let probe = ScriptedProbe::healthy();
        let controller = CanaryController::new(&config, probe.clone()).unwrap();
        let fleet = fleet(4);
        let (tx, _rx) = mpsc::unbounded_channel();

        controller.deploy(&candidate(), &fleet, &tx).await.unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_restores_each_servers_own_prior_version() {
        let mut servers = fleet(100).snapshot().await;
        servers[0].current_config_version = "v0.9.0".to_string();
        servers[3].current_config_version = "manual-change".to_string();
        let fleet = Fleet::new(servers);

        let controller = default_controller(ScriptedProbe::failing_at(10));
        let (tx, _rx) = mpsc::unbounded_channel();
        controller.deploy(&candidate(), &fleet, &tx).await.unwrap_err();

        let after = fleet.snapshot().await;
        assert_eq!(after[0].current_config_version, "v0.9.0");
        assert_eq!(after[3].current_config_version, "manual-change");
        assert_eq!(after[5].current_config_version, "v1.0.0");
    }

    #[test]
    fn constructor_rejects_unrunnable_stage_tables() {
        let oversized = CanaryConfig {
            stages: vec![CanaryStage::new(150, 0, 0)],
            ..CanaryConfig::default()
        };
        assert!(CanaryController::new(&oversized, ScriptedProbe::healthy()).is_err());

        let nan_rate = CanaryConfig {
            simulated_failure_rate: f64::NAN,
            ..CanaryConfig::default()
        };
        assert!(CanaryController::new(&nan_rate, ScriptedProbe::healthy()).is_err());
    }

    #[test]
    fn nan_failure_rate_never_injects_failures() {
        let probe = SimulatedHealthProbe::new(f64::NAN);
        for _ in 0..20 {
            assert!(probe.draw().is_healthy);
        }
    }

    #[test]
    fn thresholds_are_inclusive_failures() {
        let thresholds = HealthThresholds {
            max_error_rate: 2.0,
            max_latency_p95_ms: 100.0,
        };
        let mut metrics = HealthMetrics {
            error_rate: 1.99,
            latency_p95: 99.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            is_healthy: true,
        };
        assert!(thresholds.is_healthy(&metrics));
        metrics.error_rate = 2.0;
        assert!(!thresholds.is_healthy(&metrics));
        metrics.error_rate = 0.5;
        metrics.latency_p95 = 100.0;
        assert!(!thresholds.is_healthy(&metrics));
        metrics.latency_p95 = 50.0;
        metrics.is_healthy = false;
        assert!(!thresholds.is_healthy(&metrics));
    }

    #[test]
    fn simulated_probe_without_failures_stays_healthy() {
        let probe = SimulatedHealthProbe::new(0.0);
        let thresholds = HealthThresholds {
            max_error_rate: 2.0,
            max_latency_p95_ms: 100.0,
        };
        for _ in 0..100 {
            assert!(thresholds.is_healthy(&probe.draw()));
        }
    }
}
