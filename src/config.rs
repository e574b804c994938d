use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::domain::types::{CanaryStage, Environment};

const ENV_PREFIX: &str = "CONVERGE_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Engine configuration. Fixed for the lifetime of a service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub fleet: FleetConfig,
    pub canary: CanaryConfig,
    pub drift: DriftConfig,
    pub gitops: GitOpsConfig,
    pub validation: ValidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            fleet: FleetConfig::default(),
            canary: CanaryConfig::default(),
            drift: DriftConfig::default(),
            gitops: GitOpsConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub size: usize,
    pub environment: Environment,
    pub initial_version: String,
    pub domain: String,
    /// How often the server list is re-published to watchers.
    pub publish_interval_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            size: 100,
            environment: Environment::Prod,
            initial_version: "v1.0.0".to_string(),
            domain: "example.com".to_string(),
            publish_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    pub stages: Vec<CanaryStage>,
    /// Simulated per-server config propagation latency.
    pub propagation_delay_ms: u64,
    /// Simulated per-server rollback latency.
    pub rollback_delay_ms: u64,
    /// Error rate (percent) at or above which a sample is unhealthy.
    pub max_error_rate: f64,
    /// p95 latency (ms) at or above which a sample is unhealthy.
    pub max_latency_p95_ms: f64,
    /// Probability that the simulated health probe injects a failure.
    pub simulated_failure_rate: f64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                CanaryStage::new(1, 30, 5),
                CanaryStage::new(10, 60, 10),
                CanaryStage::new(50, 60, 10),
                CanaryStage::new(100, 0, 0),
            ],
            propagation_delay_ms: 100,
            rollback_delay_ms: 50,
            max_error_rate: 2.0,
            max_latency_p95_ms: 100.0,
            simulated_failure_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub interval_secs: u64,
    pub remediation_delay_ms: u64,
    /// Probability that the simulated actual-config source reports drift.
    pub simulated_drift_rate: f64,
    /// Auto-remediate drift whose worst severity is major.
    pub remediate_major: bool,
    /// Auto-remediate drift whose worst severity is minor.
    pub remediate_minor: bool,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            remediation_delay_ms: 200,
            simulated_drift_rate: 0.05,
            remediate_major: true,
            remediate_minor: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitOpsConfig {
    pub interval_secs: u64,
    /// Probability that a poll of the simulated source yields a new commit.
    pub change_probability: f64,
    pub service: String,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            change_probability: 0.1,
            service: "nginx".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub host_memory_bytes: u64,
    /// Fraction of host memory a memory_limit may claim.
    pub memory_headroom: f64,
    pub max_connections: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            host_memory_bytes: 16 * 1024 * 1024 * 1024,
            memory_headroom: 0.9,
            max_connections: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("converge").join("config.yaml"))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.canary.validate()?;
        self.drift.validate()?;
        self.gitops.validate()?;
        self.validation.validate()?;
        Ok(())
    }
}

impl CanaryConfig {
    /// Reject stage tables the canary controller cannot run, and health
    /// thresholds or failure rates no sample can be compared against.
    pub fn validate(&self) -> Result<()> {
        let stages = &self.stages;
        if stages.is_empty() {
            bail!("canary.stages must not be empty");
        }

        let mut previous = 0;
        for (i, stage) in stages.iter().enumerate() {
            if stage.percentage == 0 || stage.percentage > 100 {
                bail!(
                    "canary.stages[{}]: percentage {} outside 1..=100",
                    i,
                    stage.percentage
                );
            }
            if stage.percentage <= previous {
                bail!(
                    "canary.stages[{}]: percentage {} must be greater than {}",
                    i,
                    stage.percentage,
                    previous
                );
            }
            if stage.duration_secs > 0 && stage.health_check_interval_secs == 0 {
                bail!(
                    "canary.stages[{}]: nonzero duration needs a health_check_interval_secs",
                    i
                );
            }
            previous = stage.percentage;
        }

        if previous != 100 {
            bail!("canary.stages must end at 100%, last stage is {}%", previous);
        }

        ensure_finite("canary.max_error_rate", self.max_error_rate)?;
        ensure_finite("canary.max_latency_p95_ms", self.max_latency_p95_ms)?;
        ensure_probability("canary.simulated_failure_rate", self.simulated_failure_rate)
    }
}

impl DriftConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_probability("drift.simulated_drift_rate", self.simulated_drift_rate)
    }
}

impl GitOpsConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_probability("gitops.change_probability", self.change_probability)
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_finite("validation.memory_headroom", self.memory_headroom)?;
        if self.memory_headroom <= 0.0 {
            bail!(
                "validation.memory_headroom must be positive, got {}",
                self.memory_headroom
            );
        }
        Ok(())
    }
}

fn ensure_finite(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        bail!("{} must be a finite number, got {}", name, value);
    }
    Ok(())
}

fn ensure_probability(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be within 0..=1, got {}", name, value);
    }
    Ok(())
}

/// Clamp into 0..=1; NaN counts as "never".
pub fn probability(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Load config: defaults, then the YAML file (if present), then
/// `CONVERGE_*` environment variables (nested keys split on `__`).
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => EngineConfig::default_path()?,
    };

    let config: EngineConfig = Figment::from(Serialized::defaults(EngineConfig::default()))
        .merge(Yaml::file(&path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .with_context(|| format!("loading config from {}", path.display()))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.canary.stages.len(), 4);
        assert_eq!(config.drift.interval_secs, 300);
        assert_eq!(config.gitops.interval_secs, 30);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(Some(&dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config.fleet.size, 100);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_format: pretty\nfleet:\n  size: 20\ncanary:\n  stages:\n    - {{percentage: 25, duration_secs: 10, health_check_interval_secs: 2}}\n    - {{percentage: 100, duration_secs: 0, health_check_interval_secs: 0}}\n"
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.fleet.size, 20);
        assert_eq!(config.fleet.initial_version, "v1.0.0");
        assert_eq!(config.canary.stages.len(), 2);
        assert_eq!(config.canary.stages[0].percentage, 25);
        assert_eq!(config.canary.propagation_delay_ms, 100);
    }

    #[test]
    fn rejects_bad_stage_tables() {
        let mut config = EngineConfig::default();
        config.canary.stages = vec![CanaryStage::new(10, 0, 0), CanaryStage::new(5, 0, 0)];
        assert!(config.validate().is_err());

        config.canary.stages = vec![CanaryStage::new(50, 0, 0)];
        assert!(config.validate().is_err());

        config.canary.stages = vec![CanaryStage::new(100, 10, 0)];
        assert!(config.validate().is_err());

        config.canary.stages = vec![];
        assert!(config.validate().is_err());

        config.canary.stages = vec![CanaryStage::new(150, 0, 0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_rates_outside_unit_interval() {
        let mut config = EngineConfig::default();
        config.canary.simulated_failure_rate = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.gitops.change_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.drift.simulated_drift_rate = -0.1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.canary.max_latency_p95_ms = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.validation.memory_headroom = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn nan_rate_in_yaml_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "canary:\n  simulated_failure_rate: .nan\n").unwrap();

        let err = load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("simulated_failure_rate"));
    }

    #[test]
    fn probability_clamps_and_zeroes_nan() {
        assert_eq!(probability(f64::NAN), 0.0);
        assert_eq!(probability(2.0), 1.0);
        assert_eq!(probability(-1.0), 0.0);
        assert_eq!(probability(0.25), 0.25);
    }
}
