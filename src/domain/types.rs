use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ── Config ─────────────────────────────────────────────────

/// Target environment of a config or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prod => "prod",
            Self::Staging => "staging",
            Self::Dev => "dev",
        };
        f.write_str(s)
    }
}

/// An immutable, versioned configuration payload.
///
/// `content` is kept as a raw JSON value so that malformed payloads (null,
/// scalars) still deserialize and can be rejected by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub id: String,
    pub version: String,
    pub environment: Environment,
    pub service: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    pub author: String,
}

impl Config {
    /// Build a config with a fresh timestamp-derived id and version.
    pub fn new(
        service: impl Into<String>,
        environment: Environment,
        content: Value,
        author: impl Into<String>,
    ) -> Self {
        let timestamp = Utc::now();
        let millis = timestamp.timestamp_millis();
        Self {
            id: format!("config-{millis}"),
            version: format!("v1.0.{millis}"),
            environment,
            service: service.into(),
            content,
            timestamp,
            author: author.into(),
        }
    }

    /// Look up a top-level content field. `None` when content is not a map.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.content.as_object()?.get(name)
    }

    /// SHA-256 of the serialized content: "sha256:<hex>"
    pub fn checksum(&self) -> String {
        let serialized = serde_json::to_string(&self.content).unwrap_or_default();
        let hash = Sha256::digest(serialized.as_bytes());
        format!("sha256:{:x}", hash)
    }
}

// ── Server ─────────────────────────────────────────────────

/// Server health/rollout status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Healthy,
    Unhealthy,
    Deploying,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Deploying => "deploying",
        };
        f.write_str(s)
    }
}

/// A single member of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub hostname: String,
    pub environment: Environment,
    pub status: ServerStatus,
    pub current_config_version: String,
    pub desired_config_version: String,
    pub last_sync: DateTime<Utc>,
}

// ── Canary ─────────────────────────────────────────────────

/// One step of a canary rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryStage {
    pub percentage: u32,
    pub duration_secs: u64,
    pub health_check_interval_secs: u64,
}

impl CanaryStage {
    pub const fn new(percentage: u32, duration_secs: u64, health_check_interval_secs: u64) -> Self {
        Self {
            percentage,
            duration_secs,
            health_check_interval_secs,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Number of servers targeted out of `total`: ceil(total * pct / 100),
    /// never more than `total`.
    pub fn target_count(&self, total: usize) -> usize {
        (total * self.percentage as usize).div_ceil(100).min(total)
    }
}

/// One health sample across a stage's target servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    /// Percent of failed requests.
    pub error_rate: f64,
    pub latency_p95: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// False when the probe itself flagged a failure.
    pub is_healthy: bool,
}

/// Rollout state carried by every progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentState {
    Pending,
    InProgress,
    Completed,
    RolledBack,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(s)
    }
}

/// Snapshot of rollout progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub id: String,
    pub config_version: String,
    pub stage: usize,
    pub total_stages: usize,
    pub affected_servers: usize,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub status: DeploymentState,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

// ── Drift ──────────────────────────────────────────────────

/// Drift severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Critical,
    Major,
    Minor,
}

impl fmt::Display for DriftSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Minor => "minor",
        };
        f.write_str(s)
    }
}

/// A single leaf that differs between desired and actual content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftDifference {
    pub path: String,
    pub desired: Option<Value>,
    pub actual: Option<Value>,
    pub severity: DriftSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftResult {
    pub server_id: String,
    pub detected: bool,
    pub differences: Vec<DriftDifference>,
    /// True iff no difference is critical.
    pub auto_remediate: bool,
    pub timestamp: DateTime<Utc>,
}

// ── Validation ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub rule: String,
    pub message: String,
    pub severity: FindingSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationFinding {
    pub fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
            severity: FindingSeverity::Error,
            field: None,
        }
    }

    pub fn warning(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
            severity: FindingSeverity::Warning,
            field: None,
        }
    }

    pub fn on_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationFinding>,
    pub warnings: Vec<ValidationFinding>,
}

impl ValidationResult {
    /// Split findings by severity, preserving their order.
    pub fn from_findings(findings: Vec<ValidationFinding>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|f| f.severity == FindingSeverity::Error);
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// The result returned when a deployment is already running.
    pub fn deployment_in_progress() -> Self {
        Self::from_findings(vec![ValidationFinding::error(
            "deployment",
            "A deployment is already in progress. Please wait for it to complete.",
        )])
    }
}
