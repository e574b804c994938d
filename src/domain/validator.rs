//! Config validator: a fixed pipeline of independent rule checks.
//!
//! Rules run in a fixed order (syntax, resources, security, impact) and
//! their findings are concatenated, so results are order-stable. Errors
//! block a deployment; warnings are advisory only.

use serde_json::Value;

use crate::config::ValidationConfig;

use super::types::{Config, Environment, ValidationFinding, ValidationResult};

/// Fields that must be present (and truthy) per service.
const REQUIRED_FIELDS: &[(&str, &[&str])] = &[("nginx", &["worker_processes"])];

/// Any content key containing one of these is a high-risk change.
const HIGH_RISK_FIELDS: &[&str] = &["database_url", "api_key", "auth_secret"];

trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, config: &Config) -> Vec<ValidationFinding>;
}

pub struct ConfigValidator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

impl ConfigValidator {
    pub fn new(limits: ValidationConfig) -> Self {
        Self {
            rules: vec![
                Box::new(SyntaxRule),
                Box::new(ResourceRule { limits }),
                Box::new(SecurityRule),
                Box::new(ImpactRule),
            ],
        }
    }

    /// Run every rule and merge the findings. Pure in `config`.
    pub fn validate(&self, config: &Config) -> ValidationResult {
        let findings = self
            .rules
            .iter()
            .flat_map(|rule| rule.check(config))
            .collect();
        ValidationResult::from_findings(findings)
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }
}

// ── Syntax ─────────────────────────────────────────────────

struct SyntaxRule;

impl ValidationRule for SyntaxRule {
    fn name(&self) -> &'static str {
        "syntax"
    }

    fn check(&self, config: &Config) -> Vec<ValidationFinding> {
        if !config.content.is_object() {
            return vec![ValidationFinding::error(
                self.name(),
                "Configuration content must be an object",
            )];
        }

        let required = REQUIRED_FIELDS
            .iter()
            .find(|(service, _)| *service == config.service)
            .map(|(_, fields)| *fields)
            .unwrap_or_default();

        required
            .iter()
            .filter(|field| !config.field(field).is_some_and(is_truthy))
            .map(|field| {
                ValidationFinding::error(
                    self.name(),
                    format!("{} config missing {}", config.service, field),
                )
                .on_field(field)
            })
            .collect()
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ── Resources ──────────────────────────────────────────────

struct ResourceRule {
    limits: ValidationConfig,
}

impl ValidationRule for ResourceRule {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn check(&self, config: &Config) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();

        if let Some(raw) = config.field("memory_limit").filter(|v| !v.is_null()) {
            match parse_memory(raw) {
                Some(limit) => {
                    let ceiling = self.limits.host_memory_bytes as f64 * self.limits.memory_headroom;
                    if limit as f64 > ceiling {
                        findings.push(
                            ValidationFinding::error(
                                self.name(),
                                format!(
                                    "Memory limit {} exceeds {:.0}% of host memory",
                                    display_value(raw),
                                    self.limits.memory_headroom * 100.0
                                ),
                            )
                            .on_field("memory_limit"),
                        );
                    }
                }
                None => findings.push(
                    ValidationFinding::error(
                        self.name(),
                        format!("Memory limit {} is not a valid size", display_value(raw)),
                    )
                    .on_field("memory_limit"),
                ),
            }
        }

        let connections = config.field("max_connections").and_then(parse_count);
        if connections.is_some_and(|n| n > self.limits.max_connections as f64) {
            findings.push(
                ValidationFinding::warning(
                    self.name(),
                    format!(
                        "Connection pool size exceeds recommended maximum of {}",
                        self.limits.max_connections
                    ),
                )
                .on_field("max_connections"),
            );
        }

        findings
    }
}

/// A number, or a string holding one.
fn parse_count(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        other => other.as_f64(),
    }
}

/// Parse "<digits>[KB|MB|GB]" (case-insensitive) or a plain byte count.
fn parse_memory(value: &Value) -> Option<u64> {
    if let Some(bytes) = value.as_u64() {
        return Some(bytes);
    }

    let s = value.as_str()?.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let num: u64 = digits.parse().ok()?;

    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };
    num.checked_mul(multiplier)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Security ───────────────────────────────────────────────

struct SecurityRule;

impl ValidationRule for SecurityRule {
    fn name(&self) -> &'static str {
        "security"
    }

    fn check(&self, config: &Config) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();

        if config.field("tls_verify") == Some(&Value::Bool(false)) {
            findings.push(
                ValidationFinding::error(self.name(), "TLS verification disabled - security risk")
                    .on_field("tls_verify"),
            );
        }

        if config.field("password").and_then(Value::as_str) == Some("") {
            findings.push(
                ValidationFinding::error(self.name(), "Empty password detected").on_field("password"),
            );
        }

        let wildcard = match config.field("allowed_hosts") {
            Some(Value::String(s)) => s == "*",
            Some(Value::Array(hosts)) => hosts.iter().any(|h| h.as_str() == Some("*")),
            _ => false,
        };
        if wildcard {
            findings.push(
                ValidationFinding::warning(self.name(), "Wildcard allowed_hosts is security risk")
                    .on_field("allowed_hosts"),
            );
        }

        findings
    }
}

// ── Impact ─────────────────────────────────────────────────

struct ImpactRule;

impl ValidationRule for ImpactRule {
    fn name(&self) -> &'static str {
        "impact"
    }

    fn check(&self, config: &Config) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();

        if config.environment == Environment::Prod {
            findings.push(ValidationFinding::warning(
                self.name(),
                "Change affects production environment - requires senior approval",
            ));
        }

        let high_risk = config.content.as_object().is_some_and(|content| {
            content
                .keys()
                .any(|key| HIGH_RISK_FIELDS.iter().any(|risk| key.contains(risk)))
        });
        if high_risk {
            findings.push(ValidationFinding::warning(
                self.name(),
                "Change modifies high-risk security fields",
            ));
        }

        findings
    }
}
