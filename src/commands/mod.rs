pub mod deploy;
pub mod drift;
pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;

use converge::config::{EngineConfig, LogFormat};
use converge::domain::types::{Config, Environment, FindingSeverity, ValidationResult};

/// `RUST_LOG` wins over the configured level. One-shot commands log to
/// stderr so their stdout stays clean.
pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.compact().init(),
    }
}

/// On-disk candidate document. Everything but `content` is optional.
#[derive(Debug, Deserialize)]
struct CandidateFile {
    service: Option<String>,
    environment: Option<Environment>,
    version: Option<String>,
    author: Option<String>,
    content: Value,
}

/// Read a candidate config from YAML or JSON.
pub fn load_candidate(path: &Path, engine: &EngineConfig) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: CandidateFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;

    let mut config = Config::new(
        file.service.unwrap_or_else(|| engine.gitops.service.clone()),
        file.environment.unwrap_or(engine.fleet.environment),
        file.content,
        file.author.as_deref().unwrap_or("operator"),
    );
    if let Some(version) = file.version {
        config.version = version;
    }
    Ok(config)
}

pub fn print_findings(result: &ValidationResult) {
    for finding in result.errors.iter().chain(&result.warnings) {
        let marker = match finding.severity {
            FindingSeverity::Error => "!!".red().bold(),
            FindingSeverity::Warning => "~~".yellow().bold(),
        };
        match &finding.field {
            Some(field) => println!("  {} [{}] {}: {}", marker, finding.rule, field, finding.message),
            None => println!("  {} [{}] {}", marker, finding.rule, finding.message),
        }
    }
}
