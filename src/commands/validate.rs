//! `converge validate` runs the validation rules against a config file.

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;

use converge::config;
use converge::domain::validator::ConfigValidator;

use super::{load_candidate, print_findings};

pub fn run(file: &Path, format: &str, config_path: Option<&Path>) -> Result<()> {
    let engine = config::load(config_path)?;
    let candidate = load_candidate(file, &engine)?;

    let validator = ConfigValidator::new(engine.validation.clone());
    let result = validator.validate(&candidate);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("{}", "converge validate".bold());
            println!("  file:     {}", file.display());
            println!("  service:  {} ({})", candidate.service, candidate.environment);
            println!("  version:  {}", candidate.version);
            println!("  checksum: {}", candidate.checksum().dimmed());
            println!("  rules:    {}", validator.rule_names().join(", "));
            println!();
            print_findings(&result);
            if result.valid {
                println!(
                    "  {} valid ({} warnings)",
                    "ok".green().bold(),
                    result.warnings.len()
                );
            }
        }
    }

    if !result.valid {
        bail!("validation failed with {} error(s)", result.errors.len());
    }
    Ok(())
}
