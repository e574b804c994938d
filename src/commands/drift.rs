//! `converge drift` runs a single detection pass over a simulated fleet.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use converge::config::{self, EngineConfig, LogFormat};
use converge::domain::service::ConfigManagementService;
use converge::domain::types::{DriftResult, DriftSeverity};

use super::init_tracing;

pub fn run(simulate: bool, format: &str, config_path: Option<&Path>) -> Result<()> {
    let engine = config::load(config_path)?;
    init_tracing("warn", LogFormat::Pretty);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(simulate, format, engine))
}

async fn run_async(simulate: bool, format: &str, engine: EngineConfig) -> Result<()> {
    let service = ConfigManagementService::new(engine)?;
    let mut events = service.take_events().await?;

    let edited = if simulate {
        service.simulate_drift().await
    } else {
        None
    };
    let summary = service.run_drift_cycle().await;

    let mut results: Vec<DriftResult> = Vec::new();
    while let Ok(result) = events.drift.try_recv() {
        results.push(result);
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    println!("{}", "converge drift".bold());
    if let Some(id) = edited {
        println!("  {} hand-edited {}", ">>".blue().bold(), id);
    }
    for result in &results {
        println!(
            "  {} {} ({} differences, {})",
            "~~".yellow().bold(),
            result.server_id,
            result.differences.len(),
            if result.auto_remediate {
                "auto-remediate".green()
            } else {
                "needs review".red()
            }
        );
        for diff in &result.differences {
            let severity = match diff.severity {
                DriftSeverity::Critical => "critical".red(),
                DriftSeverity::Major => "major".yellow(),
                DriftSeverity::Minor => "minor".normal(),
            };
            println!(
                "      {:<8} {}: {} -> {}",
                severity,
                diff.path,
                render(diff.desired.as_ref()),
                render(diff.actual.as_ref())
            );
        }
    }
    println!(
        "  {} scanned {}, drifted {}, remediated {}, failed {}",
        "ok".green().bold(),
        summary.scanned,
        summary.drifted,
        summary.remediated,
        summary.failed
    );
    Ok(())
}

fn render(value: Option<&serde_json::Value>) -> String {
    value.map_or_else(|| "<absent>".to_string(), |v| v.to_string())
}
