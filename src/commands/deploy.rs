//! `converge deploy` validates a candidate and rolls it out across a
//! freshly generated simulated fleet, printing each stage as it lands.

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;

use converge::config::{self, EngineConfig, LogFormat};
use converge::domain::service::ConfigManagementService;
use converge::domain::types::{DeploymentState, DeploymentStatus};

use super::{init_tracing, load_candidate, print_findings};

pub fn run(file: Option<&Path>, config_path: Option<&Path>) -> Result<()> {
    let engine = config::load(config_path)?;
    init_tracing("warn", LogFormat::Pretty);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(file, engine))
}

async fn run_async(file: Option<&Path>, engine: EngineConfig) -> Result<()> {
    let service = ConfigManagementService::new(engine.clone())?;
    let candidate = match file {
        Some(path) => load_candidate(path, &engine)?,
        None => service.candidate_config(),
    };

    println!("{}", "converge deploy".bold());
    println!(
        "  {} {} {} to {} servers",
        ">>".blue().bold(),
        candidate.service,
        candidate.version,
        engine.fleet.size
    );

    let preflight = service.validator().validate(&candidate);
    print_findings(&preflight);
    if !preflight.valid {
        bail!("validation failed with {} error(s)", preflight.errors.len());
    }

    let mut events = service.take_events().await?;
    let mut rollout = {
        let service = service.clone();
        tokio::spawn(async move { service.deploy_candidate(candidate).await })
    };

    let outcome = loop {
        tokio::select! {
            Some(status) = events.progress.recv() => print_progress(&status),
            joined = &mut rollout => break joined?,
        }
    };
    while let Ok(status) = events.progress.try_recv() {
        print_progress(&status);
    }

    let summary = service.summary().await;
    match outcome {
        Ok(result) if result.valid => {
            println!(
                "  {} {}/{} servers healthy",
                "ok".green().bold(),
                summary.healthy,
                summary.total
            );
            Ok(())
        }
        Ok(result) => {
            print_findings(&result);
            bail!("deployment not started");
        }
        Err(e) => {
            println!("  {} {}", "!!".red().bold(), e);
            Err(e.into())
        }
    }
}

fn print_progress(status: &DeploymentStatus) {
    let state = match status.status {
        DeploymentState::Pending => "pending".dimmed(),
        DeploymentState::InProgress => "in-progress".cyan(),
        DeploymentState::Completed => "completed".green(),
        DeploymentState::RolledBack => "rolled-back".red(),
    };
    println!(
        "  stage {}/{}  {:<12} affected {:>4}  healthy {:>4}  unhealthy {:>4}",
        status.stage,
        status.total_stages,
        state,
        status.affected_servers,
        status.healthy_servers,
        status.unhealthy_servers
    );
}
