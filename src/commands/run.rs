use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use converge::config::{self, EngineConfig};
use converge::domain::service::{ConfigManagementService, ServiceEvents};

use super::init_tracing;

pub fn run(config_path: Option<PathBuf>, log_level: Option<String>, deploy: bool) -> Result<()> {
    let mut engine = config::load(config_path.as_deref())?;

    // CLI flags override config values
    if let Some(level) = log_level {
        engine.log_level = level;
    }

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_async(engine, deploy))
}

async fn run_async(engine: EngineConfig, deploy: bool) -> Result<()> {
    init_tracing(&engine.log_level, engine.log_format);
    info!(version = env!("CARGO_PKG_VERSION"), "converge engine starting");

    let service = ConfigManagementService::new(engine)?;
    let ServiceEvents {
        mut progress,
        mut drift,
        mut servers,
    } = service.initialize().await?;

    if deploy {
        let service = service.clone();
        tokio::spawn(async move {
            match service.trigger_deployment().await {
                Ok(result) if result.valid => {
                    info!(warnings = result.warnings.len(), "operator deployment finished")
                }
                Ok(result) => warn!(errors = result.errors.len(), "operator deployment rejected"),
                Err(e) => error!(error = %e, "operator deployment failed"),
            }
        });
    }

    loop {
        tokio::select! {
            Some(status) = progress.recv() => {
                info!(
                    deployment_id = %status.id,
                    version = %status.config_version,
                    stage = status.stage,
                    total_stages = status.total_stages,
                    affected = status.affected_servers,
                    healthy = status.healthy_servers,
                    unhealthy = status.unhealthy_servers,
                    status = %status.status,
                    "deployment progress"
                );
            }
            Some(result) = drift.recv() => {
                info!(
                    server_id = %result.server_id,
                    differences = result.differences.len(),
                    auto_remediate = result.auto_remediate,
                    "drift reported"
                );
            }
            Ok(()) = servers.changed() => {
                let summary = service.summary().await;
                debug!(
                    total = summary.total,
                    healthy = summary.healthy,
                    unhealthy = summary.unhealthy,
                    deploying = summary.deploying,
                    versions = summary.versions.len(),
                    "fleet updated"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    service.stop();
    service.join(Duration::from_secs(10)).await;
    info!("converge engine stopped");
    Ok(())
}
