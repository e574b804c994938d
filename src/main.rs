mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "converge",
    version,
    about = "Canary config rollouts with GitOps reconciliation and drift repair"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: GitOps reconciliation, drift detection, live progress
    Run {
        /// Path to config file (default: ~/.config/converge/config.yaml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Trigger one operator deployment right after startup
        #[arg(long)]
        deploy: bool,
    },

    /// Validate a config file (YAML or JSON) without deploying it
    Validate {
        /// Config file to validate
        file: PathBuf,

        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,

        /// Engine config path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate and roll out a config across the simulated fleet
    Deploy {
        /// Config file to deploy (default: the built-in operator candidate)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Engine config path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run one drift detection pass over the simulated fleet
    Drift {
        /// Hand-edit a random server first
        #[arg(long)]
        simulate: bool,

        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,

        /// Engine config path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log_level,
            deploy,
        } => commands::run::run(config, log_level, deploy),
        Commands::Validate {
            file,
            format,
            config,
        } => commands::validate::run(&file, &format, config.as_deref()),
        Commands::Deploy { file, config } => {
            commands::deploy::run(file.as_deref(), config.as_deref())
        }
        Commands::Drift {
            simulate,
            format,
            config,
        } => commands::drift::run(simulate, &format, config.as_deref()),
    }
}
