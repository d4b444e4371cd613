//! Brewlake CLI - Main entry point

use brewlake_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use brewlake_etl::{Cli, Commands, PipelineConfig, RunCoordinator};
use clap::Parser;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("brewlake")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().with_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {}", e);
            None
        },
    };

    if let Err(e) = execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn execute(cli: &Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    cli.apply_overrides(&mut config)?;

    let coordinator = RunCoordinator::from_config(config).await?;

    match &cli.command {
        Commands::Run => match coordinator.run().await {
            Ok(report) => print_json(&report),
            Err(e) => {
                print_json(&e.report)?;
                Err(e.into())
            },
        },

        Commands::Extract => {
            let raw = coordinator.run_extract().await?;
            print_json(&raw)
        },

        Commands::Curate { raw_key } => {
            let (stats, manifest) = coordinator.run_curate(raw_key).await?;
            println!("Curated generation {}", manifest.generation);
            print_json(&stats)
        },

        Commands::Aggregate => {
            let (counts, manifest) = coordinator.run_aggregate().await?;
            println!("Analytical generation {}", manifest.generation);
            print_json(&counts)
        },

        Commands::Status => {
            let status = coordinator.status().await?;
            print_json(&status)
        },
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
