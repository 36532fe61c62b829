// ABOUTME: Command-line shell around the migration core
// ABOUTME: Parses flags, loads configuration, wires Ctrl-C to cancellation and prints the report

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cml_project_migrator::{Configuration, Direction, MigrationReport, Orchestrator, RunStatus};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cml-project-migrator")]
#[command(about = "Migrate a workspace project between platform instances through a bastion host", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a project's metadata and files from the workspace to the bastion host
    Export {
        /// Project name on the source workspace
        project: String,
    },
    /// Re-create a previously exported project on the workspace
    Import {
        /// Project name as exported
        project: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Configuration::load(&cli.config)?;
    let (direction, project) = match &cli.command {
        Commands::Export { project } => (Direction::Export, project.clone()),
        Commands::Import { project } => (Direction::Import, project.clone()),
    };

    if !cli.yes {
        let proceed = Confirm::new()
            .with_prompt(format!(
                "{} project '{}' on {} as {}?",
                match direction {
                    Direction::Export => "Export",
                    Direction::Import => "Import",
                },
                project,
                config.workspace_url,
                config.username
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !proceed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let orchestrator = Orchestrator::from_config(config).context("Failed to set up the migration")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling; project ownership will be restored");
            on_interrupt.cancel();
        }
    });

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
    spinner.set_message(format!("Running {} of '{}'", direction, project));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let outcome = orchestrator.run(direction, &project, cancel).await;
    spinner.finish_and_clear();

    let report = match outcome {
        Ok(report) => report,
        Err(failure) => {
            eprintln!("Error: {}", failure.error);
            failure.report
        }
    };
    print_report(&report, cli.json)?;

    match report.status {
        RunStatus::Success => Ok(()),
        RunStatus::Partial => std::process::exit(1),
        RunStatus::Failed => std::process::exit(2),
    }
}

fn print_report(report: &MigrationReport, json: bool) -> Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(report).context("Failed to serialize the report")?;
        println!("{}", rendered);
    } else {
        print!("{}", report);
    }
    Ok(())
}
