use anyhow::Context;
use clap::{Parser, Subcommand};
use nightwatch::conditions::ConditionMonitor;
use nightwatch::run::Orchestrator;
use nightwatch::sim::{ClearSkies, SimObservatory};
use nightwatch::{FilterWheelMap, ObservatoryConfig, RunQueue};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nightwatch", about = "Unattended robotic observatory control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a night of observations
    Run {
        /// Observatory configuration document
        config: PathBuf,
        /// Ticket file, or a directory of ticket files
        tickets: PathBuf,
        /// Filter wheel map document
        filter_map: PathBuf,
        /// Drive simulated hardware instead of real drivers
        #[arg(long)]
        simulate: bool,
    },
    /// Validate configuration and tickets without touching hardware
    Check {
        config: PathBuf,
        tickets: PathBuf,
        filter_map: PathBuf,
    },
}

fn load_inputs(
    config: &PathBuf,
    tickets: &PathBuf,
    filter_map: &PathBuf,
) -> anyhow::Result<(ObservatoryConfig, FilterWheelMap, RunQueue)> {
    let config = ObservatoryConfig::load(config).context("loading observatory configuration")?;
    let wheel = FilterWheelMap::load(filter_map).context("loading filter wheel map")?;
    let queue = RunQueue::load(
        tickets,
        &config.data_directory,
        config.min_exposure_secs,
        &wheel,
    )
    .context("loading tickets")?;
    Ok((config, wheel, queue))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check {
            config,
            tickets,
            filter_map,
        } => {
            let (_, _, queue) = load_inputs(&config, &tickets, &filter_map)?;
            println!("configuration valid, {} ticket(s) scheduled", queue.len());
            Ok(())
        }
        Command::Run {
            config,
            tickets,
            filter_map,
            simulate,
        } => {
            let (config, wheel, queue) = load_inputs(&config, &tickets, &filter_map)?;
            if queue.is_empty() {
                anyhow::bail!("no tickets to observe");
            }

            // Real device drivers plug in through the DriverFactory seam;
            // this binary ships the simulated rig
            if !simulate {
                tracing::warn!(
                    "no hardware drivers are linked into this binary; running simulated"
                );
            }
            let factory = Arc::new(SimObservatory::new());

            let config = Arc::new(config);
            let (monitor, sky) =
                ConditionMonitor::new(&config, Box::new(ClearSkies), Some(Box::new(ClearSkies)));
            let monitor_task = monitor.spawn();

            let orchestrator = Orchestrator::new(
                config,
                Arc::new(wheel),
                queue,
                factory,
                sky,
            );
            let summary = orchestrator.execute().await?;
            monitor_task.abort();

            for ticket in &summary.tickets {
                tracing::info!(
                    "{}: {}/{} exposures",
                    ticket.name,
                    ticket.completed,
                    ticket.requested
                );
            }
            tracing::info!("night complete: {} exposures", summary.total_exposures());
            Ok(())
        }
    }
}
