//! Peer Mesh Simulator - drives in-memory meshes through predefined scenarios
//!
//! - `run` - Run one scenario and print its report as JSON
//! - `suite` - Run every scenario and summarize
//! - `list` - Show the available scenarios

mod scenarios;

use clap::{Parser, Subcommand};
use scenarios::{run_scenario, Scenario, ScenarioOptions, ScenarioReport};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "peermesh-sim")]
#[command(about = "Scenario runner for the peer mesh coordination core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args, Clone)]
struct MeshArgs {
    /// Number of peers in the mesh
    #[arg(short, long, default_value = "3")]
    peers: usize,

    /// Seed for ids, medium loss and drop rolls
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Sends per follower in traffic scenarios
    #[arg(short, long, default_value = "10")]
    messages: usize,

    /// Fraction of frames lost on the medium
    #[arg(long, default_value = "0.0")]
    loss_rate: f64,

    /// Receiver-side drop probability for unreliable frames
    #[arg(long, default_value = "0.1")]
    drop_probability: f64,

    /// Wait for peers before the first election (ms)
    #[arg(long, default_value = "2000")]
    formation_ms: u64,

    /// Wait for an OK from a higher peer (ms)
    #[arg(long, default_value = "500")]
    election_ms: u64,

    /// Wait per reliable frame before retransmitting (ms)
    #[arg(long, default_value = "1000")]
    ack_ms: u64,

    /// Upper bound on any single wait (seconds)
    #[arg(long, default_value = "60")]
    timeout: u64,
}

impl MeshArgs {
    fn options(&self) -> ScenarioOptions {
        ScenarioOptions {
            peers: self.peers,
            seed: self.seed,
            messages: self.messages,
            loss_rate: self.loss_rate,
            drop_probability: self.drop_probability,
            formation_timeout: Duration::from_millis(self.formation_ms),
            election_timeout: Duration::from_millis(self.election_ms),
            ack_timeout: Duration::from_millis(self.ack_ms),
            deadline: Duration::from_secs(self.timeout),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single scenario
    Run {
        /// Scenario to run
        #[arg(short, long, value_enum, default_value = "election")]
        scenario: Scenario,

        #[command(flatten)]
        mesh: MeshArgs,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run every scenario
    Suite {
        #[command(flatten)]
        mesh: MeshArgs,

        /// Write the JSON reports here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List available scenarios
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging, RUST_LOG wins over the default level
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            mesh,
            output,
        } => {
            let report = run_scenario(scenario, &mesh.options()).await?;
            let passed = report.passed;
            write_json(&report, output)?;
            if !passed {
                std::process::exit(1);
            }
        }

        Commands::Suite { mesh, output } => {
            let options = mesh.options();
            let mut reports: Vec<ScenarioReport> = Vec::new();
            let mut failures = 0;

            for scenario in Scenario::ALL {
                if options.peers < 3 && scenario == Scenario::Failover {
                    info!("Skipping {}: needs at least 3 peers", scenario);
                    continue;
                }
                match run_scenario(scenario, &options).await {
                    Ok(report) => {
                        if !report.passed {
                            failures += 1;
                        }
                        reports.push(report);
                    }
                    Err(e) => {
                        error!("Scenario {} aborted: {}", scenario, e);
                        failures += 1;
                    }
                }
            }

            info!(
                "Suite finished: {} passed, {} failed",
                reports.iter().filter(|r| r.passed).count(),
                failures
            );
            write_json(&reports, output)?;
            if failures > 0 {
                std::process::exit(1);
            }
        }

        Commands::List => {
            println!("Available scenarios:");
            for scenario in Scenario::ALL {
                println!("  {:<12} - {}", scenario.name(), scenario.description());
            }
        }
    }

    Ok(())
}

fn write_json<T: serde::Serialize>(
    value: &T,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
