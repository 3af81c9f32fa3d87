use anyhow::Result;
use clap::{Parser, Subcommand};
use ingest_cli::run_pipeline;
use ingest_core::PipelineSpec;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Load records from files, APIs or topics into a destination table
#[derive(Parser, Debug)]
#[command(name = "ingest", author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a load and print the validation report as JSON
    Run {
        /// Pipeline YAML
        #[arg(short, long)]
        pipeline: PathBuf,
        /// Bounded channel capacity between operators
        #[arg(long, default_value_t = 8)]
        channel_capacity: usize,
    },
    /// Parse and check a pipeline file without running it
    Check {
        /// Pipeline YAML
        #[arg(short, long)]
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let args = Args::parse();

    match args.command {
        Command::Check { pipeline } => {
            let spec = PipelineSpec::load(&pipeline)?;
            info!(pipeline = %spec.name, fields = spec.schema.len(), "pipeline is valid");
            println!("{}: ok", spec.name);
        }
        Command::Run {
            pipeline,
            channel_capacity,
        } => {
            let spec = PipelineSpec::load(&pipeline)?;
            let cancel = CancellationToken::new();

            // Ctrl-C handling
            let watcher = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping source");
                    watcher.cancel();
                }
            });

            let outcome = run_pipeline(&spec, channel_capacity, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}
