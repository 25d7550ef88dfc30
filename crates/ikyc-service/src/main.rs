//! iKYC daemon
//!
//! Runs the verification pipeline: stage workers per worker group, the
//! maintenance scheduler, and graceful shutdown on Ctrl-C. `demo` pushes a
//! synthetic batch through the same pipeline and prints a summary.

use clap::{Parser, Subcommand};
use ikyc_adapters::simulated_registry;
use ikyc_core::IKycConfig;
use ikyc_service::ServiceState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// iKYC daemon CLI
#[derive(Parser)]
#[command(name = "ikycd")]
#[command(about = "iKYC identity-verification pipeline daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "IKYC_CONFIG")]
    config: Option<String>,

    /// Log level (overrides the configured level; RUST_LOG wins over both)
    #[arg(long, env = "IKYC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "IKYC_LOG_JSON")]
    json: bool,

    /// Lower bound of simulated adapter scores
    #[arg(long, default_value_t = 0.55)]
    score_floor: f64,

    /// Names the simulated sanctions list flags
    #[arg(long = "watch", value_name = "NAME")]
    watch_list: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers and maintenance loops until Ctrl-C
    Run,
    /// Process a batch of synthetic submissions and print the outcome
    Demo {
        /// Number of submissions
        #[arg(short = 'n', long, default_value_t = 25)]
        count: usize,
    },
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = IKycConfig::load(cli.config.as_deref())?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json || config.logging.json);

    let watch_list = cli.watch_list.iter().map(String::as_str).collect::<Vec<_>>();
    let adapters = simulated_registry(cli.score_floor, &watch_list);
    let state = ServiceState::bootstrap(config, adapters).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                storage = state.config().storage.label(),
                "ikycd starting"
            );
            state
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    }
                })
                .await?;
        }
        Command::Demo { count } => {
            let report = state.demo(count).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
