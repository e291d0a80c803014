//! # isonet CLI
//!
//! Hosts one isolate: HTTP signal receiver, directory updater and
//! multicast discovery.

mod commands;

use clap::{Parser, Subcommand};
use isonet_types::DeliveryMode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "isonet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when missing)
    #[arg(long, env = "ISONET_CONFIG", default_value = "isonet.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Settings overriding the configuration file
#[derive(clap::Args, Debug, Default)]
pub struct Overrides {
    /// Isolate uid
    #[arg(long, env = "ISONET_UID")]
    pub uid: Option<String>,

    /// Isolate name
    #[arg(long, env = "ISONET_NAME")]
    pub name: Option<String>,

    /// Node uid
    #[arg(long, env = "ISONET_NODE")]
    pub node: Option<String>,

    /// Group tags (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub groups: Vec<String>,

    /// Listen address of the signal receiver
    #[arg(long, env = "ISONET_LISTEN")]
    pub listen: Option<String>,

    /// Isolate to grab the directory from, as host:port
    #[arg(long, env = "ISONET_DUMP_SOURCE")]
    pub dump_source: Option<String>,

    /// Disable multicast discovery
    #[arg(long)]
    pub no_discovery: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an isolate until interrupted
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Send one signal to a receiver and print the results
    Send {
        /// Receiver address, as host:port
        target: String,

        /// Signal subject, e.g. /demo/hello
        subject: String,

        /// JSON content
        #[arg(long, default_value = "null")]
        content: String,

        /// Delivery mode: send, forget or ack
        #[arg(long, default_value_t = DeliveryMode::Send)]
        mode: DeliveryMode,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the effective configuration
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { overrides } => commands::run_isolate(&cli.config, &overrides).await,
        Commands::Send {
            target,
            subject,
            content,
            mode,
            overrides,
        } => commands::send_signal(&cli.config, &overrides, &target, &subject, &content, mode).await,
        Commands::Config { overrides } => commands::show_config(&cli.config, &overrides),
    }
}
