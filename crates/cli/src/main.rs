//! wgwarden CLI - Main Entry Point
//!
//! Operator commands for creating, inspecting, renewing and retiring
//! WireGuard peers. Every command goes through the daemon's API; the CLI
//! never touches the store files.

use clap::{Parser, Subcommand};

mod client;
mod commands;
mod output;

use commands::peers;

/// wgwarden CLI - WireGuard peer lifecycle
#[derive(Parser)]
#[command(name = "wgwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Daemon address
    #[arg(long, env = "WGWARDEN_ADDR", default_value = wgwarden_common::DEFAULT_LISTEN, global = true)]
    daemon_addr: String,

    /// Operator ID sent to the daemon (must be listed in admins.json)
    #[arg(long, env = "WGWARDEN_OPERATOR", global = true)]
    operator: Option<i64>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Peers(peers::PeerCommands),

    /// Check daemon status
    Status,

    /// Show version information
    Version,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = client::DaemonClient::new(&cli.daemon_addr, cli.operator)?;

    match cli.command {
        Commands::Peers(cmd) => peers::execute(cmd, &client, cli.format).await?,
        Commands::Status => {
            let health = client.health().await?;
            match cli.format {
                output::OutputFormat::Table | output::OutputFormat::Plain => {
                    output::print_success(&format!(
                        "Daemon v{} is running at {}",
                        health.version,
                        client.base()
                    ));
                    println!("  Active peers:   {}", health.active);
                    println!("  Archived peers: {}", health.archived);
                    println!("  Last address:   {}", health.cursor);
                    println!("  Key provider:   {}", health.key_provider);
                }
                format => output::print_value(&health, format)?,
            }
        }
        Commands::Version => {
            println!("wgwarden CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<client::ClientError>() {
            Some(api) if api.is_not_found() => output::print_error(&format!("Not found: {}", api)),
            Some(client::ClientError::Api { kind, message, .. }) if !kind.is_empty() => {
                output::print_error(&format!("{} [{}]", message, kind))
            }
            _ => output::print_error(&format!("{:#}", e)),
        }
        std::process::exit(1);
    }
}
