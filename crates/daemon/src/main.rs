//! wgwarden daemon
//!
//! Owns the peer store, runs the daily expiry job and serves the operator
//! API. One daemon per store directory and interface.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgwarden_common::{
    KeyProvider, KeyProviderKind, NativeKeyProvider, RecordStore, SyntheticKeyProvider,
};

mod api;
mod config;
mod engine;
mod events;
mod reconciler;
mod scheduler;
mod wg;

use config::DaemonConfig;
use engine::{PeerEngine, TemplateSource};
use reconciler::Reconciler;
use wg::{SystemCommandRunner, ToolkitKeyProvider, WgTool};

#[derive(Parser)]
#[command(name = "wgwardend")]
#[command(about = "wgwarden daemon - WireGuard peer lifecycle and reconciliation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value_os_t = wgwarden_common::default_config_path())]
    config: PathBuf,

    /// Store directory (overrides the config file)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Operator API listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Rewrite the store in canonical form and exit
    #[arg(long)]
    migrate: bool,

    /// Run one sweep and reconcile pass and exit
    #[arg(long)]
    once: bool,
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn key_provider(kind: KeyProviderKind, wg: &WgTool) -> Arc<dyn KeyProvider> {
    match kind {
        KeyProviderKind::Toolkit => Arc::new(ToolkitKeyProvider::new(wg.clone())),
        KeyProviderKind::Native => Arc::new(NativeKeyProvider),
        KeyProviderKind::Synthetic => {
            warn!("Using synthetic keys: rendered configs will not connect");
            Arc::new(SyntheticKeyProvider::new(wg.interface().to_string()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    info!("wgwarden daemon v{}", wgwarden_common::VERSION);

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    config.validate().context("invalid configuration")?;
    let allocator = config.allocator()?;

    if cli.migrate {
        let report = RecordStore::migrate(&config.store_path, allocator, config.store.on_corrupt)
            .with_context(|| format!("migrating store {:?}", config.store_path))?;
        println!(
            "Migrated {} active and {} archived peer(s); rewrote {}",
            report.active,
            report.archived,
            if report.files_rewritten.is_empty() {
                "nothing".to_string()
            } else {
                report.files_rewritten.join(", ")
            }
        );
        return Ok(());
    }

    let store = RecordStore::open(&config.store_path, allocator, config.store.on_corrupt)
        .with_context(|| format!("opening store {:?}", config.store_path))?;

    let wg = WgTool::new(
        Arc::new(SystemCommandRunner),
        &config.interface.wg_binary,
        &config.interface.systemctl_binary,
        &config.interface.name,
        config.interface.service_unit(),
    );
    let keys = key_provider(config.keys.provider, &wg);
    info!("Key provider: {}", keys.name());

    let reconciler = Reconciler::new(
        wg,
        config.reconcile.max_in_flight,
        config.interface.restart_service_after_changes,
    );
    let engine = Arc::new(
        PeerEngine::new(
            store,
            keys,
            reconciler,
            TemplateSource::File(config.template_path()),
        )
        .with_clients_dir(config.clients_dir()),
    );

    if cli.once {
        let report = engine.daily_tick(config.schedule.notify_window_days).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // Converge once at startup so the interface matches the store
    let report = engine.reconcile().await;
    if !report.is_clean() {
        warn!("Startup reconcile finished with {} failure(s)", report.failures.len());
    }

    let scheduler_handle = if config.schedule.enabled {
        let scheduler = scheduler::DailyScheduler::new(
            engine.clone(),
            config.daily_at()?,
            config.schedule.notify_window_days,
        );
        Some(tokio::spawn(async move { scheduler.run().await }))
    } else {
        info!("Daily job disabled");
        None
    };

    let api_handle = tokio::spawn(api::serve(config.listen.clone(), engine.clone()));

    info!("Daemon started on {}", config.listen);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!("API server error: {}", e),
                Err(e) => error!("API server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    info!("Daemon shutdown complete");
    Ok(())
}
