//! # pve-driver
//!
//! Runs one lifecycle operation against a Proxmox VE cluster and prints the
//! result as JSON.
//!
//! ## Usage
//! ```bash
//! pve-driver --config /etc/pve-provider/driver.yaml deploy-from-template \
//!     --app-name web-01 --template-id 101
//! PVE_PASSWORD=... pve-driver --address pve.lab --user root@pam power-off 102
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pve_engine::PveEngine;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cli;
mod commands;
mod config;

use cli::Args;
use crate::config::DriverConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = DriverConfig::load(args.config.as_deref())?.with_cli_overrides(&args)?;

    // Initialize logging
    pve_common::init_logging_with_format(&config.logging.level, config.logging.format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = args.command.name(),
        address = %config.resource.address,
        "Starting pve-driver"
    );

    let engine = PveEngine::connect_with_variants(
        config.resource.clone(),
        config.policies.clone(),
        config.variants.clone(),
    )
    .await
    .context("Failed to connect to the cluster")?;

    // Ctrl-C stops the engine from waiting further; hypervisor tasks keep running.
    let cancel = CancellationToken::new();
    let engine = engine.with_cancellation(cancel.clone());
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling");
            cancel.cancel();
        }
    });

    let command = args.command.name();
    let result = commands::run(&engine, args.command).await;
    watcher.abort();

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(command, error = %e, "Command failed");
            Err(e)
        }
    }
}
