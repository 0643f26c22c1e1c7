// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! OTA updater - Entry point for the `ota-updater` binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use ota_updater::config::DEFAULT_CONFIG_PATH;
use ota_updater::{
    Cancellation, HttpDownloader, ManifestSource, Severity, UpdateError, UpdateOrchestrator,
    load_config,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "ota-updater", version, about = "Over-the-air artifact updater")]
struct Cli {
    /// Engine config file, created with defaults if missing
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Manifest URL or path, overrides `manifest_url` from the config
    #[arg(long, global = true)]
    manifest: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check whether a newer release is available
    Check,
    /// Check, download and apply a newer release
    Update,
    /// Restore a previous release from backups
    Rollback {
        /// Release to restore, defaults to the one before the last update
        #[arg(long)]
        to: Option<String>,
    },
    /// Print the persisted update state
    Status,
    /// Check periodically until interrupted, applying updates if `auto_update` is set
    Daemon,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    }
}

/// 1 when the previous release is still live, 2 when an operator is needed
fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<UpdateError>().map(UpdateError::severity) {
        Some(Severity::Unrecoverable) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ota_updater=debug".parse()?),
        )
        .init();

    let config = load_config(&cli.config)?;
    info!(
        "Loaded config from {}: auto_update={}, install_dir={}",
        cli.config.display(),
        config.auto_update,
        config.install_dir.display()
    );

    let source = cli
        .manifest
        .as_deref()
        .or(config.manifest_url.as_deref())
        .map(ManifestSource::parse);

    let downloader = Arc::new(HttpDownloader::new()?);
    let engine = UpdateOrchestrator::new(config, downloader)?;

    match cli.command {
        Command::Check => {
            let source = source.context("no manifest location configured")?;
            let check = engine.check_for_updates(&source).await?;
            println!(
                "current: {}\noffered: {}\navailable: {}\ncritical: {}\nmeets_min_version: {}",
                engine.get_status().current_version,
                check.manifest.version,
                check.available,
                check.critical,
                check.meets_min_version
            );
        }
        Command::Update => {
            let source = source.context("no manifest location configured")?;
            let cancel = Cancellation::new();
            spawn_shutdown_listener(cancel.clone());

            match engine.run_update(&source, &cancel).await? {
                Some(report) => println!(
                    "updated {} -> {} ({} artifact(s))",
                    report.from_version,
                    report.version,
                    report.applied.len()
                ),
                None => println!("up to date: {}", engine.get_status().current_version),
            }
        }
        Command::Rollback { to } => {
            let report = engine.rollback(to.as_deref()).await?;
            println!(
                "rolled back {} -> {}",
                report.from_version, report.restored_version
            );
            for (artifact, version) in &report.artifacts {
                println!("  {artifact}: {version}");
            }
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&engine.get_status())?);
        }
        Command::Daemon => {
            let source = source.context("no manifest location configured")?;
            run_daemon(&engine, &source).await;
        }
    }

    Ok(())
}

async fn run_daemon(engine: &UpdateOrchestrator, source: &ManifestSource) {
    info!("Starting update daemon against {source}");
    let cancel = Cancellation::new();
    spawn_shutdown_listener(cancel.clone());

    let mut check_interval =
        tokio::time::interval(Duration::from_secs(engine.config().check_interval_secs));
    let mut backup_cleanup_interval = tokio::time::interval(Duration::from_secs(3600)); // Every hour

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Shutdown signal received, stopping daemon");
                break;
            }
            _ = check_interval.tick() => {
                if let Err(e) = run_cycle(engine, source, &cancel).await {
                    match e.severity() {
                        Severity::Unrecoverable => error!("Update cycle needs operator attention: {}", e.reason()),
                        Severity::Recoverable => warn!("Update cycle error: {e}"),
                    }
                }
            }
            _ = backup_cleanup_interval.tick() => {
                if let Err(e) = engine.cleanup_backups() {
                    warn!("Backup cleanup error: {e}");
                }
            }
        }
    }
}

async fn run_cycle(
    engine: &UpdateOrchestrator,
    source: &ManifestSource,
    cancel: &Cancellation,
) -> ota_updater::Result<()> {
    if engine.config().auto_update {
        if let Some(report) = engine.run_update(source, cancel).await? {
            info!("Applied release {}", report.version);
        }
        return Ok(());
    }

    let check = engine.check_for_updates(source).await?;
    if check.available {
        info!(
            "Release {} available; auto_update is off, run `ota-updater update` to apply it",
            check.manifest.version
        );
    }
    Ok(())
}

/// Cancel `cancel` on Ctrl-C or SIGTERM
fn spawn_shutdown_listener(cancel: Cancellation) {
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
