// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use svc_supervisor::config::{DEFAULT_CONFIG_DIR, load_configs};
use svc_supervisor::{CommandInstance, Registry, Service};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "svc-supervisord", version, about = "Supervise service processes")]
struct Args {
    /// Directory holding one YAML file per service.
    #[arg(long, env = "SVC_SUPERVISOR_CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Log filter, e.g. `info` or `svc_supervisor=debug`. Overridden by RUST_LOG.
    #[arg(long, env = "SVC_SUPERVISOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .init();
    Ok(())
}

/// Register every service found in `config_dir`. Returns the names of the
/// services to start right away.
fn build_registry(registry: &Registry, config_dir: &Path) -> Vec<String> {
    if !config_dir.is_dir() {
        warn!(dir = %config_dir.display(), "config directory does not exist");
        return Vec::new();
    }
    let configs = match load_configs(config_dir) {
        Ok(configs) => configs,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load service configs");
            return Vec::new();
        }
    };
    info!(count = configs.len(), "loaded service configs");

    let mut auto_start = Vec::new();
    for (name, config) in configs {
        let wants_start = config.auto_start;
        let instance = Arc::new(CommandInstance::new(&name, config));
        match registry.register(Service::new(&name, instance)) {
            Ok(_) if wants_start => auto_start.push(name),
            Ok(_) => info!(service = %name, "auto_start disabled, not starting"),
            Err(e) => warn!(error = %e, "skipping service"),
        }
    }
    auto_start
}

async fn start_services(registry: &Registry, names: &[String]) {
    for name in names {
        let Some(service) = registry.lookup(name) else {
            continue;
        };
        if let Err(e) = service.start().await {
            error!(
                service = %name,
                error = %format!("{:#}", anyhow::Error::from(e)),
                "failed to start service"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %args.config_dir.display(),
        "svc-supervisord starting"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let registry = Registry::new();
    let auto_start = build_registry(&registry, &args.config_dir);
    start_services(&registry, &auto_start).await;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("svc-supervisord shutting down");
    registry.stop_all().await;
    info!("all services stopped");
    Ok(())
}
