// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_DIR: &str = "/etc/svc-supervisor/services.d";

fn default_true() -> bool {
    true
}

fn default_graceful_timeout_secs() -> u64 {
    15
}

fn default_tcp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_readiness_timeout_secs() -> u64 {
    90
}

/// One supervised service: a group of processes started and stopped together.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// How long `stop` waits for processes to exit before killing them.
    #[serde(default = "default_graceful_timeout_secs")]
    pub graceful_timeout_secs: u64,
    pub processes: Vec<ProcessConfig>,
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,
    #[serde(default)]
    pub install: Option<HookConfig>,
    #[serde(default)]
    pub uninstall: Option<HookConfig>,
    #[serde(default)]
    pub update: Option<HookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub environment_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    /// Kill the process after this many seconds.
    pub timeout_secs: Option<u64>,
    /// Written to stdin to ask the process to exit, instead of SIGINT.
    pub stop_input: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    /// Active once any process prints a line containing this text.
    pub log_line: Option<String>,
    /// Active once this port accepts TCP connections.
    pub tcp_port: Option<u16>,
    #[serde(default = "default_tcp_host")]
    pub tcp_host: String,
    #[serde(default = "default_readiness_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

impl ServiceConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.processes.is_empty() {
            bail!("no processes defined");
        }
        let mut seen = HashSet::new();
        for p in &self.processes {
            if p.name.is_empty() {
                bail!("process with command '{}' has an empty name", p.command);
            }
            if !seen.insert(p.name.as_str()) {
                bail!("duplicate process name '{}'", p.name);
            }
        }
        Ok(())
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Scan a directory for `*.yaml` files and parse each into a ServiceConfig.
/// The service name is derived from the filename (without extension).
/// Files that fail to parse or validate are logged and skipped.
pub fn load_configs(dir: &Path) -> Result<Vec<(String, ServiceConfig)>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read config directory: {}", dir.display()))?;

    let mut yaml_files: Vec<PathBuf> = entries
        .filter_map(|e| match e {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|path| {
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                debug!(path = %path.display(), "skipping non-YAML file");
            }
            is_yaml
        })
        .collect();
    yaml_files.sort();

    let mut configs = Vec::new();
    for path in yaml_files {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!(path = %path.display(), "skipping file with non UTF-8 name");
            continue;
        };
        match parse_config(&path) {
            Ok(config) => configs.push((name.to_string(), config)),
            Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "skipping service"),
        }
    }

    Ok(configs)
}

pub fn parse_config(path: &Path) -> Result<ServiceConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: ServiceConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}
