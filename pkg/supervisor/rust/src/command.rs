// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! An [`Instance`] driven entirely by a [`ServiceConfig`].

use crate::config::{HookConfig, ProcessConfig, ReadinessConfig, ServiceConfig};
use crate::env::parse_environment_file;
use crate::error::Hook;
use crate::instance::Instance;
use crate::process::{DoneReason, ManagedProcess};
use crate::runtime::ProcessSet;
use crate::shutdown::interrupt_all;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct CommandInstance {
    name: String,
    config: ServiceConfig,
    /// Set when the readiness log line shows up. Replaced every generation.
    line_seen: Mutex<Arc<AtomicBool>>,
}

impl CommandInstance {
    pub fn new(name: impl Into<String>, config: ServiceConfig) -> Self {
        Self {
            name: name.into(),
            config,
            line_seen: Mutex::new(Arc::new(AtomicBool::new(false))),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn line_seen(&self) -> Arc<AtomicBool> {
        self.line_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn build_process(&self, pc: &ProcessConfig, line_seen: &Arc<AtomicBool>) -> Result<ManagedProcess> {
        let mut proc = ManagedProcess::new(&pc.name, &pc.command, &pc.args);
        if let Some(env) = process_env(pc)? {
            proc = proc.env(env);
        }
        if let Some(ref dir) = pc.working_dir {
            proc = proc.current_dir(dir);
        }
        if let Some(secs) = pc.timeout_secs {
            proc = proc.timeout(Duration::from_secs(secs));
        }

        proc.register_out_func("log", log_output).await;
        if let Some(pattern) = self.config.readiness.as_ref().and_then(|r| r.log_line.clone()) {
            let seen = line_seen.clone();
            proc.register_out_func("readiness", move |line: &str| {
                if line.contains(&pattern) {
                    seen.store(true, Ordering::Release);
                }
            })
            .await;
        }
        Ok(proc)
    }

    /// Run a hook command to completion. A missing hook succeeds.
    async fn run_hook(&self, hook: Hook, config: Option<&HookConfig>) -> Result<()> {
        let Some(hc) = config else {
            debug!(%hook, "no hook configured");
            return Ok(());
        };

        let mut proc = ManagedProcess::new(format!("{}-{hook}", self.name), &hc.command, &hc.args);
        if let Some(ref dir) = hc.working_dir {
            proc = proc.current_dir(dir);
        }
        if let Some(secs) = hc.timeout_secs {
            proc = proc.timeout(Duration::from_secs(secs));
        }
        proc.register_out_func("log", log_output).await;

        // Kills the hook if this future is dropped.
        let token = CancellationToken::new();
        let _guard = token.clone().drop_guard();

        info!(%hook, command = %proc.command_line(), "running hook");
        proc.start(&token)?;
        if proc.wait().await? == DoneReason::TimedOut {
            bail!("'{}' timed out", proc.command_line());
        }
        match proc.exit_status() {
            Some(status) if status.success() => Ok(()),
            Some(status) => bail!("'{}' exited with {status}", proc.command_line()),
            None => bail!("'{}' ended without an exit status", proc.command_line()),
        }
    }
}

#[async_trait]
impl Instance for CommandInstance {
    async fn prepare_process(&self, _process_token: &CancellationToken) -> Result<ProcessSet> {
        let line_seen = Arc::new(AtomicBool::new(false));
        *self.line_seen.lock().unwrap_or_else(PoisonError::into_inner) = line_seen.clone();

        let mut processes = ProcessSet::new();
        for pc in &self.config.processes {
            let proc = self
                .build_process(pc, &line_seen)
                .await
                .with_context(|| format!("preparing process '{}'", pc.name))?;
            processes.insert(proc);
        }
        Ok(processes)
    }

    async fn wait_active(&self, processes: &ProcessSet, token: &CancellationToken) -> bool {
        let Some(ref readiness) = self.config.readiness else {
            return processes.processes().all(|p| p.is_running());
        };
        let line_seen = self.line_seen();
        let deadline = Instant::now() + readiness.timeout();

        loop {
            if let Some(ended) = processes.processes().find(|p| p.is_done()) {
                warn!(process = %ended.name(), "process ended before the service became ready");
                return false;
            }
            let line_ok = readiness.log_line.is_none() || line_seen.load(Ordering::Acquire);
            if line_ok && tcp_ready(readiness).await {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(timeout = ?readiness.timeout(), "service did not become ready in time");
                return false;
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = sleep(READINESS_POLL_INTERVAL) => {}
            }
        }
    }

    async fn graceful_shutdown(&self, processes: &ProcessSet) -> Duration {
        let with_input: Vec<&ProcessConfig> = self
            .config
            .processes
            .iter()
            .filter(|pc| pc.stop_input.is_some())
            .collect();
        if with_input.is_empty() {
            interrupt_all(processes);
            return self.config.graceful_timeout();
        }

        for pc in &self.config.processes {
            let Some(proc) = processes.get(&pc.name) else {
                continue;
            };
            if !proc.is_running() {
                continue;
            }
            let Some(ref input) = pc.stop_input else {
                if let Err(e) = proc.interrupt() {
                    warn!(process = %pc.name, error = %e, "failed to interrupt process");
                }
                continue;
            };
            info!(process = %pc.name, "writing stop input");
            let grace = self.config.graceful_timeout();
            let written = match timeout(grace, proc.write(input.as_bytes())).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    warn!(process = %pc.name, error = %e, "failed to write stop input, interrupting");
                    false
                }
                Err(_) => {
                    warn!(process = %pc.name, grace = ?grace, "stop input not consumed, interrupting");
                    false
                }
            };
            if !written && let Err(e) = proc.interrupt() {
                warn!(process = %pc.name, error = %e, "failed to interrupt process");
            }
        }
        self.config.graceful_timeout()
    }

    async fn install(&self) -> Result<()> {
        self.run_hook(Hook::Install, self.config.install.as_ref()).await
    }

    async fn uninstall(&self) -> Result<()> {
        self.run_hook(Hook::Uninstall, self.config.uninstall.as_ref())
            .await
    }

    async fn update(&self) -> Result<()> {
        self.run_hook(Hook::Update, self.config.update.as_ref()).await
    }
}

fn log_output(line: &str) {
    debug!("{line}");
}

/// The environment for `pc`: inherited, then the environment file, then
/// explicit `env` entries. `None` keeps the inherited environment untouched.
fn process_env(pc: &ProcessConfig) -> Result<Option<BTreeMap<String, String>>> {
    if pc.env.is_empty() && pc.environment_file.is_none() {
        return Ok(None);
    }
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    if let Some(ref path) = pc.environment_file {
        env.extend(parse_environment_file(path)?);
    }
    env.extend(pc.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(Some(env))
}

async fn tcp_ready(readiness: &ReadinessConfig) -> bool {
    let Some(port) = readiness.tcp_port else {
        return true;
    };
    let connect = TcpStream::connect((readiness.tcp_host.as_str(), port));
    matches!(timeout(TCP_CONNECT_TIMEOUT, connect).await, Ok(Ok(_)))
}
