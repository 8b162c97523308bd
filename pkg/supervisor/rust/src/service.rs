// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Service lifecycle.
//!
//! Every lifecycle operation takes the lifecycle lock without waiting and
//! fails with [`Error::Busy`] when another one holds it. The only activity
//! running outside the lock is the readiness watcher, which may move the
//! status from `WaitingActive` to `Active` or `Abnormal`. `stop` cancels and
//! joins the watcher before it touches the status or the processes.

use crate::error::{Error, Hook, Result};
use crate::instance::Instance;
use crate::runtime::{ProcessSet, RuntimeSnapshot};
use crate::shutdown::{wait_all_done, wait_all_exited};
use crate::status::Status;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// Upper bound on reaping killed processes once the grace period is over.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Service {
    name: String,
    instance: Arc<dyn Instance>,
    span: Span,
    lifecycle: Mutex<Option<RuntimeSnapshot>>,
    status: Arc<watch::Sender<Status>>,
    running: AtomicBool,
}

impl Service {
    pub fn new(name: impl Into<String>, instance: Arc<dyn Instance>) -> Self {
        let name = name.into();
        let span = info_span!("service", service = %name);
        let (status, _) = watch::channel(Status::Inactive);
        Self {
            name,
            instance,
            span,
            lifecycle: Mutex::new(None),
            status: Arc::new(status),
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// True iff a generation of processes is installed.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Receive every status change from now on.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Start the processes and return without waiting for readiness.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.try_lock()?;
        self.start_locked(&mut slot)
            .instrument(self.op_span("starting"))
            .await
    }

    /// Stop the processes. Succeeds even if they had to be killed.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.try_lock()?;
        self.stop_locked(&mut slot)
            .instrument(self.op_span("stopping"))
            .await;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        let mut slot = self.try_lock()?;
        async {
            self.stop_locked(&mut slot).await;
            self.start_locked(&mut slot).await
        }
        .instrument(self.op_span("restarting"))
        .await
    }

    pub async fn install(&self) -> Result<()> {
        let _slot = self.try_lock()?;
        async {
            info!("begin install");
            self.instance
                .install()
                .await
                .map_err(|source| hook_failed(Hook::Install, source))
        }
        .instrument(self.op_span("installing"))
        .await
    }

    /// Stop the service if running, then run the uninstall hook.
    pub async fn uninstall(&self) -> Result<()> {
        let mut slot = self.try_lock()?;
        async {
            self.stop_locked(&mut slot).await;
            info!("begin uninstall");
            self.instance
                .uninstall()
                .await
                .map_err(|source| hook_failed(Hook::Uninstall, source))
        }
        .instrument(self.op_span("uninstalling"))
        .await
    }

    /// Run the update hook, stopping the service around it if it was running.
    /// A failed update leaves the service stopped.
    pub async fn update(&self) -> Result<()> {
        let mut slot = self.try_lock()?;
        async {
            let was_running = slot.is_some();
            if was_running {
                self.stop_locked(&mut slot).await;
            }
            info!(was_running, "begin update");
            self.instance
                .update()
                .await
                .map_err(|source| hook_failed(Hook::Update, source))?;
            if was_running {
                self.start_locked(&mut slot).await?;
            }
            Ok(())
        }
        .instrument(self.op_span("updating"))
        .await
    }

    /// Run `f` with the live processes while holding the lifecycle lock, so no
    /// stop or restart can race it.
    pub async fn control<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ProcessSet) -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.try_lock()?;
        let processes = slot
            .as_ref()
            .map(|s| s.processes.clone())
            .ok_or(Error::NotStartedYet)?;
        Ok(f(processes).instrument(self.op_span("control")).await)
    }

    fn try_lock(&self) -> Result<MutexGuard<'_, Option<RuntimeSnapshot>>> {
        self.lifecycle.try_lock().map_err(|_| {
            debug!(parent: &self.span, "lifecycle lock held, rejecting");
            Error::Busy
        })
    }

    fn op_span(&self, tag: &'static str) -> Span {
        info_span!(parent: &self.span, "lifecycle", tag)
    }

    fn set_status(&self, next: Status) {
        set_status(&self.status, next);
    }

    async fn start_locked(&self, slot: &mut Option<RuntimeSnapshot>) -> Result<()> {
        if slot.is_some() {
            return Err(Error::AlreadyStarted);
        }
        info!("begin start service");
        self.set_status(Status::Starting);

        let process_token = CancellationToken::new();
        let teardown = TeardownGuard::new(self, process_token.clone());

        let processes = match self.instance.prepare_process(&process_token).await {
            Ok(processes) => processes,
            Err(e) => {
                error!(error = %format!("{e:#}"), "prepare process failed");
                teardown.finish();
                return Err(Error::Prepare(e));
            }
        };

        for (name, proc) in &processes {
            if let Err(e) = proc.start(&process_token) {
                error!(process = %name, error = %e, "start process failed, stopping the others");
                self.set_status(Status::Stopping);
                self.shutdown_processes(&processes, &process_token).await;
                teardown.finish();
                return Err(e);
            }
        }

        let mut snapshot = RuntimeSnapshot::new(processes.clone(), process_token);
        self.set_status(Status::WaitingActive);
        let watcher = tokio::spawn(
            watch_active(
                self.instance.clone(),
                processes,
                snapshot.watcher_token.clone(),
                self.status.clone(),
            )
            .instrument(info_span!(parent: &self.span, "watcher")),
        );
        snapshot.set_watcher(watcher);
        *slot = Some(snapshot);
        self.running.store(true, Ordering::Release);
        teardown.disarm();

        info!("service started");
        Ok(())
    }

    async fn stop_locked(&self, slot: &mut Option<RuntimeSnapshot>) {
        let Some(mut snapshot) = slot.take() else {
            debug!("service not running");
            return;
        };
        let teardown = TeardownGuard::new(self, snapshot.process_token.clone());
        info!("begin stop service");

        snapshot.stop_watcher().await;
        self.set_status(Status::Stopping);
        self.shutdown_processes(&snapshot.processes, &snapshot.process_token)
            .await;
        snapshot.close();
        teardown.finish();

        info!("service stopped");
    }

    /// Ask the instance to shut the processes down, then kill whatever is
    /// left once its grace period runs out.
    async fn shutdown_processes(&self, processes: &ProcessSet, process_token: &CancellationToken) {
        let grace = self.instance.graceful_shutdown(processes).await;
        if !wait_all_done(processes, grace).await {
            warn!(grace = ?grace, "graceful shutdown timed out, killing processes");
        }
        process_token.cancel();
        if !wait_all_exited(processes, KILL_TIMEOUT).await {
            warn!(timeout = ?KILL_TIMEOUT, "processes still not reaped after kill, giving up");
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("running", &self.running())
            .finish()
    }
}

fn hook_failed(hook: Hook, source: anyhow::Error) -> Error {
    error!(%hook, error = %format!("{source:#}"), "hook failed");
    Error::Hook { hook, source }
}

fn set_status(status: &watch::Sender<Status>, next: Status) {
    status.send_modify(|current| {
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "unexpected status transition");
        }
        debug!(from = %current, to = %next, "status changed");
        *current = next;
    });
}

async fn watch_active(
    instance: Arc<dyn Instance>,
    processes: ProcessSet,
    token: CancellationToken,
    status: Arc<watch::Sender<Status>>,
) {
    let active = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("readiness watcher cancelled");
            return;
        }
        active = instance.wait_active(&processes, &token) => active,
    };
    let next = if active { Status::Active } else { Status::Abnormal };

    // Checked under the channel's write lock: once stop has cancelled the
    // token, this can no longer overwrite its status.
    let published = status.send_if_modified(|current| {
        if token.is_cancelled() || *current != Status::WaitingActive {
            return false;
        }
        *current = next;
        true
    });
    if !published {
        debug!("readiness outcome discarded");
    } else if active {
        info!("service active");
    } else {
        warn!("service abnormal");
    }
}

/// Puts the service back to `Inactive` and kills the generation, either
/// explicitly through `finish` or when a lifecycle future is dropped midway.
struct TeardownGuard<'a> {
    service: &'a Service,
    process_token: CancellationToken,
    armed: bool,
}

impl<'a> TeardownGuard<'a> {
    fn new(service: &'a Service, process_token: CancellationToken) -> Self {
        Self {
            service,
            process_token,
            armed: true,
        }
    }

    fn reset(&self) {
        self.process_token.cancel();
        self.service.running.store(false, Ordering::Release);
        self.service.set_status(Status::Inactive);
    }

    fn finish(mut self) {
        self.armed = false;
        self.reset();
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(parent: &self.service.span, "lifecycle operation abandoned, killing processes");
            self.reset();
        }
    }
}
