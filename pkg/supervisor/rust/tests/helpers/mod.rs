// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use svc_supervisor::shutdown::interrupt_all;
use svc_supervisor::{Instance, ManagedProcess, ProcessSet, Service, Status};
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// ===========================================================================
// Scripted Instance
// ===========================================================================

/// How `wait_active` resolves.
#[derive(Debug, Clone, Copy)]
pub enum Readiness {
    /// Only returns once the watcher is cancelled.
    Never,
    /// Returns the outcome after a delay, or false as soon as cancelled.
    After(Duration, bool),
    /// Returns the outcome after a delay without looking at the token.
    IgnoringCancel(Duration, bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Graceful {
    Interrupt,
    /// Leave the processes alone so stop has to kill them.
    Nothing,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub prepare: AtomicUsize,
    pub graceful: AtomicUsize,
    pub watcher_cancelled: AtomicUsize,
    pub install: AtomicUsize,
    pub uninstall: AtomicUsize,
    pub update: AtomicUsize,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// An Instance whose behavior is fixed up front by the test.
pub struct ScriptedInstance {
    processes: Vec<(String, String, Vec<String>)>,
    readiness: Readiness,
    graceful: Graceful,
    grace: Duration,
    prepare_delay: Duration,
    graceful_delay: Duration,
    hook_delay: Duration,
    fail_prepare: bool,
    fail_update: bool,
    pub calls: Calls,
    last: Mutex<Option<ProcessSet>>,
}

impl ScriptedInstance {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            readiness: Readiness::After(Duration::ZERO, true),
            graceful: Graceful::Interrupt,
            grace: Duration::from_secs(5),
            prepare_delay: Duration::ZERO,
            graceful_delay: Duration::ZERO,
            hook_delay: Duration::ZERO,
            fail_prepare: false,
            fail_update: false,
            calls: Calls::default(),
            last: Mutex::new(None),
        }
    }

    pub fn process(mut self, name: &str, program: &str, args: &[&str]) -> Self {
        self.processes.push((
            name.to_string(),
            program.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
        ));
        self
    }

    pub fn sleeper(self, name: &str) -> Self {
        self.process(name, "/bin/sleep", &["60"])
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn graceful(mut self, graceful: Graceful, grace: Duration) -> Self {
        self.graceful = graceful;
        self.grace = grace;
        self
    }

    pub fn delays(mut self, prepare: Duration, graceful: Duration, hook: Duration) -> Self {
        self.prepare_delay = prepare;
        self.graceful_delay = graceful;
        self.hook_delay = hook;
        self
    }

    pub fn fail_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn fail_update(mut self) -> Self {
        self.fail_update = true;
        self
    }

    /// The process set handed out by the latest `prepare_process`.
    pub fn last_processes(&self) -> ProcessSet {
        self.last.lock().unwrap().clone().expect("prepare_process was never called")
    }
}

#[async_trait]
impl Instance for ScriptedInstance {
    async fn prepare_process(&self, _process_token: &CancellationToken) -> anyhow::Result<ProcessSet> {
        self.calls.prepare.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.prepare_delay).await;
        if self.fail_prepare {
            anyhow::bail!("scripted preparation failure");
        }
        let set: ProcessSet = self
            .processes
            .iter()
            .map(|(name, program, args)| ManagedProcess::new(name, program, args))
            .collect();
        *self.last.lock().unwrap() = Some(set.clone());
        Ok(set)
    }

    async fn wait_active(&self, _processes: &ProcessSet, token: &CancellationToken) -> bool {
        match self.readiness {
            Readiness::Never => {
                token.cancelled().await;
                self.calls.watcher_cancelled.fetch_add(1, Ordering::SeqCst);
                false
            }
            Readiness::After(delay, outcome) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        self.calls.watcher_cancelled.fetch_add(1, Ordering::SeqCst);
                        false
                    }
                    _ = tokio::time::sleep(delay) => outcome,
                }
            }
            Readiness::IgnoringCancel(delay, outcome) => {
                tokio::time::sleep(delay).await;
                outcome
            }
        }
    }

    async fn graceful_shutdown(&self, processes: &ProcessSet) -> Duration {
        self.calls.graceful.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.graceful_delay).await;
        if self.graceful == Graceful::Interrupt {
            interrupt_all(processes);
        }
        self.grace
    }

    async fn install(&self) -> anyhow::Result<()> {
        self.calls.install.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hook_delay).await;
        Ok(())
    }

    async fn uninstall(&self) -> anyhow::Result<()> {
        self.calls.uninstall.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hook_delay).await;
        Ok(())
    }

    async fn update(&self) -> anyhow::Result<()> {
        self.calls.update.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.hook_delay).await;
        if self.fail_update {
            anyhow::bail!("scripted update failure");
        }
        Ok(())
    }
}

/// A service and a handle on its instance for assertions.
pub fn scripted_service(name: &str, instance: ScriptedInstance) -> (Service, Arc<ScriptedInstance>) {
    let instance = Arc::new(instance);
    (Service::new(name, instance.clone()), instance)
}

/// Wait until the service reports `want`, or panic after the default timeout.
pub async fn wait_for_status(service: &Service, want: Status) {
    let mut rx = service.subscribe();
    let res = tokio::time::timeout(DEFAULT_TIMEOUT, rx.wait_for(|s| *s == want)).await;
    assert!(
        matches!(res, Ok(Ok(_))),
        "status never became {want}, still {}",
        service.status()
    );
}

/// Wait until every started process in `set` is done.
pub async fn wait_for_done(set: &ProcessSet) {
    for proc in set.processes() {
        if proc.has_started() {
            tokio::time::timeout(DEFAULT_TIMEOUT, proc.wait())
                .await
                .unwrap_or_else(|_| panic!("{} never finished", proc.name()))
                .unwrap();
        }
    }
}

// ===========================================================================
// Daemon
// ===========================================================================

/// Handle to a running svc-supervisord process.
pub struct DaemonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _stdout_thread: std::thread::JoinHandle<()>,
}

impl DaemonHandle {
    /// Start the daemon with `SVC_SUPERVISOR_CONFIG_DIR` pointing to the given directory.
    pub fn start(config_dir: &Path) -> Self {
        let bin = env!("CARGO_BIN_EXE_svc-supervisord");
        let mut child = Command::new(bin)
            .env("SVC_SUPERVISOR_CONFIG_DIR", config_dir)
            .env("SVC_SUPERVISOR_LOG_LEVEL", "info")
            .env_remove("RUST_LOG")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to start svc-supervisord");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines = Arc::clone(&log_lines);

        // The fmt subscriber writes every level to stdout.
        let stdout_thread = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(l) => {
                        eprintln!("[daemon] {l}");
                        lines.lock().unwrap().push(l);
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            child,
            log_lines,
            _stdout_thread: stdout_thread,
        }
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count_log_matches(pattern) > 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to send signal to daemon");
    }

    /// Send SIGTERM and wait for the daemon to exit. Returns the exit status.
    pub fn stop(&mut self) -> std::process::ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(Duration::from_secs(30))
    }

    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .child
                .try_wait()
                .expect("failed to check daemon status")
            {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed daemon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// Extract PIDs from "spawned subprocess pid=NNN" log lines.
    pub fn spawned_pids(&self) -> Vec<u32> {
        let lines = self.log_lines.lock().unwrap();
        lines
            .iter()
            .filter(|l| l.contains("spawned subprocess"))
            .filter_map(|l| {
                let marker = "pid=";
                let start = l.rfind(marker)? + marker.len();
                let digits: String = l[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            })
            .collect()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Write a YAML service definition into `dir`.
pub fn write_config(dir: &Path, name: &str, yaml: &str) {
    let path = dir.join(format!("{name}.yaml"));
    std::fs::write(&path, yaml)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
}

/// True if `pid` exists and is not a zombie. Orphans killed by the
/// supervisor are reaped by init, which may lag behind.
pub fn pid_is_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| rest.starts_with('Z')),
        Err(_) => true,
    }
}

/// Wait for a script to write a PID into `path`.
pub async fn read_pid_file(path: &Path) -> u32 {
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    loop {
        if let Ok(contents) = std::fs::read_to_string(path)
            && let Ok(pid) = contents.trim().parse()
        {
            return pid;
        }
        assert!(Instant::now() < deadline, "no pid written to {}", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
