// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! A single supervised child process.
//!
//! A `ManagedProcess` is built with [`ManagedProcess::new`] and the builder
//! setters, then started once with a parent cancellation token. Starting it
//! launches two background tasks that live as long as the child:
//!
//! - the output pump, which reads stdout/stderr line by line and hands every
//!   line to the registered output observers,
//! - the reaper, which waits on the child, and kills the whole process group
//!   when the owned token is cancelled (explicit kill, timeout, or parent) or
//!   after the child exited on its own, so no group member outlives it.
//!
//! The observer map is owned by the pump. Callers change it through a
//! single-slot control channel and wait for the pump's acknowledgement.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// How long the reaper lets the pump drain buffered output after the child
/// exits on its own, before marking the process done.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest line handed to observers. Longer output is cut into pieces.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Line observer. Called sequentially from the output pump.
pub type OutFunc = Arc<dyn Fn(&str) + Send + Sync>;

/// Why a process's token is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// Cancelled by kill, by the parent token, or because the child exited.
    Cancelled,
    /// The configured execution timeout elapsed.
    TimedOut,
}

enum OutFuncCtrl {
    Add {
        name: String,
        out_func: OutFunc,
        ack: oneshot::Sender<()>,
    },
    Remove {
        name: String,
        ack: oneshot::Sender<()>,
    },
}

struct Running {
    pid: Option<u32>,
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
    exit_status: Arc<OnceLock<ExitStatus>>,
    /// Set as soon as the reaper's wait on the child returns. The pid must
    /// not be signalled after that.
    reaped: Arc<AtomicBool>,
    /// Cancelled once the reaper is done with the process group.
    exited: CancellationToken,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    ctrl_tx: mpsc::Sender<OutFuncCtrl>,
}

impl Running {
    fn done_reason(&self) -> DoneReason {
        if self.timed_out.load(Ordering::Acquire) {
            DoneReason::TimedOut
        } else {
            DoneReason::Cancelled
        }
    }

    fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }
}

pub struct ManagedProcess {
    name: String,
    program: String,
    args: Vec<String>,
    env: Option<Vec<(String, String)>>,
    dir: Option<PathBuf>,
    timeout: Option<Duration>,
    span: Span,

    started: AtomicBool,
    /// Observers registered before start. Taken by the pump on start.
    pending: Mutex<Option<BTreeMap<String, OutFunc>>>,
    running: OnceLock<Running>,
}

impl ManagedProcess {
    pub fn new<I, S>(name: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let span = info_span!("subprocess", subprocess = %name);
        Self {
            name,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: None,
            dir: None,
            timeout: None,
            span,
            started: AtomicBool::new(false),
            pending: Mutex::new(Some(BTreeMap::new())),
            running: OnceLock::new(),
        }
    }

    /// Cancel the process once `timeout` has elapsed after start.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Log under `parent` instead of the span that was current at construction.
    pub fn span(mut self, parent: &Span) -> Self {
        self.span = info_span!(parent: parent, "subprocess", subprocess = %self.name);
        self
    }

    /// Replace the inherited environment with `vars`.
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The program and its arguments joined by spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The owned token, available once started.
    pub fn token(&self) -> Option<CancellationToken> {
        self.running.get().map(|r| r.token.clone())
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.get().and_then(|r| r.pid)
    }

    /// Exit status of the child, once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.running.get().and_then(|r| r.exit_status.get().copied())
    }

    pub fn has_started(&self) -> bool {
        self.running.get().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .get()
            .is_some_and(|r| !r.token.is_cancelled() && !r.is_reaped())
    }

    /// True once the child has been reaped or the owned token is done. Never
    /// true for an unstarted process.
    pub fn is_done(&self) -> bool {
        self.running
            .get()
            .is_some_and(|r| r.token.is_cancelled() || r.is_reaped())
    }

    /// Spawn the child under a token derived from `parent`.
    ///
    /// Must be called from within a Tokio runtime. A process can only be
    /// started once, even if spawning failed.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        let _enter = self.span.enter();

        info!(
            program = %self.program,
            args = ?self.args,
            dir = ?self.dir,
            timeout = ?self.timeout,
            "begin start subprocess"
        );

        let token = parent.child_token();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref env) = self.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        if let Some(ref dir) = self.dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            name: self.name.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
        let timed_out = Arc::new(AtomicBool::new(false));
        let exit_status = Arc::new(OnceLock::new());
        let reaped = Arc::new(AtomicBool::new(false));
        let exited = CancellationToken::new();

        let running = Running {
            pid,
            token: token.clone(),
            timed_out: timed_out.clone(),
            exit_status: exit_status.clone(),
            reaped: reaped.clone(),
            exited: exited.clone(),
            stdin: tokio::sync::Mutex::new(stdin),
            ctrl_tx,
        };
        // Publish before taking the pending map: a concurrent registration
        // either lands in the map or sees `running` and uses the channel.
        if self.running.set(running).is_err() {
            return Err(Error::AlreadyStarted);
        }
        let out_funcs = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();

        let pump = tokio::spawn(
            loop_output(stdout, stderr, token.clone(), ctrl_rx, out_funcs)
                .instrument(self.span.clone()),
        );
        let reaper = Reaper {
            token,
            deadline: self.timeout,
            timed_out,
            exit_status,
            reaped,
            exited,
            pump,
        };
        tokio::spawn(block_wait(child, reaper).instrument(self.span.clone()));

        match pid {
            Some(pid) => info!(pid, "spawned subprocess"),
            None => warn!("spawned subprocess without a pid"),
        }
        Ok(())
    }

    /// Ask the child to exit with SIGINT. Does not wait for it.
    pub fn interrupt(&self) -> Result<()> {
        let Some(running) = self.running.get() else {
            return Ok(());
        };
        let Some(pid) = running.pid else {
            return Ok(());
        };
        if running.token.is_cancelled() || running.is_reaped() {
            return Ok(());
        }
        let _enter = self.span.enter();
        info!(pid, "begin interrupt subprocess");
        self.send_interrupt(pid, running)
    }

    #[cfg(unix)]
    fn send_interrupt(&self, pid: u32, _running: &Running) -> Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(source) => Err(Error::Signal {
                name: self.name.clone(),
                source,
            }),
        }
    }

    #[cfg(not(unix))]
    fn send_interrupt(&self, _pid: u32, running: &Running) -> Result<()> {
        warn!("interrupt not supported on this platform, killing instead");
        running.token.cancel();
        Ok(())
    }

    /// Cancel the owned token, which terminates the whole process group.
    /// Returns `None` if the process was never started.
    pub fn kill(&self) -> Option<DoneReason> {
        let running = self.running.get()?;
        let _enter = self.span.enter();
        info!("begin stop subprocess");
        running.token.cancel();
        Some(running.done_reason())
    }

    /// Write all of `content` to the child's stdin.
    pub async fn write(&self, content: &[u8]) -> Result<usize> {
        let running = self.running.get().ok_or(Error::NotStartedYet)?;
        let mut guard = running.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| Error::Stdin {
            name: self.name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"),
        })?;

        let res = async {
            stdin.write_all(content).await?;
            stdin.flush().await
        }
        .await;
        res.map_err(|source| Error::Stdin {
            name: self.name.clone(),
            source,
        })?;
        Ok(content.len())
    }

    /// Block until the child has been reaped and the rest of its process group
    /// killed. Returns at once if never started.
    ///
    /// Unlike [`wait`](Self::wait), this does not return on cancellation
    /// before the kill has actually taken effect.
    pub async fn wait_exited(&self) {
        if let Some(running) = self.running.get() {
            running.exited.cancelled().await;
        }
    }

    /// Close stdin so the child reads EOF.
    pub async fn close_stdin(&self) -> Result<()> {
        let running = self.running.get().ok_or(Error::NotStartedYet)?;
        running.stdin.lock().await.take();
        Ok(())
    }

    /// Block until the owned token is done.
    pub async fn wait(&self) -> Result<DoneReason> {
        let running = self.running.get().ok_or(Error::NotStartedYet)?;
        async {
            debug!("begin wait subprocess");
            running.token.cancelled().await;
        }
        .instrument(self.span.clone())
        .await;
        Ok(running.done_reason())
    }

    /// Add (or replace) the output observer called `name`.
    pub async fn register_out_func<F>(&self, name: impl Into<String>, out_func: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let name = name.into();
        let out_func: OutFunc = Arc::new(out_func);
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(map) = pending.as_mut() {
                map.insert(name, out_func);
                return;
            }
        }

        let (ack, acked) = oneshot::channel();
        self.send_ctrl(
            OutFuncCtrl::Add {
                name: name.clone(),
                out_func,
                ack,
            },
            acked,
        )
        .instrument(self.span.clone())
        .await;
        debug!(parent: &self.span, name, "registered output func");
    }

    pub async fn unregister_out_func(&self, name: &str) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(map) = pending.as_mut() {
                map.remove(name);
                return;
            }
        }

        let (ack, acked) = oneshot::channel();
        self.send_ctrl(
            OutFuncCtrl::Remove {
                name: name.to_string(),
                ack,
            },
            acked,
        )
        .instrument(self.span.clone())
        .await;
        debug!(parent: &self.span, name, "unregistered output func");
    }

    async fn send_ctrl(&self, msg: OutFuncCtrl, acked: oneshot::Receiver<()>) {
        let Some(running) = self.running.get() else {
            return;
        };
        if running.ctrl_tx.send(msg).await.is_err() {
            debug!("output loop already exited");
            return;
        }
        // The pump drops the ack if it exits with the message still queued.
        let _ = acked.await;
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("command", &self.command_line())
            .field("pid", &self.pid())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Buffered line reader that keeps partial lines across cancelled reads, so
/// it can sit in a `select!`. Invalid UTF-8 is replaced, not fatal. Lines
/// longer than `max_len` bytes are returned in `max_len` pieces.
struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self::with_max_len(reader, MAX_LINE_LEN)
    }

    fn with_max_len(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_len,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            // `fill_buf` is cancel-safe and bytes are only consumed once they
            // are in `self.buf`.
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            // A newline right after a full line still belongs to it.
            let room = self.max_len - self.buf.len();
            let scan = &available[..available.len().min(room + 1)];
            if let Some(i) = scan.iter().position(|&b| b == b'\n') {
                self.buf.extend_from_slice(&scan[..=i]);
                self.reader.consume(i + 1);
                return Ok(Some(self.take_line()));
            }
            let n = available.len().min(room);
            self.buf.extend_from_slice(&available[..n]);
            self.reader.consume(n);

            if self.buf.len() >= self.max_len {
                warn!(max_len = self.max_len, "output line too long, cutting it");
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

fn apply_ctrl(out_funcs: &mut BTreeMap<String, OutFunc>, msg: OutFuncCtrl) {
    match msg {
        OutFuncCtrl::Add {
            name,
            out_func,
            ack,
        } => {
            out_funcs.insert(name, out_func);
            let _ = ack.send(());
        }
        OutFuncCtrl::Remove { name, ack } => {
            out_funcs.remove(&name);
            let _ = ack.send(());
        }
    }
}

async fn loop_output<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    token: CancellationToken,
    mut ctrl_rx: mpsc::Receiver<OutFuncCtrl>,
    mut out_funcs: BTreeMap<String, OutFunc>,
) where
    O: tokio::io::AsyncRead + Unpin,
    E: tokio::io::AsyncRead + Unpin,
{
    debug!("begin loop output");

    let mut out_open = stdout.is_some();
    let mut err_open = stderr.is_some();
    let mut stdout = stdout.map(|s| LineReader::new(BufReader::new(s)));
    let mut stderr = stderr.map(|s| LineReader::new(BufReader::new(s)));

    while out_open || err_open {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("exit loop output: token cancelled");
                return;
            }
            Some(msg) = ctrl_rx.recv() => {
                apply_ctrl(&mut out_funcs, msg);
                continue;
            }
            res = async { stdout.as_mut()?.next_line().await.transpose() }, if out_open => {
                out_open = res.as_ref().is_some_and(|r| r.is_ok());
                res
            }
            res = async { stderr.as_mut()?.next_line().await.transpose() }, if err_open => {
                err_open = res.as_ref().is_some_and(|r| r.is_ok());
                res
            }
        };

        let line = match read {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "output scan failed");
                continue;
            }
            None => continue,
        };

        if let Ok(msg) = ctrl_rx.try_recv() {
            apply_ctrl(&mut out_funcs, msg);
        }
        for out_func in out_funcs.values() {
            out_func(&line);
        }
    }
    debug!("exit loop output: streams closed");
}

struct Reaper {
    token: CancellationToken,
    deadline: Option<Duration>,
    timed_out: Arc<AtomicBool>,
    exit_status: Arc<OnceLock<ExitStatus>>,
    reaped: Arc<AtomicBool>,
    exited: CancellationToken,
    pump: JoinHandle<()>,
}

impl Reaper {
    fn record_exit(&self, res: std::io::Result<ExitStatus>, msg: &str) {
        self.reaped.store(true, Ordering::Release);
        match res {
            Ok(status) => {
                let _ = self.exit_status.set(status);
                info!(%status, "{msg}");
            }
            Err(e) => error!(error = %e, "wait on subprocess failed"),
        }
    }
}

async fn block_wait(mut child: Child, reaper: Reaper) {
    debug!("begin block wait subprocess");
    let _exited = reaper.exited.clone().drop_guard();
    // `Child::id` is gone once the child has been waited on.
    let pid = child.id();

    let deadline = reaper.deadline;
    let expired = async move {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = child.wait() => {
            reaper.record_exit(res, "subprocess exited");
            // Let the pump hand out what the child wrote before exiting.
            let _ = timeout(OUTPUT_DRAIN_TIMEOUT, reaper.pump).await;
            if let Some(pid) = pid {
                kill_orphans(pid);
            }
            reaper.token.cancel();
            return;
        }
        _ = expired => {
            warn!(timeout = ?deadline, "subprocess timed out");
            reaper.timed_out.store(true, Ordering::Release);
            reaper.token.cancel();
        }
        _ = reaper.token.cancelled() => {}
    }

    terminate_group(&mut child);
    let res = child.wait().await;
    reaper.record_exit(res, "subprocess killed");
}

/// SIGKILL whatever is left in the process group of an exited child.
#[cfg(unix)]
fn kill_orphans(pgid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => info!(pgid, "killed leftover process group members"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "failed to kill leftover process group"),
    }
}

#[cfg(not(unix))]
fn kill_orphans(_pgid: u32) {}

/// SIGKILL the child's process group, falling back to the child alone.
fn terminate_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => debug!(pid, error = %e, "killpg failed, killing child only"),
            }
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed, child already exited");
    }
}
