// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::runtime::ProcessSet;
use tokio::time::{Duration, timeout};
use tracing::{info, warn};

/// Send SIGINT to every running process. Failures are logged, not returned.
pub fn interrupt_all(processes: &ProcessSet) {
    for (name, proc) in processes {
        if !proc.is_running() {
            continue;
        }
        info!(process = %name, "sending interrupt");
        if let Err(e) = proc.interrupt() {
            warn!(process = %name, error = %e, "failed to interrupt process");
        }
    }
}

/// Wait up to `grace` for every started process to be done.
/// Returns false if at least one was still running when the time ran out.
pub async fn wait_all_done(processes: &ProcessSet, grace: Duration) -> bool {
    let tokens: Vec<_> = processes.processes().filter_map(|p| p.token()).collect();
    let all_done = async {
        for token in &tokens {
            token.cancelled().await;
        }
    };
    if timeout(grace, all_done).await.is_ok() {
        return true;
    }
    for (name, proc) in processes {
        if proc.is_running() {
            warn!(process = %name, grace = ?grace, "still running after grace period");
        }
    }
    false
}

/// Wait up to `bound` for every started process to be reaped.
pub async fn wait_all_exited(processes: &ProcessSet, bound: Duration) -> bool {
    let all_exited = async {
        for proc in processes.processes() {
            proc.wait_exited().await;
        }
    };
    timeout(bound, all_exited).await.is_ok()
}
