// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::runtime::ProcessSet;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Service-specific behavior plugged into a [`Service`](crate::Service).
///
/// The service owns the lifecycle and the lock; an instance only builds
/// processes, judges readiness, and knows how to ask them to exit.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Build the processes for one generation. They are started by the
    /// service, in name order, under `process_token`.
    async fn prepare_process(&self, process_token: &CancellationToken) -> anyhow::Result<ProcessSet>;

    /// Resolve readiness. Return promptly once `token` is cancelled; the
    /// result is then discarded.
    async fn wait_active(&self, processes: &ProcessSet, token: &CancellationToken) -> bool;

    /// Ask the processes to exit and return how long to wait for them before
    /// they are killed.
    async fn graceful_shutdown(&self, processes: &ProcessSet) -> Duration;

    async fn install(&self) -> anyhow::Result<()>;

    async fn uninstall(&self) -> anyhow::Result<()>;

    async fn update(&self) -> anyhow::Result<()>;
}
