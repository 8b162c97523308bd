// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::process::ManagedProcess;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Named processes making up one generation of a service, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct ProcessSet(BTreeMap<String, Arc<ManagedProcess>>);

impl ProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a process under its own name, returning any process it replaced.
    pub fn insert(&mut self, process: ManagedProcess) -> Option<Arc<ManagedProcess>> {
        self.0.insert(process.name().to_string(), Arc::new(process))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ManagedProcess>> {
        self.0.get(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Arc<ManagedProcess>> {
        self.0.iter()
    }

    pub fn processes(&self) -> impl Iterator<Item = &Arc<ManagedProcess>> {
        self.0.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ManagedProcess> for ProcessSet {
    fn from_iter<T: IntoIterator<Item = ManagedProcess>>(iter: T) -> Self {
        let mut set = Self::new();
        for process in iter {
            set.insert(process);
        }
        set
    }
}

impl<'a> IntoIterator for &'a ProcessSet {
    type Item = (&'a String, &'a Arc<ManagedProcess>);
    type IntoIter = btree_map::Iter<'a, String, Arc<ManagedProcess>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Everything owned by one started generation of a service.
///
/// Exists exactly while the service is not `Inactive`.
pub(crate) struct RuntimeSnapshot {
    pub(crate) processes: ProcessSet,
    /// Parent of every process token. Cancelling it kills the generation.
    pub(crate) process_token: CancellationToken,
    /// Scopes the readiness watcher.
    pub(crate) watcher_token: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl RuntimeSnapshot {
    pub(crate) fn new(processes: ProcessSet, process_token: CancellationToken) -> Self {
        Self {
            processes,
            process_token,
            watcher_token: CancellationToken::new(),
            watcher: None,
        }
    }

    pub(crate) fn set_watcher(&mut self, watcher: JoinHandle<()>) {
        self.watcher = Some(watcher);
    }

    /// Cancel the watcher and wait until it can no longer publish a status.
    pub(crate) async fn stop_watcher(&mut self) {
        self.watcher_token.cancel();
        if let Some(watcher) = self.watcher.take()
            && let Err(e) = watcher.await
        {
            warn!(error = %e, "readiness watcher ended abnormally");
        }
    }

    /// Cancel both tokens. The processes die with their parent token.
    pub(crate) fn close(&self) {
        self.watcher_token.cancel();
        self.process_token.cancel();
    }
}

impl Drop for RuntimeSnapshot {
    fn drop(&mut self) {
        self.close();
    }
}
