// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::service::Service;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    Duplicate(String),
}

/// Services known to the supervisor, by name.
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Service) -> Result<Arc<Service>, RegistryError> {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(service.name()) {
            return Err(RegistryError::Duplicate(service.name().to_string()));
        }
        let service = Arc::new(service);
        services.insert(service.name().to_string(), service.clone());
        info!(service = %service.name(), "registered service");
        Ok(service)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every service concurrently. Failures are logged.
    pub async fn stop_all(&self) {
        let services: Vec<Arc<Service>> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut tasks = tokio::task::JoinSet::new();
        for service in services {
            tasks.spawn(async move {
                if let Err(e) = service.stop().await {
                    warn!(service = %service.name(), error = %e, "failed to stop service");
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "stop task failed");
            }
        }
    }
}
