// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Errors returned by managed processes and services.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Another lifecycle operation holds the service lock.
    #[error("service is busy")]
    Busy,

    #[error("already started")]
    AlreadyStarted,

    #[error("not started yet")]
    NotStartedYet,

    #[error("failed to spawn '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write to stdin of '{name}'")]
    Stdin {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[cfg(unix)]
    #[error("failed to signal '{name}'")]
    Signal {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to prepare processes")]
    Prepare(#[source] anyhow::Error),

    #[error("{hook} hook failed")]
    Hook {
        hook: Hook,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Instance hooks that can fail outside of process preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Install,
    Uninstall,
    Update,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Install => write!(f, "install"),
            Hook::Uninstall => write!(f, "uninstall"),
            Hook::Update => write!(f, "update"),
        }
    }
}

impl Error {
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }
}
