// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// No runtime snapshot exists.
    #[default]
    Inactive,
    /// Preparing and spawning processes.
    Starting,
    /// Processes are up, readiness not yet resolved.
    WaitingActive,
    /// Readiness check succeeded.
    Active,
    /// Readiness check failed; processes are still running.
    Abnormal,
    /// Tearing down the current generation.
    Stopping,
}

impl Status {
    pub fn is_inactive(self) -> bool {
        self == Status::Inactive
    }

    pub(crate) fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Inactive, Starting)
                | (Starting, WaitingActive)
                | (Starting, Stopping)
                | (Starting, Inactive)
                | (WaitingActive, Active)
                | (WaitingActive, Abnormal)
                | (WaitingActive, Stopping)
                | (Active, Stopping)
                | (Abnormal, Stopping)
                | (Stopping, Inactive)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Inactive => write!(f, "Inactive"),
            Status::Starting => write!(f, "Starting"),
            Status::WaitingActive => write!(f, "WaitingActive"),
            Status::Active => write!(f, "Active"),
            Status::Abnormal => write!(f, "Abnormal"),
            Status::Stopping => write!(f, "Stopping"),
        }
    }
}
