// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process supervision core: managed child processes grouped into services
//! with a guarded start/stop lifecycle and asynchronous readiness tracking.

pub mod command;
pub mod config;
pub mod env;
pub mod error;
pub mod instance;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod shutdown;
pub mod status;

pub use command::CommandInstance;
pub use error::{Error, Hook, Result};
pub use instance::Instance;
pub use process::{DoneReason, ManagedProcess, OutFunc};
pub use registry::{Registry, RegistryError};
pub use runtime::ProcessSet;
pub use service::Service;
pub use status::Status;
