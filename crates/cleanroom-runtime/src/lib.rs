//! Runtime clients and host tooling for cleanroom.
//!
//! This crate implements the layer the orchestrator talks through: the
//! `RuntimeConnector`/`RuntimeClient` traits with an `lxc`-CLI driver and an
//! in-memory mock driver, the synchronous process `run` utility, operating
//! system detection, and package-manager clients for apt, dnf, pacman, and snap.

pub mod client;
pub mod lxd;
pub mod mock;
pub mod os;
pub mod pkgmgr;
pub mod process;

pub use client::{
    select_connector, ExecResult, InstanceStatus, RuntimeClient, RuntimeConnector,
};
pub use mock::{ExecCall, MockConnector, MockEvent};
pub use os::{detect_os, OsRelease};
pub use pkgmgr::{
    system_package_manager, Apt, Dnf, PackageInfo, PackageManager, Pacman, Snap,
};
pub use process::{command_exists, run, RunOptions};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("instance '{0}' does not exist")]
    InstanceNotFound(String),
    #[error("instance '{0}' is not running")]
    NotRunning(String),
    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),
    #[error("runtime API error: {0}")]
    Api(String),
    #[error(
        "command `{command}` failed{}: {stderr}",
        .code.map(|c| format!(" with exit code {c}")).unwrap_or_default()
    )]
    CommandExecution {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
