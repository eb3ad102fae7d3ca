//! Orchestration core for cleanroom test instances.
//!
//! The [`Orchestrator`] drives instances through their lifecycle on a
//! container runtime, ships packages and artifacts into them with the
//! injection protocol, runs hooks around test payloads, and fans work out
//! across a worker pool. The [`Harness`] wraps it with the four execution
//! strategies.

pub mod env;
pub mod harness;
pub mod hooks;
pub mod lifecycle;
pub mod orchestrator;
pub mod pool;
pub mod project;
pub mod remote;

pub use env::EnvStore;
pub use harness::{Harness, Payload, Strategy};
pub use hooks::{Hook, HookClass, HookRegistry, StartEnvHook, StopEnvHook};
pub use lifecycle::{validate_transition, InstanceState};
pub use orchestrator::{DeployRequest, Orchestrator, Registries, TransferOptions};
pub use pool::{thread_count, WorkerPool, THREADS_ENV};
pub use project::{Project, ProjectHooks, RunSettings, PROJECT_FILE};

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] cleanroom_schema::ConfigError),
    #[error("runtime error: {0}")]
    Runtime(#[from] cleanroom_runtime::RuntimeError),
    #[error("injection error: {0}")]
    Inject(#[from] cleanroom_inject::InjectError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("hook not found: {0}")]
    HookNotFound(String),
    #[error("{classification} hook '{name}' is already registered")]
    DuplicateHook {
        name: String,
        classification: HookClass,
    },
    #[error("invalid state transition for '{instance}': {from} -> {to}")]
    InvalidTransition {
        instance: String,
        from: InstanceState,
        to: InstanceState,
    },
    #[error("{stage} failed on '{instance}' with exit code {code}: {stderr}")]
    RemoteCommand {
        instance: String,
        stage: String,
        code: i32,
        stderr: String,
    },
    #[error("'{path}' is neither a file nor a directory in '{instance}'")]
    RemotePathNotFound { instance: String, path: String },
    #[error("unexpected agent reply from '{instance}': {detail}")]
    UnexpectedReply { instance: String, detail: String },
    #[error("{}", partial_summary(.succeeded, .failures))]
    PartialFailure {
        succeeded: Vec<String>,
        failures: BTreeMap<String, String>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("project file error: {0}")]
    Project(#[from] toml::de::Error),
}

fn partial_summary(succeeded: &[String], failures: &BTreeMap<String, String>) -> String {
    let detail = failures
        .iter()
        .map(|(name, error)| format!("{name}: {error}"))
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "{} of {} instances failed: {detail}",
        failures.len(),
        failures.len() + succeeded.len()
    )
}
