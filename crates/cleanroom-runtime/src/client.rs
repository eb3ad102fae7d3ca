use crate::RuntimeError;
use cleanroom_schema::{ClientConfig, InstanceConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Captured outcome of a command run inside an instance or on the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Frozen,
    Unknown,
}

impl InstanceStatus {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "frozen" => Self::Frozen,
            _ => Self::Unknown,
        }
    }
}

/// One connection to the container runtime.
///
/// Every call blocks until the runtime answers. Connections are not assumed to
/// be thread-safe; each worker opens its own through a [`RuntimeConnector`].
pub trait RuntimeClient {
    fn exists(&self, name: &str) -> Result<bool, RuntimeError>;

    fn create(&self, config: &InstanceConfig) -> Result<(), RuntimeError>;

    fn status(&self, name: &str) -> Result<InstanceStatus, RuntimeError>;

    fn start(&self, name: &str) -> Result<(), RuntimeError>;

    fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    /// Delete a stopped instance, waiting for the operation to finish.
    fn delete(&self, name: &str) -> Result<(), RuntimeError>;

    /// Run `argv` inside the instance with exactly `env` added to its
    /// environment. A non-zero exit code is returned, not raised.
    fn execute(
        &self,
        name: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecResult, RuntimeError>;

    fn put_file(&self, name: &str, path: &str, data: &[u8]) -> Result<(), RuntimeError>;

    fn get_file(&self, name: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Global-scope addresses currently assigned to the instance.
    fn addresses(&self, name: &str) -> Result<Vec<IpAddr>, RuntimeError>;
}

/// Opens runtime connections. Shared across workers.
pub trait RuntimeConnector: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self, config: &ClientConfig) -> Result<Box<dyn RuntimeClient>, RuntimeError>;
}

pub fn select_connector(name: &str) -> Result<Arc<dyn RuntimeConnector>, RuntimeError> {
    match name {
        "lxd" => Ok(Arc::new(crate::lxd::LxcConnector::new())),
        "mock" => Ok(Arc::new(crate::mock::MockConnector::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
