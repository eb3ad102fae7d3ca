use crate::client::{ExecResult, InstanceStatus, RuntimeClient, RuntimeConnector};
use crate::RuntimeError;
use cleanroom_schema::{ClientConfig, InstanceConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A call recorded by the mock runtime, in the order it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Connect,
    Create { name: String },
    Start { name: String },
    Stop { name: String },
    Delete { name: String },
    Exec { name: String, argv: Vec<String> },
    Put { name: String, path: String },
    Get { name: String, path: String },
}

/// What a responder sees when a command is executed in a mock instance.
pub struct ExecCall<'a> {
    pub instance: &'a str,
    pub argv: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    /// Contents of the file named by `argv[1]`, if the instance has it.
    /// Bootstrap scripts are run as `sh <path>`, so this is the script body.
    pub script: Option<&'a [u8]>,
}

type Responder = Box<dyn Fn(&ExecCall<'_>) -> Option<ExecResult> + Send + Sync>;

struct MockInstance {
    status: InstanceStatus,
    files: BTreeMap<String, Vec<u8>>,
    addresses: Vec<IpAddr>,
}

#[derive(Default)]
struct MockState {
    instances: BTreeMap<String, MockInstance>,
    events: Vec<MockEvent>,
    failing_creates: BTreeSet<String>,
    failing_deletes: BTreeSet<String>,
}

#[derive(Default)]
struct MockShared {
    state: Mutex<MockState>,
    responders: RwLock<Vec<Responder>>,
}

/// In-memory runtime that behaves like a single shared daemon.
///
/// Every connection opened from one connector (or its clones) sees the same
/// instances. Commands succeed with a canned stdout unless a registered
/// responder answers them.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<MockShared>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a responder. Responders are consulted in registration order;
    /// the first one returning `Some` decides the result.
    pub fn on_exec<F>(&self, responder: F)
    where
        F: Fn(&ExecCall<'_>) -> Option<ExecResult> + Send + Sync + 'static,
    {
        if let Ok(mut responders) = self.shared.responders.write() {
            responders.push(Box::new(responder));
        }
    }

    /// Add an instance as if it had been created outside the orchestrator.
    pub fn insert_instance(&self, name: &str, status: InstanceStatus) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.instances.insert(
                name.to_owned(),
                MockInstance {
                    status,
                    files: BTreeMap::new(),
                    addresses: Vec::new(),
                },
            );
        }
    }

    pub fn set_addresses(&self, name: &str, addresses: Vec<IpAddr>) {
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(instance) = state.instances.get_mut(name) {
                instance.addresses = addresses;
            }
        }
    }

    /// Make every future `create` of `name` fail.
    pub fn fail_create(&self, name: &str) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.failing_creates.insert(name.to_owned());
        }
    }

    /// Make every future `delete` of `name` fail, leaving it in place.
    pub fn fail_delete(&self, name: &str) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.failing_deletes.insert(name.to_owned());
        }
    }

    /// Undo `fail_create` and `fail_delete` for `name`.
    pub fn clear_failures(&self, name: &str) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.failing_creates.remove(name);
            state.failing_deletes.remove(name);
        }
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.shared
            .state
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    pub fn status_of(&self, name: &str) -> Option<InstanceStatus> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|s| s.instances.get(name).map(|i| i.status))
    }

    pub fn file(&self, name: &str, path: &str) -> Option<Vec<u8>> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|s| s.instances.get(name).and_then(|i| i.files.get(path).cloned()))
    }

    pub fn connects(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Connect))
    }

    pub fn creates(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Create { .. }))
    }

    pub fn execs(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Exec { .. }))
    }

    pub fn puts(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Put { .. }))
    }

    fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl RuntimeConnector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    fn connect(&self, _config: &ClientConfig) -> Result<Box<dyn RuntimeClient>, RuntimeError> {
        let client = MockClient {
            shared: Arc::clone(&self.shared),
        };
        client.lock()?.events.push(MockEvent::Connect);
        Ok(Box::new(client))
    }
}

struct MockClient {
    shared: Arc<MockShared>,
}

impl MockClient {
    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.shared
            .state
            .lock()
            .map_err(|e| RuntimeError::Api(format!("mutex poisoned: {e}")))
    }
}

fn instance_mut<'a>(
    state: &'a mut MockState,
    name: &str,
) -> Result<&'a mut MockInstance, RuntimeError> {
    state
        .instances
        .get_mut(name)
        .ok_or_else(|| RuntimeError::InstanceNotFound(name.to_owned()))
}

impl RuntimeClient for MockClient {
    fn exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.lock()?.instances.contains_key(name))
    }

    fn create(&self, config: &InstanceConfig) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let name = config.name.to_string();
        state.events.push(MockEvent::Create { name: name.clone() });
        if state.failing_creates.contains(&name) {
            return Err(RuntimeError::Api(format!(
                "failed to create instance '{name}'"
            )));
        }
        if state.instances.contains_key(&name) {
            return Err(RuntimeError::Api(format!(
                "instance '{name}' already exists"
            )));
        }
        state.instances.insert(
            name,
            MockInstance {
                status: InstanceStatus::Stopped,
                files: BTreeMap::new(),
                addresses: Vec::new(),
            },
        );
        Ok(())
    }

    fn status(&self, name: &str) -> Result<InstanceStatus, RuntimeError> {
        let mut state = self.lock()?;
        Ok(instance_mut(&mut state, name)?.status)
    }

    fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.events.push(MockEvent::Start {
            name: name.to_owned(),
        });
        let instance = instance_mut(&mut state, name)?;
        if instance.status == InstanceStatus::Running {
            return Err(RuntimeError::AlreadyRunning(name.to_owned()));
        }
        instance.status = InstanceStatus::Running;
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.events.push(MockEvent::Stop {
            name: name.to_owned(),
        });
        let instance = instance_mut(&mut state, name)?;
        if instance.status != InstanceStatus::Running {
            return Err(RuntimeError::NotRunning(name.to_owned()));
        }
        instance.status = InstanceStatus::Stopped;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.events.push(MockEvent::Delete {
            name: name.to_owned(),
        });
        if instance_mut(&mut state, name)?.status == InstanceStatus::Running {
            return Err(RuntimeError::Api(format!(
                "cannot delete running instance '{name}'"
            )));
        }
        if state.failing_deletes.contains(name) {
            return Err(RuntimeError::Api(format!(
                "failed to delete instance '{name}'"
            )));
        }
        state.instances.remove(name);
        Ok(())
    }

    fn execute(
        &self,
        name: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecResult, RuntimeError> {
        let script = {
            let mut state = self.lock()?;
            state.events.push(MockEvent::Exec {
                name: name.to_owned(),
                argv: argv.to_vec(),
            });
            let instance = instance_mut(&mut state, name)?;
            if instance.status != InstanceStatus::Running {
                return Err(RuntimeError::NotRunning(name.to_owned()));
            }
            argv.get(1).and_then(|p| instance.files.get(p).cloned())
        };

        // Responders run without the state lock so they may inspect the mock.
        let call = ExecCall {
            instance: name,
            argv,
            env,
            script: script.as_deref(),
        };
        let responders = self
            .shared
            .responders
            .read()
            .map_err(|e| RuntimeError::Api(format!("lock poisoned: {e}")))?;
        if let Some(result) = responders.iter().find_map(|r| r(&call)) {
            return Ok(result);
        }

        Ok(ExecResult {
            exit_code: 0,
            stdout: format!("mock-exec: {}\n", argv.join(" ")),
            stderr: String::new(),
        })
    }

    fn put_file(&self, name: &str, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.events.push(MockEvent::Put {
            name: name.to_owned(),
            path: path.to_owned(),
        });
        instance_mut(&mut state, name)?
            .files
            .insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn get_file(&self, name: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let mut state = self.lock()?;
        state.events.push(MockEvent::Get {
            name: name.to_owned(),
            path: path.to_owned(),
        });
        instance_mut(&mut state, name)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::Api(format!("{path}: no such file in '{name}'")))
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpAddr>, RuntimeError> {
        let mut state = self.lock()?;
        Ok(instance_mut(&mut state, name)?.addresses.clone())
    }
}
