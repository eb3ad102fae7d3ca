use crate::hooks::{Hook, StartEnvHook, StopEnvHook};
use crate::orchestrator::Registries;
use crate::CoreError;
use cleanroom_schema::{ClientConfig, InstanceConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const PROJECT_FILE: &str = "cleanroom.toml";

/// Contents of a `cleanroom.toml` project file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub instance: Vec<InstanceConfig>,
    #[serde(default)]
    pub hooks: ProjectHooks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub preserve: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            threads: None,
            preserve: false,
        }
    }
}

fn default_backend() -> String {
    "lxd".to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectHooks {
    #[serde(default)]
    pub start: Vec<StartEnvHook>,
    #[serde(default)]
    pub stop: Vec<StopEnvHook>,
}

impl Project {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Install the client config, instance templates and hooks into `registries`.
    pub fn apply(&self, registries: &mut Registries) -> Result<(), CoreError> {
        registries.configs.set_client_config(self.client.clone());
        registries.configs.add(self.instance.iter().cloned())?;
        let hooks = self
            .hooks
            .start
            .iter()
            .cloned()
            .map(Hook::from)
            .chain(self.hooks.stop.iter().cloned().map(Hook::from));
        registries.hooks.register(hooks)?;
        Ok(())
    }
}
