use crate::source::InstanceSource;
use crate::types::InstanceName;
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    #[default]
    Container,
    VirtualMachine,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => f.write_str("container"),
            Self::VirtualMachine => f.write_str("virtual-machine"),
        }
    }
}

/// Template for a test environment instance.
///
/// A value of this type is always valid: construction and deserialization both
/// reject configs whose name or required source fields are empty. The
/// serialized form is the instance-creation document understood by the
/// runtime API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "UnvalidatedConfig")]
pub struct InstanceConfig {
    pub name: InstanceName,
    pub source: InstanceSource,
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    /// Cloud instance type (e.g. `t2.micro`) emulated through resource limits.
    #[serde(rename = "instance_type", skip_serializing_if = "Option::is_none")]
    pub instance_type_alias: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stateful: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UnvalidatedConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    source: InstanceSource,
    #[serde(rename = "type", default)]
    instance_type: InstanceType,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    config: BTreeMap<String, String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    devices: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    ephemeral: Option<bool>,
    #[serde(rename = "instance_type", default)]
    instance_type_alias: Option<String>,
    #[serde(default)]
    profiles: Vec<String>,
    #[serde(default)]
    restore: Option<String>,
    #[serde(default)]
    stateful: Option<bool>,
}

impl TryFrom<UnvalidatedConfig> for InstanceConfig {
    type Error = ConfigError;

    fn try_from(raw: UnvalidatedConfig) -> Result<Self, Self::Error> {
        let mut config = Self::new(raw.name, raw.source)?;
        config.instance_type = raw.instance_type;
        config.architecture = raw.architecture;
        config.config = raw.config;
        config.description = raw.description;
        config.devices = raw.devices;
        config.ephemeral = raw.ephemeral;
        config.instance_type_alias = raw.instance_type_alias;
        config.profiles = raw.profiles;
        config.restore = raw.restore;
        config.stateful = raw.stateful;
        Ok(config)
    }
}

impl InstanceConfig {
    /// Create a container config, rejecting empty required values.
    pub fn new(name: impl Into<String>, source: InstanceSource) -> Result<Self, ConfigError> {
        let name: String = name.into();
        let mut missing = Vec::new();
        if name.trim().is_empty() {
            missing.push("name");
        }
        missing.extend(source.missing_fields());
        if !missing.is_empty() {
            return Err(ConfigError::Invalid { name, missing });
        }

        Ok(Self {
            name: InstanceName::new(name),
            source,
            instance_type: InstanceType::Container,
            architecture: None,
            config: BTreeMap::new(),
            description: None,
            devices: BTreeMap::new(),
            ephemeral: None,
            instance_type_alias: None,
            profiles: Vec::new(),
            restore: None,
            stateful: None,
        })
    }

    #[must_use]
    pub fn with_type(mut self, instance_type: InstanceType) -> Self {
        self.instance_type = instance_type;
        self
    }

    #[must_use]
    pub fn with_profiles(mut self, profiles: Vec<String>) -> Self {
        self.profiles = profiles;
        self
    }

    /// A copy of this template renamed for a concrete instance.
    #[must_use]
    pub fn for_instance(&self, name: &InstanceName) -> Self {
        let mut config = self.clone();
        config.name = name.clone();
        config
    }

    /// Render the instance-creation document sent to the runtime.
    pub fn to_api_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
