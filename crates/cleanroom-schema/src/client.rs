use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Option keys accepted by [`ClientConfig::from_options`].
pub const CLIENT_OPTIONS: &[&str] = &[
    "endpoint",
    "version",
    "cert",
    "key",
    "verify",
    "timeout_secs",
    "project",
];

/// Connection parameters for the container runtime.
///
/// `endpoint` is either a configured remote name or a path to the runtime's
/// unix socket; `None` selects the local default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default = "default_verify")]
    pub verify: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub project: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            version: default_version(),
            cert: None,
            key: None,
            verify: default_verify(),
            timeout_secs: None,
            project: None,
        }
    }
}

fn default_version() -> String {
    "1.0".to_owned()
}

fn default_verify() -> bool {
    true
}

impl ClientConfig {
    /// Build a config from `key=value` style options, starting from defaults.
    pub fn from_options<'a, I>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            let invalid = || ConfigError::InvalidClientValue {
                key: key.to_owned(),
                value: value.to_owned(),
            };
            match key {
                "endpoint" => config.endpoint = Some(value.to_owned()),
                "version" => config.version = value.to_owned(),
                "cert" => config.cert = Some(PathBuf::from(value)),
                "key" => config.key = Some(PathBuf::from(value)),
                "verify" => config.verify = value.parse().map_err(|_| invalid())?,
                "timeout_secs" => config.timeout_secs = Some(value.parse().map_err(|_| invalid())?),
                "project" => config.project = Some(value.to_owned()),
                other => {
                    return Err(ConfigError::UnknownClientOption {
                        key: other.to_owned(),
                    })
                }
            }
        }
        Ok(config)
    }
}
