use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_IMAGE_SERVER: &str = "https://images.linuxcontainers.org";

/// Where an instance's root filesystem comes from.
///
/// The five required fields describe a plain image pull. The optional fields
/// carry migration and copy parameters and are passed through to the runtime
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InstanceSource {
    #[serde(rename = "type", default)]
    pub source_type: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_inconsistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl InstanceSource {
    /// A `simplestreams` image pulled from the public image server.
    pub fn image(alias: impl Into<String>) -> Self {
        Self {
            source_type: "image".to_owned(),
            mode: "pull".to_owned(),
            server: DEFAULT_IMAGE_SERVER.to_owned(),
            protocol: "simplestreams".to_owned(),
            alias: alias.into(),
            ..Self::default()
        }
    }

    /// Names of required fields that are empty.
    pub(crate) fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (field, value) in [
            ("source.type", &self.source_type),
            ("source.mode", &self.mode),
            ("source.protocol", &self.protocol),
            ("source.alias", &self.alias),
        ] {
            if value.trim().is_empty() {
                missing.push(field);
            }
        }
        missing
    }
}

const DEFAULT_ALIASES: &[&str] = &[
    "almalinux/8/amd64",
    "almalinux/8/arm64",
    "almalinux/9/amd64",
    "almalinux/9/arm64",
    "archlinux/amd64",
    "archlinux/arm64",
    "centos/8-Stream/amd64",
    "centos/8-Stream/arm64",
    "centos/9-Stream/amd64",
    "centos/9-Stream/arm64",
    "debian/10/amd64",
    "debian/10/arm64",
    "debian/11/amd64",
    "debian/11/arm64",
    "debian/12/amd64",
    "debian/12/arm64",
    "fedora/35/amd64",
    "fedora/35/arm64",
    "fedora/36/amd64",
    "fedora/36/arm64",
    "fedora/37/amd64",
    "fedora/37/arm64",
    "rockylinux/8/amd64",
    "rockylinux/8/arm64",
    "rockylinux/9/amd64",
    "rockylinux/9/arm64",
    "ubuntu/jammy/amd64",
    "ubuntu/jammy/arm64",
    "ubuntu/focal/amd64",
    "ubuntu/focal/arm64",
    "ubuntu/18.04/amd64",
    "ubuntu/18.04/arm64",
];

/// Derive the registry name for an image alias, e.g.
/// `ubuntu/18.04/amd64` -> `ubuntu-18-04-amd64`.
pub fn config_name_for_alias(alias: &str) -> String {
    alias.replace(['/', '.', '_'], "-").to_lowercase()
}

/// Built-in image sources every `ConfigStore` is seeded with, keyed by
/// their derived config name.
pub fn default_sources() -> Vec<(String, InstanceSource)> {
    DEFAULT_ALIASES
        .iter()
        .map(|alias| (config_name_for_alias(alias), InstanceSource::image(*alias)))
        .collect()
}
