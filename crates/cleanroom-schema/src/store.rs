use crate::client::ClientConfig;
use crate::instance::InstanceConfig;
use crate::source::default_sources;
use crate::ConfigError;
use std::collections::{BTreeMap, BTreeSet};

/// Registry of instance templates plus the active runtime client config.
///
/// Seeded with the built-in image sources. Templates are keyed by config name;
/// `fetch` hands out copies so callers can rename them without touching the
/// shared template.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    configs: BTreeMap<String, InstanceConfig>,
    client: ClientConfig,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            configs: seeded_configs(),
            client: ClientConfig::default(),
        }
    }
}

fn seeded_configs() -> BTreeMap<String, InstanceConfig> {
    default_sources()
        .into_iter()
        .filter_map(|(name, source)| {
            InstanceConfig::new(name.clone(), source)
                .ok()
                .map(|config| (name, config))
        })
        .collect()
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register new templates. A name already stored, or repeated within
    /// `configs`, rejects the whole batch.
    pub fn add<I>(&mut self, configs: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = InstanceConfig>,
    {
        let configs: Vec<InstanceConfig> = configs.into_iter().collect();
        let mut pending = BTreeSet::new();
        for config in &configs {
            let name = config.name.as_str();
            if self.configs.contains_key(name) || !pending.insert(name) {
                return Err(ConfigError::Duplicate(name.to_owned()));
            }
        }
        for config in configs {
            self.configs.insert(config.name.to_string(), config);
        }
        Ok(())
    }

    /// Remove templates by name. Unknown names are ignored.
    pub fn remove<'a, I>(&mut self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            self.configs.remove(name);
        }
    }

    pub fn fetch(&self, name: &str) -> Result<InstanceConfig, ConfigError> {
        self.configs
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client
    }

    pub fn set_client_config(&mut self, client: ClientConfig) {
        self.client = client;
    }

    /// Restore the built-in templates and default client config.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
