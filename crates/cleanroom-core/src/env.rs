use cleanroom_inject::{EnvContribution, EnvValue};
use std::collections::BTreeMap;

/// Separator used when a list-valued variable is rendered.
pub const PATH_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

/// Environment variables handed to every command run in an instance.
///
/// List values accumulate: adding a list appends each item not already
/// stored, so re-applying a contribution changes nothing. Adding a scalar
/// replaces the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvStore {
    vars: BTreeMap<String, EnvValue>,
}

impl EnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: EnvValue) {
        let key = key.into();
        let merged = match (self.vars.remove(&key), value) {
            (Some(EnvValue::List(old)), EnvValue::List(new)) => {
                EnvValue::List(append_new(old, new))
            }
            (Some(EnvValue::Scalar(old)), EnvValue::List(new)) => {
                EnvValue::List(append_new(vec![old], new))
            }
            (None, EnvValue::List(new)) => EnvValue::List(append_new(Vec::new(), new)),
            (_, value) => value,
        };
        self.vars.insert(key, merged);
    }

    pub fn merge(&mut self, contribution: &EnvContribution) {
        for (key, value) in contribution {
            self.add(key.clone(), value.clone());
        }
    }

    /// The rendered value; lists are joined with [`PATH_SEPARATOR`].
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).map(render)
    }

    pub fn remove(&mut self, key: &str) -> Option<EnvValue> {
        self.vars.remove(key)
    }

    /// Every variable rendered, ready to pass as a process environment.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), render(v)))
            .collect()
    }

    pub fn reset(&mut self) {
        self.vars.clear();
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn append_new(mut items: Vec<String>, new: Vec<String>) -> Vec<String> {
    for item in new {
        if !items.contains(&item) {
            items.push(item);
        }
    }
    items
}

fn render(value: &EnvValue) -> String {
    match value {
        EnvValue::Scalar(s) => s.clone(),
        EnvValue::List(items) => items.join(&PATH_SEPARATOR.to_string()),
    }
}
