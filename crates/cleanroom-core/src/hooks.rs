use crate::CoreError;
use cleanroom_inject::{Artifact, Package};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookClass {
    Start,
    Stop,
}

impl fmt::Display for HookClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Setup run after an instance comes up: packages are installed, then
/// artifacts are uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartEnvHook {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub upload: Vec<Artifact>,
}

/// Teardown run before an instance is removed: artifacts are downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopEnvHook {
    pub name: String,
    #[serde(default)]
    pub download: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    Start(StartEnvHook),
    Stop(StopEnvHook),
}

impl Hook {
    pub fn name(&self) -> &str {
        match self {
            Self::Start(h) => &h.name,
            Self::Stop(h) => &h.name,
        }
    }

    pub fn class(&self) -> HookClass {
        match self {
            Self::Start(_) => HookClass::Start,
            Self::Stop(_) => HookClass::Stop,
        }
    }
}

impl From<StartEnvHook> for Hook {
    fn from(h: StartEnvHook) -> Self {
        Self::Start(h)
    }
}

impl From<StopEnvHook> for Hook {
    fn from(h: StopEnvHook) -> Self {
        Self::Stop(h)
    }
}

/// Ordered start and stop hooks.
///
/// A name may be used once per class. Hooks run in registration order.
#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    start: Vec<StartEnvHook>,
    stop: Vec<StopEnvHook>,
    members: BTreeSet<(String, HookClass)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hooks` in order. If any of them collides with a registered
    /// hook, or with an earlier one in the same batch, nothing is registered.
    pub fn register<I>(&mut self, hooks: I) -> Result<(), CoreError>
    where
        I: IntoIterator,
        I::Item: Into<Hook>,
    {
        let hooks: Vec<Hook> = hooks.into_iter().map(Into::into).collect();
        let mut pending = BTreeSet::new();
        for hook in &hooks {
            let key = (hook.name().to_owned(), hook.class());
            if self.members.contains(&key) || !pending.insert(key) {
                return Err(CoreError::DuplicateHook {
                    name: hook.name().to_owned(),
                    classification: hook.class(),
                });
            }
        }

        for hook in hooks {
            debug!("registering {} hook '{}'", hook.class(), hook.name());
            self.members.insert((hook.name().to_owned(), hook.class()));
            match hook {
                Hook::Start(h) => self.start.push(h),
                Hook::Stop(h) => self.stop.push(h),
            }
        }
        Ok(())
    }

    /// Remove the hook called `name`, searching start hooks before stop hooks.
    pub fn unregister(&mut self, name: &str) -> Result<HookClass, CoreError> {
        if let Some(pos) = self.start.iter().position(|h| h.name == name) {
            self.start.remove(pos);
            self.members.remove(&(name.to_owned(), HookClass::Start));
            return Ok(HookClass::Start);
        }
        if let Some(pos) = self.stop.iter().position(|h| h.name == name) {
            self.stop.remove(pos);
            self.members.remove(&(name.to_owned(), HookClass::Stop));
            return Ok(HookClass::Stop);
        }
        Err(CoreError::HookNotFound(name.to_owned()))
    }

    pub fn start_hooks(&self) -> Vec<StartEnvHook> {
        self.start.clone()
    }

    pub fn stop_hooks(&self) -> Vec<StopEnvHook> {
        self.stop.clone()
    }

    pub fn contains(&self, name: &str, class: HookClass) -> bool {
        self.members.contains(&(name.to_owned(), class))
    }

    pub fn len(&self) -> usize {
        self.start.len() + self.stop.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.start.clear();
        self.stop.clear();
        self.members.clear();
    }
}
