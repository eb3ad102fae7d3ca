use crate::CoreError;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Where an instance is in the orchestrator's view of its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Absent,
    Building,
    Running,
    Provisioned,
    Hooked,
    Executing,
    TearingDown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Building => "building",
            Self::Running => "running",
            Self::Provisioned => "provisioned",
            Self::Hooked => "hooked",
            Self::Executing => "executing",
            Self::TearingDown => "tearing-down",
        })
    }
}

pub fn validate_transition(
    instance: &str,
    from: InstanceState,
    to: InstanceState,
) -> Result<(), CoreError> {
    use InstanceState::{Absent, Building, Executing, Hooked, Provisioned, Running, TearingDown};

    let valid = matches!(
        (from, to),
        (Absent, Building)
            | (Building, Running)
            | (Running, Provisioned | Hooked)
            | (Provisioned, Hooked)
            | (Running | Provisioned | Hooked, Executing)
            | (Executing, Running)
            | (Running | Provisioned | Hooked | Executing, TearingDown)
            | (TearingDown, Absent)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            instance: instance.to_owned(),
            from,
            to,
        })
    }
}

/// Tracks one instance through its states within a single operation.
#[derive(Debug)]
pub struct Tracker<'a> {
    instance: &'a str,
    state: InstanceState,
}

impl<'a> Tracker<'a> {
    pub fn new(instance: &'a str, state: InstanceState) -> Self {
        Self { instance, state }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn advance(&mut self, to: InstanceState) -> Result<(), CoreError> {
        validate_transition(self.instance, self.state, to)?;
        debug!("{}: {} -> {to}", self.instance, self.state);
        self.state = to;
        Ok(())
    }
}
