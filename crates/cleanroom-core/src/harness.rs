use crate::orchestrator::{DeployRequest, Orchestrator};
use crate::remote;
use crate::CoreError;
use cleanroom_runtime::ExecResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// How a payload is spread over instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Build one instance per image, one after the other.
    SerialFresh,
    /// Reuse named instances, one after the other.
    SerialTarget,
    ParallelFresh,
    ParallelTarget,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::SerialFresh,
        Strategy::SerialTarget,
        Strategy::ParallelFresh,
        Strategy::ParallelTarget,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::SerialFresh => "serial",
            Strategy::SerialTarget => "serial-target",
            Strategy::ParallelFresh => "parallel",
            Strategy::ParallelTarget => "parallel-target",
        }
    }

    pub fn is_fresh(self) -> bool {
        matches!(self, Strategy::SerialFresh | Strategy::ParallelFresh)
    }

    pub fn is_parallel(self) -> bool {
        matches!(self, Strategy::ParallelFresh | Strategy::ParallelTarget)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serial" | "serial-fresh" => Ok(Strategy::SerialFresh),
            "serial-target" => Ok(Strategy::SerialTarget),
            "parallel" | "parallel-fresh" => Ok(Strategy::ParallelFresh),
            "parallel-target" => Ok(Strategy::ParallelTarget),
            other => {
                let valid: Vec<&str> = Strategy::ALL.iter().map(|s| s.as_str()).collect();
                Err(CoreError::Configuration(format!(
                    "unknown strategy '{other}', expected one of: {}",
                    valid.join(", ")
                )))
            }
        }
    }
}

/// A named unit of work run inside each instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub name: String,
    pub source: String,
    /// Invocation appended after `source`, usually a call of a function it defines.
    pub entry: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

fn default_interpreter() -> String {
    "/bin/sh".to_owned()
}

impl Payload {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            entry: entry.into(),
            interpreter: default_interpreter(),
        }
    }

    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn render_testlet(&self) -> String {
        format!("#!{}\n{}\n{}\n", self.interpreter, self.source, self.entry)
    }

    /// Instance name used by the fresh strategies.
    pub fn instance_name(&self, image: &str) -> String {
        format!("{}-{image}", self.name)
    }
}

/// Runs a [`Payload`] with one of the four strategies.
pub struct Harness<'a> {
    orchestrator: &'a mut Orchestrator,
    payload: Payload,
    preserve: bool,
    request: DeployRequest,
}

impl<'a> Harness<'a> {
    pub fn new(orchestrator: &'a mut Orchestrator, payload: Payload) -> Self {
        Self {
            orchestrator,
            payload,
            preserve: false,
            request: DeployRequest::default(),
        }
    }

    /// Keep fresh instances after the run, including after a failure. Stop
    /// hooks still run when the payload completes.
    #[must_use]
    pub fn preserve(mut self, preserve: bool) -> Self {
        self.preserve = preserve;
        self
    }

    #[must_use]
    pub fn with_request(mut self, request: DeployRequest) -> Self {
        self.request = request;
        self
    }

    /// Run the payload. `names` are image config names for the fresh
    /// strategies and instance names for the target strategies. Results are
    /// keyed by instance name.
    pub fn run(
        &mut self,
        strategy: Strategy,
        names: &[String],
    ) -> Result<BTreeMap<String, ExecResult>, CoreError> {
        info!("running payload '{}' with {strategy} strategy", self.payload.name);
        match strategy {
            Strategy::SerialFresh => {
                let mut results = BTreeMap::new();
                for image in names {
                    let plan = [(self.payload.instance_name(image), image.clone())];
                    results.append(&mut self.fresh(&plan)?);
                }
                Ok(results)
            }
            Strategy::ParallelFresh => {
                let plan: Vec<(String, String)> = names
                    .iter()
                    .map(|image| (self.payload.instance_name(image), image.clone()))
                    .collect();
                self.fresh(&plan)
            }
            Strategy::SerialTarget => {
                let mut results = BTreeMap::new();
                for target in names {
                    results.append(&mut self.target(std::slice::from_ref(target))?);
                }
                Ok(results)
            }
            Strategy::ParallelTarget => self.target(names),
        }
    }

    /// Deploy, run and tear down. Unless preserving, a failure anywhere
    /// discards the plan's instances before the error is returned.
    fn fresh(
        &mut self,
        plan: &[(String, String)],
    ) -> Result<BTreeMap<String, ExecResult>, CoreError> {
        let err = match self.fresh_run(plan) {
            Ok(results) => return Ok(results),
            Err(e) => e,
        };
        if !self.preserve {
            let names: Vec<String> = plan.iter().map(|(name, _)| name.clone()).collect();
            if let Err(cleanup) = self.orchestrator.discard(&names) {
                warn!("cleanup after failed run: {cleanup}");
            }
        }
        Err(err)
    }

    fn fresh_run(
        &mut self,
        plan: &[(String, String)],
    ) -> Result<BTreeMap<String, ExecResult>, CoreError> {
        let targets = self.orchestrator.deploy_plan(plan, &self.request)?;
        let targets: Vec<String> = targets.into_iter().collect();
        let results = self.execute(&targets)?;
        if self.preserve {
            self.orchestrator.run_stop_hooks(&targets)?;
        } else {
            self.orchestrator.remove(&targets)?;
        }
        Ok(results)
    }

    /// Run on instances that already exist. Hooks are not run and nothing
    /// is deployed or torn down.
    fn target(&mut self, targets: &[String]) -> Result<BTreeMap<String, ExecResult>, CoreError> {
        for target in targets {
            if !self.orchestrator.exists(target)? {
                return Err(CoreError::InstanceNotFound(target.clone()));
            }
        }
        self.execute(targets)
    }

    fn execute(&mut self, targets: &[String]) -> Result<BTreeMap<String, ExecResult>, CoreError> {
        self.orchestrator
            .upload_script(targets, remote::TESTLET, &self.payload.render_testlet())?;
        self.orchestrator
            .execute(targets, &[remote::TESTLET.to_owned()])
    }
}
