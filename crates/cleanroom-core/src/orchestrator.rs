use crate::env::EnvStore;
use crate::hooks::HookRegistry;
use crate::lifecycle::{InstanceState, Tracker};
use crate::pool::{thread_count, WorkerPool};
use crate::remote;
use crate::CoreError;
use cleanroom_inject::{
    Artifact, Direction, Directory, EnvContribution, File, Injectable, PackageSpec,
    SerializedPayload, AGENT_MISSING_EXIT_CODE, AGENT_PATH, INTEGRITY_EXIT_CODE,
};
use cleanroom_runtime::{
    run, ExecResult, InstanceStatus, RunOptions, RuntimeClient, RuntimeConnector,
};
use cleanroom_schema::{ClientConfig, ConfigStore, InstanceConfig, InstanceName};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The per-run registries the orchestrator reads from.
#[derive(Debug, Clone, Default)]
pub struct Registries {
    pub configs: ConfigStore,
    pub hooks: HookRegistry,
    pub env: EnvStore,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything between independent runs. Configs return to the
    /// built-in defaults.
    pub fn reset(&mut self) {
        self.configs.reset();
        self.hooks.reset();
        self.env.reset();
    }
}

/// Extra work done while bringing instances up.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    /// Shell script run once the instance is up, before start hooks.
    pub provision_script: Option<String>,
    /// Artifacts uploaded before the provision script.
    pub resources: Vec<Artifact>,
}

/// Ownership and permissions applied after a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub uid: Option<u32>,
    pub username: Option<String>,
    pub gid: Option<u32>,
    pub groupname: Option<String>,
    pub mode: Option<u32>,
}

impl TransferOptions {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.uid.is_some() && self.username.is_some() {
            return Err(CoreError::Configuration(
                "uid and username are mutually exclusive".to_owned(),
            ));
        }
        if self.gid.is_some() && self.groupname.is_some() {
            return Err(CoreError::Configuration(
                "gid and groupname are mutually exclusive".to_owned(),
            ));
        }
        Ok(())
    }

    /// `chown` argument: `owner`, `owner:group` or `:group`.
    fn owner_spec(&self) -> Option<String> {
        let owner = self
            .uid
            .map(|u| u.to_string())
            .or_else(|| self.username.clone());
        let group = self
            .gid
            .map(|g| g.to_string())
            .or_else(|| self.groupname.clone());
        match (owner, group) {
            (None, None) => None,
            (Some(o), None) => Some(o),
            (o, Some(g)) => Some(format!("{}:{g}", o.unwrap_or_default())),
        }
    }

    fn commands(&self, path: &str, recursive: bool) -> Vec<Vec<String>> {
        let mut commands = Vec::new();
        let build = |tool: &str, arg: String| {
            let mut cmd = vec![tool.to_owned()];
            if recursive {
                cmd.push("-R".to_owned());
            }
            cmd.push(arg);
            cmd.push(path.to_owned());
            cmd
        };
        if let Some(owner) = self.owner_spec() {
            commands.push(build("chown", owner));
        }
        if let Some(mode) = self.mode {
            commands.push(build("chmod", format!("{mode:o}")));
        }
        commands
    }
}

enum StartStep {
    Install {
        label: String,
        payload: SerializedPayload,
        contribution: Option<EnvContribution>,
    },
    Upload {
        label: String,
        payload: SerializedPayload,
    },
}

/// A start hook with every payload already serialized on the host.
struct PreparedStart {
    name: String,
    steps: Vec<StartStep>,
}

struct PreparedStop {
    name: String,
    downloads: Vec<Download>,
}

struct Download {
    label: String,
    expected: Artifact,
    payload: SerializedPayload,
}

/// Immutable snapshot handed to every worker of one fan-out.
struct WorkerContext<'a> {
    connector: &'a dyn RuntimeConnector,
    client: &'a ClientConfig,
    env: &'a EnvStore,
    start_hooks: &'a [PreparedStart],
    stop_hooks: &'a [PreparedStop],
    support: Option<&'a [u8]>,
}

/// What a worker reports back for one target.
struct Outcome<R> {
    name: String,
    created: bool,
    removed: bool,
    contributions: Vec<EnvContribution>,
    result: Result<R, CoreError>,
}

impl<R> Outcome<R> {
    fn new(name: &str, result: Result<R, CoreError>) -> Self {
        Self {
            name: name.to_owned(),
            created: false,
            removed: false,
            contributions: Vec::new(),
            result,
        }
    }
}

struct DeployItem {
    image: String,
    config: InstanceConfig,
}

/// Drives test instances on a container runtime.
///
/// Every operation that touches several targets fans out over the worker
/// pool; each worker opens its own runtime connection. Registries are only
/// mutated between fan-outs, on the calling thread.
pub struct Orchestrator {
    registries: Registries,
    connector: Arc<dyn RuntimeConnector>,
    pool: WorkerPool,
    created: BTreeSet<String>,
    support_binary: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(registries: Registries, connector: Arc<dyn RuntimeConnector>) -> Self {
        Self {
            registries,
            connector,
            pool: WorkerPool::new(thread_count(None)),
            created: BTreeSet::new(),
            support_binary: None,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.pool = WorkerPool::new(threads);
        self
    }

    /// Binary uploaded into new instances as the agent. It must answer
    /// `agent install|dump|load` and run on the instance's architecture.
    /// Without one, injection only works on instances that already carry an
    /// agent.
    pub fn with_support_binary(mut self, path: Option<PathBuf>) -> Self {
        self.support_binary = path;
        self
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn registries_mut(&mut self) -> &mut Registries {
        &mut self.registries
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// Instances created by this orchestrator and not yet removed.
    pub fn created(&self) -> impl Iterator<Item = &str> {
        self.created.iter().map(String::as_str)
    }

    fn connect(&self) -> Result<Box<dyn RuntimeClient>, CoreError> {
        Ok(self
            .connector
            .connect(self.registries.configs.client_config())?)
    }

    pub fn exists(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.connect()?.exists(name)?)
    }

    fn require_existing(&self, targets: &[String]) -> Result<(), CoreError> {
        let client = self.connect()?;
        for target in targets {
            if !client.exists(target)? {
                return Err(CoreError::InstanceNotFound(target.clone()));
            }
        }
        Ok(())
    }

    /// Bring `targets` up from the `image` config. See [`Orchestrator::deploy_plan`].
    pub fn deploy(
        &mut self,
        targets: &[String],
        image: &str,
        request: &DeployRequest,
    ) -> Result<BTreeSet<String>, CoreError> {
        let plan: Vec<(String, String)> = targets
            .iter()
            .map(|t| (t.clone(), image.to_owned()))
            .collect();
        self.deploy_plan(&plan, request)
    }

    /// Bring up each `(target, image)` pair.
    ///
    /// Absent instances are created and started and receive the agent binary;
    /// stopped ones are started; running ones are left alone. Resources, the
    /// provision script and start hooks then run on every target. Targets
    /// that came up stay up when others fail.
    pub fn deploy_plan(
        &mut self,
        plan: &[(String, String)],
        request: &DeployRequest,
    ) -> Result<BTreeSet<String>, CoreError> {
        let items = plan
            .iter()
            .map(|(target, image)| {
                let config = self
                    .registries
                    .configs
                    .fetch(image)?
                    .for_instance(&InstanceName::new(target.as_str()));
                Ok(DeployItem {
                    image: image.clone(),
                    config,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        let resources = request
            .resources
            .iter()
            .map(|artifact| {
                let mut artifact = artifact.clone();
                artifact.load()?;
                let label = format!("resource {}", artifact.src().display());
                Ok((label, artifact.serialize_payload(Direction::Push)?))
            })
            .collect::<Result<Vec<_>, CoreError>>()?;
        let start_hooks = self.prepare_start_hooks()?;
        let support = match &self.support_binary {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };
        let provision = request.provision_script.as_deref();

        info!("deploying {} instance(s)", items.len());
        let ctx = WorkerContext {
            connector: self.connector.as_ref(),
            client: self.registries.configs.client_config(),
            env: &self.registries.env,
            start_hooks: &start_hooks,
            stop_hooks: &[],
            support: support.as_deref(),
        };
        let outcomes = self.pool.map(items, |item| {
            let name = item.config.name.to_string();
            let mut created = false;
            let mut contributions = Vec::new();
            let result =
                ctx.deploy_one(&item, &resources, provision, &mut created, &mut contributions);
            let mut outcome = Outcome::new(&name, result);
            outcome.created = created;
            outcome.contributions = contributions;
            outcome
        });
        Ok(self.absorb(outcomes)?.into_keys().collect())
    }

    /// Run `command` in every target with the current environment.
    ///
    /// Every target must exist before anything is executed anywhere. A
    /// non-zero exit status is returned in the result, not raised.
    pub fn execute(
        &mut self,
        targets: &[String],
        command: &[String],
    ) -> Result<BTreeMap<String, ExecResult>, CoreError> {
        self.require_existing(targets)?;
        info!("executing `{}` on {}", command.join(" "), targets.join(", "));
        let env = self.registries.env.dump();
        let ctx = self.context(&[], &[]);
        let outcomes = self.pool.map(targets.to_vec(), |target| {
            let result = ctx.connect().and_then(|client| {
                let mut tracker = Tracker::new(&target, InstanceState::Running);
                tracker.advance(InstanceState::Executing)?;
                let result = client.execute(&target, command, &env)?;
                debug!("{target}: exit code {}", result.exit_code);
                tracker.advance(InstanceState::Running)?;
                Ok(result)
            });
            Outcome::new(&target, result)
        });
        self.absorb(outcomes)
    }

    /// Upload `content` to `path` in every target and make it executable.
    pub fn upload_script(
        &mut self,
        targets: &[String],
        path: &str,
        content: &str,
    ) -> Result<(), CoreError> {
        let ctx = self.context(&[], &[]);
        let outcomes = self.pool.map(targets.to_vec(), |target| {
            let result = ctx.connect().and_then(|client| {
                client.put_file(&target, path, content.as_bytes())?;
                remote_checked(
                    client.as_ref(),
                    &target,
                    &["chmod".to_owned(), "0755".to_owned(), path.to_owned()],
                    &BTreeMap::new(),
                    "chmod",
                )?;
                Ok(())
            });
            Outcome::new(&target, result)
        });
        self.absorb(outcomes).map(|_| ())
    }

    /// Copy a host artifact into `target`, then apply ownership and mode.
    pub fn push(
        &mut self,
        target: &str,
        artifact: &Artifact,
        options: &TransferOptions,
    ) -> Result<(), CoreError> {
        options.validate()?;
        let client = self.connect()?;
        if !client.exists(target)? {
            return Err(CoreError::InstanceNotFound(target.to_owned()));
        }

        let mut artifact = artifact.clone();
        artifact.load()?;
        info!("pushing {} to {target}:{}", artifact.src().display(), artifact.dest().display());
        let payload = artifact.serialize_payload(Direction::Push)?;
        let env = self.registries.env.dump();
        inject(client.as_ref(), target, remote::PUSH_DUMP, &payload, &env, "push")?;

        let dest = artifact.dest().to_string_lossy();
        for cmd in options.commands(&dest, artifact.is_directory()) {
            remote_checked(client.as_ref(), target, &cmd, &env, &cmd[0])?;
        }
        Ok(())
    }

    /// Copy `src` out of `target` onto the host at `dest`, then apply
    /// ownership and mode locally. Whether `src` is a file or a directory is
    /// decided inside the instance.
    pub fn pull(
        &mut self,
        target: &str,
        src: &Path,
        dest: &Path,
        overwrite: bool,
        options: &TransferOptions,
    ) -> Result<(), CoreError> {
        options.validate()?;
        let client = self.connect()?;
        if !client.exists(target)? {
            return Err(CoreError::InstanceNotFound(target.to_owned()));
        }

        let env = self.registries.env.dump();
        let artifact = remote_artifact(client.as_ref(), target, src, dest, overwrite, &env)?;
        info!("pulling {target}:{} to {}", src.display(), dest.display());
        let payload = artifact.serialize_payload(Direction::Pull)?;
        let reply = inject(client.as_ref(), target, remote::PULL_LOAD, &payload, &env, "pull")?;
        let pulled = read_reply(target, &reply.stdout, &artifact)?;
        pulled.dump()?;

        let dest = dest.to_string_lossy();
        for cmd in options.commands(&dest, pulled.is_directory()) {
            run(cmd.as_slice(), &RunOptions::checked())?;
        }
        Ok(())
    }

    /// Run start hooks on existing targets.
    pub fn run_start_hooks(&mut self, targets: &[String]) -> Result<(), CoreError> {
        self.require_existing(targets)?;
        let start_hooks = self.prepare_start_hooks()?;
        let ctx = self.context(&start_hooks, &[]);
        let outcomes = self.pool.map(targets.to_vec(), |target| {
            let mut contributions = Vec::new();
            let result = ctx.connect().and_then(|client| {
                let mut env = ctx.env.clone();
                ctx.start_hooks(client.as_ref(), &target, &mut env, &mut contributions)
            });
            let mut outcome = Outcome::new(&target, result);
            outcome.contributions = contributions;
            outcome
        });
        self.absorb(outcomes).map(|_| ())
    }

    /// Run stop hooks on existing targets without removing them.
    pub fn run_stop_hooks(&mut self, targets: &[String]) -> Result<(), CoreError> {
        self.require_existing(targets)?;
        let stop_hooks = self.prepare_stop_hooks()?;
        let ctx = self.context(&[], &stop_hooks);
        let outcomes = self.pool.map(targets.to_vec(), |target| {
            let result = ctx
                .connect()
                .and_then(|client| ctx.stop_hooks(client.as_ref(), &target));
            Outcome::new(&target, result)
        });
        self.absorb(outcomes).map(|_| ())
    }

    /// Stop every running target and start it again.
    pub fn restart(&mut self, targets: &[String]) -> Result<(), CoreError> {
        self.require_existing(targets)?;
        let ctx = self.context(&[], &[]);
        let outcomes = self.pool.map(targets.to_vec(), |target| {
            let result = ctx.connect().and_then(|client| {
                debug!("restarting {target}");
                if client.status(&target)? == InstanceStatus::Running {
                    client.stop(&target)?;
                }
                client.start(&target)?;
                Ok(())
            });
            Outcome::new(&target, result)
        });
        self.absorb(outcomes).map(|_| ())
    }

    /// Run stop hooks, then stop and delete each target.
    pub fn remove(&mut self, targets: &[String]) -> Result<(), CoreError> {
        self.require_existing(targets)?;
        let stop_hooks = self.prepare_stop_hooks()?;
        self.teardown(targets, &stop_hooks)
    }

    /// Remove every instance this orchestrator created. Stop hooks are not run.
    ///
    /// Instances whose teardown fails stay tracked, so a later call retries them.
    pub fn destroy(&mut self) -> Result<Vec<String>, CoreError> {
        let created: Vec<String> = self.created.iter().cloned().collect();
        info!("destroying {} instance(s)", created.len());
        self.discard(&created)
    }

    /// Stop and delete whichever of `targets` still exist, without stop
    /// hooks. Returns the targets that were torn down.
    pub fn discard(&mut self, targets: &[String]) -> Result<Vec<String>, CoreError> {
        let client = self.connect()?;
        let mut present = Vec::new();
        for name in targets {
            if client.exists(name)? {
                present.push(name.clone());
            } else {
                debug!("{name} is already gone");
                self.created.remove(name);
            }
        }
        self.teardown(&present, &[])?;
        Ok(present)
    }

    fn teardown(
        &mut self,
        targets: &[String],
        stop_hooks: &[PreparedStop],
    ) -> Result<(), CoreError> {
        let ctx = self.context(&[], stop_hooks);
        let outcomes = self.pool.map(targets.to_vec(), |target| {
            let result = ctx.connect().and_then(|client| {
                let mut tracker = Tracker::new(&target, InstanceState::Running);
                tracker.advance(InstanceState::TearingDown)?;
                ctx.stop_hooks(client.as_ref(), &target)?;
                if client.status(&target)? == InstanceStatus::Running {
                    client.stop(&target)?;
                }
                client.delete(&target)?;
                tracker.advance(InstanceState::Absent)?;
                info!("removed {target}");
                Ok(())
            });
            let mut outcome = Outcome::new(&target, result);
            outcome.removed = outcome.result.is_ok();
            outcome
        });
        self.absorb(outcomes).map(|_| ())
    }

    /// First global address of the requested family, or `None` if the
    /// instance has not been assigned one.
    pub fn get_public_address(
        &self,
        target: &str,
        ipv6: bool,
    ) -> Result<Option<IpAddr>, CoreError> {
        let client = self.connect()?;
        if !client.exists(target)? {
            return Err(CoreError::InstanceNotFound(target.to_owned()));
        }
        let address = client
            .addresses(target)?
            .into_iter()
            .find(|addr| addr.is_ipv6() == ipv6);
        if address.is_none() {
            debug!("{target} has no {} address yet", if ipv6 { "IPv6" } else { "IPv4" });
        }
        Ok(address)
    }

    fn context<'a>(
        &'a self,
        start_hooks: &'a [PreparedStart],
        stop_hooks: &'a [PreparedStop],
    ) -> WorkerContext<'a> {
        WorkerContext {
            connector: self.connector.as_ref(),
            client: self.registries.configs.client_config(),
            env: &self.registries.env,
            start_hooks,
            stop_hooks,
            support: None,
        }
    }

    fn prepare_start_hooks(&self) -> Result<Vec<PreparedStart>, CoreError> {
        self.registries
            .hooks
            .start_hooks()
            .into_iter()
            .map(|hook| {
                let mut steps = Vec::new();
                for mut package in hook.packages {
                    package.prepare()?;
                    steps.push(StartStep::Install {
                        label: format!("{} package in hook '{}'", package.kind(), hook.name),
                        payload: package.serialize_payload(Direction::Push)?,
                        contribution: package
                            .emits_env()
                            .then(|| package.env_contribution())
                            .flatten(),
                    });
                }
                for mut artifact in hook.upload {
                    artifact.load()?;
                    steps.push(StartStep::Upload {
                        label: format!(
                            "upload of {} in hook '{}'",
                            artifact.src().display(),
                            hook.name
                        ),
                        payload: artifact.serialize_payload(Direction::Push)?,
                    });
                }
                Ok(PreparedStart {
                    name: hook.name,
                    steps,
                })
            })
            .collect()
    }

    fn prepare_stop_hooks(&self) -> Result<Vec<PreparedStop>, CoreError> {
        self.registries
            .hooks
            .stop_hooks()
            .into_iter()
            .map(|hook| {
                let downloads = hook
                    .download
                    .iter()
                    .map(|artifact| {
                        let label = format!(
                            "download of {} in hook '{}'",
                            artifact.src().display(),
                            hook.name
                        );
                        Ok(Download {
                            label,
                            payload: artifact.serialize_payload(Direction::Pull)?,
                            expected: artifact.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, CoreError>>()?;
                Ok(PreparedStop {
                    name: hook.name,
                    downloads,
                })
            })
            .collect()
    }

    /// Fold worker outcomes back into orchestrator state.
    ///
    /// A single failed target returns its own error; several targets with any
    /// failure return `PartialFailure`.
    fn absorb<R>(
        &mut self,
        outcomes: Vec<Outcome<R>>,
    ) -> Result<BTreeMap<String, R>, CoreError> {
        let total = outcomes.len();
        let mut results = BTreeMap::new();
        let mut failures = BTreeMap::new();

        for outcome in outcomes {
            if outcome.created {
                self.created.insert(outcome.name.clone());
            }
            if outcome.removed {
                self.created.remove(&outcome.name);
            }
            for contribution in &outcome.contributions {
                self.registries.env.merge(contribution);
            }
            match outcome.result {
                Ok(value) => {
                    results.insert(outcome.name, value);
                }
                Err(e) => {
                    warn!("{}: {e}", outcome.name);
                    failures.insert(outcome.name, e);
                }
            }
        }

        if failures.is_empty() {
            return Ok(results);
        }
        if total == 1 {
            if let Some((_, e)) = failures.pop_first() {
                return Err(e);
            }
        }
        Err(CoreError::PartialFailure {
            succeeded: results.into_keys().collect(),
            failures: failures
                .into_iter()
                .map(|(name, e)| (name, e.to_string()))
                .collect(),
        })
    }
}

impl WorkerContext<'_> {
    fn connect(&self) -> Result<Box<dyn RuntimeClient>, CoreError> {
        Ok(self.connector.connect(self.client)?)
    }

    fn deploy_one(
        &self,
        item: &DeployItem,
        resources: &[(String, SerializedPayload)],
        provision: Option<&str>,
        created: &mut bool,
        contributions: &mut Vec<EnvContribution>,
    ) -> Result<(), CoreError> {
        let client = self.connect()?;
        let client = client.as_ref();
        let name = item.config.name.as_str();

        let mut tracker = if client.exists(name)? {
            match client.status(name)? {
                InstanceStatus::Running => debug!("{name} is already running"),
                status => {
                    info!("starting existing instance {name} ({status:?})");
                    client.start(name)?;
                }
            }
            Tracker::new(name, InstanceState::Running)
        } else {
            let mut tracker = Tracker::new(name, InstanceState::Absent);
            tracker.advance(InstanceState::Building)?;
            info!("creating {name} from {}", item.image);
            client.create(&item.config)?;
            *created = true;
            client.start(name)?;
            tracker.advance(InstanceState::Running)?;
            self.install_support(client, name)?;
            tracker
        };

        let mut env = self.env.clone();
        for (label, payload) in resources {
            inject(client, name, remote::UPLOAD_DUMP, payload, &env.dump(), label)?;
        }

        if let Some(script) = provision {
            info!("provisioning {name}");
            client.put_file(name, remote::PROVISION, script.as_bytes())?;
            remote_checked(
                client,
                name,
                &["sh".to_owned(), remote::PROVISION.to_owned()],
                &env.dump(),
                "provision script",
            )?;
            tracker.advance(InstanceState::Provisioned)?;
        }

        self.start_hooks(client, name, &mut env, contributions)?;
        tracker.advance(InstanceState::Hooked)?;
        Ok(())
    }

    fn install_support(&self, client: &dyn RuntimeClient, name: &str) -> Result<(), CoreError> {
        let Some(binary) = self.support else {
            debug!("no support binary configured; skipping agent upload to {name}");
            return Ok(());
        };
        debug!("uploading agent to {name}:{}", remote::AGENT_PATH);
        client.put_file(name, remote::AGENT_PATH, binary)?;
        remote_checked(
            client,
            name,
            &["chmod".to_owned(), "0755".to_owned(), remote::AGENT_PATH.to_owned()],
            &BTreeMap::new(),
            "agent upload",
        )?;
        Ok(())
    }

    fn start_hooks(
        &self,
        client: &dyn RuntimeClient,
        name: &str,
        env: &mut EnvStore,
        contributions: &mut Vec<EnvContribution>,
    ) -> Result<(), CoreError> {
        for hook in self.start_hooks {
            info!("running start hook '{}' on {name}", hook.name);
            for step in &hook.steps {
                match step {
                    StartStep::Install {
                        label,
                        payload,
                        contribution,
                    } => {
                        let vars = env.dump();
                        inject(client, name, remote::PACKAGE_INSTALL, payload, &vars, label)?;
                        if let Some(contribution) = contribution {
                            env.merge(contribution);
                            contributions.push(contribution.clone());
                        }
                    }
                    StartStep::Upload { label, payload } => {
                        inject(client, name, remote::UPLOAD_DUMP, payload, &env.dump(), label)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn stop_hooks(&self, client: &dyn RuntimeClient, name: &str) -> Result<(), CoreError> {
        let env = self.env.dump();
        for hook in self.stop_hooks {
            info!("running stop hook '{}' on {name}", hook.name);
            for download in &hook.downloads {
                let reply = inject(
                    client,
                    name,
                    remote::DOWNLOAD_LOAD,
                    &download.payload,
                    &env,
                    &download.label,
                )?;
                read_reply(name, &reply.stdout, &download.expected)?.dump()?;
            }
        }
        Ok(())
    }
}

/// Upload a bootstrap to `path` and run it.
fn inject(
    client: &dyn RuntimeClient,
    instance: &str,
    path: &str,
    payload: &SerializedPayload,
    env: &BTreeMap<String, String>,
    stage: &str,
) -> Result<ExecResult, CoreError> {
    client.put_file(instance, path, payload.bootstrap.as_bytes())?;
    remote_checked(
        client,
        instance,
        &["sh".to_owned(), path.to_owned()],
        env,
        stage,
    )
}

fn remote_checked(
    client: &dyn RuntimeClient,
    instance: &str,
    argv: &[String],
    env: &BTreeMap<String, String>,
    stage: &str,
) -> Result<ExecResult, CoreError> {
    let result = client.execute(instance, argv, env)?;
    if result.success() {
        return Ok(result);
    }
    let stage = match result.exit_code {
        INTEGRITY_EXIT_CODE => format!("{stage} (payload digest mismatch)"),
        AGENT_MISSING_EXIT_CODE => format!("{stage} (no agent installed at {AGENT_PATH})"),
        _ => stage.to_owned(),
    };
    Err(CoreError::RemoteCommand {
        instance: instance.to_owned(),
        stage,
        code: result.exit_code,
        stderr: result.stderr.trim().to_owned(),
    })
}

/// Ask the instance whether `src` is a file or a directory.
fn remote_artifact(
    client: &dyn RuntimeClient,
    instance: &str,
    src: &Path,
    dest: &Path,
    overwrite: bool,
    env: &BTreeMap<String, String>,
) -> Result<Artifact, CoreError> {
    let path = src.to_string_lossy().into_owned();
    let test = |flag: &str| -> Result<bool, CoreError> {
        let argv = ["test".to_owned(), flag.to_owned(), path.clone()];
        Ok(client.execute(instance, &argv, env)?.success())
    };
    if test("-f")? {
        Ok(File::new(src, dest, overwrite).into())
    } else if test("-d")? {
        Ok(Directory::new(src, dest, overwrite).into())
    } else {
        Err(CoreError::RemotePathNotFound {
            instance: instance.to_owned(),
            path,
        })
    }
}

/// Decode the payload the agent prints on stdout after `load`. The reply
/// must describe the transfer that was asked for.
fn read_reply(instance: &str, stdout: &str, expected: &Artifact) -> Result<Artifact, CoreError> {
    let unexpected = |detail: String| CoreError::UnexpectedReply {
        instance: instance.to_owned(),
        detail,
    };
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| unexpected("no payload on stdout".to_owned()))?;
    let reply: SerializedPayload = serde_json::from_str(line)?;
    let artifact = Artifact::deserialize_payload(&reply.checksum, &reply.encoded)?;
    if !artifact.same_transfer(expected) {
        return Err(unexpected(format!(
            "asked for {} -> {}, got {} -> {}",
            expected.src().display(),
            expected.dest().display(),
            artifact.src().display(),
            artifact.dest().display()
        )));
    }
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_options_exclusivity() {
        let both_users = TransferOptions {
            uid: Some(1000),
            username: Some("bob".to_owned()),
            ..TransferOptions::default()
        };
        assert!(matches!(both_users.validate(), Err(CoreError::Configuration(_))));

        let both_groups = TransferOptions {
            gid: Some(1000),
            groupname: Some("staff".to_owned()),
            ..TransferOptions::default()
        };
        assert!(both_groups.validate().is_err());
        assert!(TransferOptions::default().validate().is_ok());
    }

    #[test]
    fn owner_spec_forms() {
        let opts = TransferOptions {
            uid: Some(1000),
            ..TransferOptions::default()
        };
        assert_eq!(opts.owner_spec().as_deref(), Some("1000"));

        let opts = TransferOptions {
            username: Some("bob".to_owned()),
            groupname: Some("staff".to_owned()),
            ..TransferOptions::default()
        };
        assert_eq!(opts.owner_spec().as_deref(), Some("bob:staff"));

        let opts = TransferOptions {
            gid: Some(50),
            ..TransferOptions::default()
        };
        assert_eq!(opts.owner_spec().as_deref(), Some(":50"));
        assert!(TransferOptions::default().owner_spec().is_none());
    }

    #[test]
    fn ownership_commands_recurse_for_directories() {
        let opts = TransferOptions {
            username: Some("bob".to_owned()),
            mode: Some(0o750),
            ..TransferOptions::default()
        };
        let cmds = opts.commands("/srv/data", true);
        assert_eq!(cmds[0], vec!["chown", "-R", "bob", "/srv/data"]);
        assert_eq!(cmds[1], vec!["chmod", "-R", "750", "/srv/data"]);
        assert_eq!(opts.commands("/srv/f", false)[0], vec!["chown", "bob", "/srv/f"]);
    }

    #[test]
    fn read_reply_takes_last_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("log");
        std::fs::write(&src, b"log").unwrap();
        let requested = Artifact::from(File::new(&src, dir.path().join("out"), false));
        let mut artifact = requested.clone();
        artifact.load().unwrap();
        let payload = artifact.serialize_payload(Direction::Pull).unwrap();
        let reply = serde_json::json!({"checksum": payload.checksum, "encoded": payload.encoded});
        let stdout = format!("some agent noise\n{reply}\n");
        assert_eq!(read_reply("a", &stdout, &requested).unwrap(), artifact);
        assert!(matches!(
            read_reply("a", "nothing here", &requested),
            Err(CoreError::UnexpectedReply { .. })
        ));
    }

    #[test]
    fn read_reply_rejects_redirected_dest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("log");
        std::fs::write(&src, b"log").unwrap();
        let requested = Artifact::from(File::new(&src, dir.path().join("out"), false));

        let mut redirected = Artifact::from(File::new(&src, dir.path().join("elsewhere"), false));
        redirected.load().unwrap();
        let payload = redirected.serialize_payload(Direction::Pull).unwrap();
        let reply = serde_json::json!({"checksum": payload.checksum, "encoded": payload.encoded});
        let err = read_reply("a", &reply.to_string(), &requested).unwrap_err();
        assert!(err.to_string().contains("elsewhere"), "{err}");

        let mut forced = Artifact::from(File::new(&src, dir.path().join("out"), true));
        forced.load().unwrap();
        let payload = forced.serialize_payload(Direction::Pull).unwrap();
        let reply = serde_json::json!({"checksum": payload.checksum, "encoded": payload.encoded});
        assert!(read_reply("a", &reply.to_string(), &requested).is_err());
    }
}
