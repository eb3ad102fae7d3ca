use crate::injectable::{decode, encode, Direction, EntryPoint, Injectable};
use crate::InjectError;
use cleanroom_runtime::{
    command_exists, detect_os, run, system_package_manager, Apt, PackageManager, RunOptions,
    RuntimeError, Snap as SnapCli,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Value of one environment variable contributed by a package.
///
/// Lists are appended to what is already stored; scalars replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Scalar(String),
    List(Vec<String>),
}

pub type EnvContribution = BTreeMap<String, EnvValue>;

/// Behaviour shared by every installable package.
///
/// `prepare` runs on the host before serialization; `setup` and `install` run
/// inside the instance through the agent.
pub trait PackageSpec {
    /// Read host-side files the install step depends on.
    fn prepare(&mut self) -> Result<(), InjectError> {
        Ok(())
    }

    /// Make sure the tooling the install step needs is present.
    fn setup(&self) -> Result<(), InjectError>;

    fn install(&self) -> Result<(), InjectError>;

    fn emits_env(&self) -> bool {
        false
    }

    /// Environment the instance gains once `install` has succeeded.
    fn env_contribution(&self) -> Option<EnvContribution> {
        None
    }
}

fn checked(cmd: &[String], options: RunOptions) -> Result<(), InjectError> {
    run(cmd, &RunOptions { check: true, ..options })?;
    Ok(())
}

// --- pip ---

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UnvalidatedPip {
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    requirements: Vec<PathBuf>,
    #[serde(default)]
    constraints: Vec<PathBuf>,
    #[serde(default)]
    requirement_texts: Vec<String>,
    #[serde(default)]
    constraint_texts: Vec<String>,
}

/// `python3 -m pip install` of named packages and/or requirements files.
///
/// When constraints are given, `constraints[i]` applies to `requirements[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UnvalidatedPip")]
pub struct Pip {
    pub packages: Vec<String>,
    pub requirements: Vec<PathBuf>,
    pub constraints: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    requirement_texts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    constraint_texts: Vec<String>,
}

impl TryFrom<UnvalidatedPip> for Pip {
    type Error = InjectError;

    fn try_from(raw: UnvalidatedPip) -> Result<Self, Self::Error> {
        let pip = Self {
            packages: raw.packages,
            requirements: raw.requirements,
            constraints: raw.constraints,
            requirement_texts: raw.requirement_texts,
            constraint_texts: raw.constraint_texts,
        };
        pip.lint()?;
        Ok(pip)
    }
}

impl Pip {
    pub fn new(
        packages: Vec<String>,
        requirements: Vec<PathBuf>,
        constraints: Vec<PathBuf>,
    ) -> Result<Self, InjectError> {
        Self::try_from(UnvalidatedPip {
            packages,
            requirements,
            constraints,
            requirement_texts: Vec::new(),
            constraint_texts: Vec::new(),
        })
    }

    fn lint(&self) -> Result<(), InjectError> {
        if self.packages.is_empty() && self.requirements.is_empty() {
            return Err(InjectError::InvalidPackage(
                "pip: no packages or requirements files specified".to_owned(),
            ));
        }
        if !self.constraints.is_empty() && self.requirements.is_empty() {
            return Err(InjectError::InvalidPackage(
                "pip: constraints need matching requirements files".to_owned(),
            ));
        }
        if !self.constraints.is_empty() && self.constraints.len() != self.requirements.len() {
            return Err(InjectError::InvalidPackage(format!(
                "pip: {} requirements files but {} constraints files",
                self.requirements.len(),
                self.constraints.len()
            )));
        }
        Ok(())
    }

    fn pip_install(args: &[&str]) -> Vec<String> {
        ["python3", "-m", "pip", "install"]
            .iter()
            .chain(args)
            .map(|s| (*s).to_owned())
            .collect()
    }
}

fn read_all(paths: &[PathBuf]) -> Result<Vec<String>, InjectError> {
    paths
        .iter()
        .map(|p| fs::read_to_string(p).map_err(|_| InjectError::SourceNotFound(p.clone())))
        .collect()
}

impl PackageSpec for Pip {
    fn prepare(&mut self) -> Result<(), InjectError> {
        self.requirement_texts = read_all(&self.requirements)?;
        self.constraint_texts = read_all(&self.constraints)?;
        Ok(())
    }

    fn setup(&self) -> Result<(), InjectError> {
        let pip = run(&["python3", "-m", "pip", "--version"], &RunOptions::default());
        if pip.is_ok_and(|r| r.success()) {
            return Ok(());
        }
        let os = detect_os()?;
        if !os.is_like("debian") {
            return Err(RuntimeError::UnsupportedPlatform(format!(
                "pip is not installed and cannot be installed automatically on '{}'",
                os.id
            ))
            .into());
        }
        Apt.refresh()?;
        Apt.install("python3-pip", None)?;
        Ok(())
    }

    fn install(&self) -> Result<(), InjectError> {
        if !self.packages.is_empty() {
            info!("pip installing {}", self.packages.join(", "));
            let names: Vec<&str> = self.packages.iter().map(String::as_str).collect();
            checked(&Self::pip_install(&names), RunOptions::default())?;
        }
        if self.requirement_texts.len() != self.requirements.len() {
            return Err(InjectError::InvalidPackage(
                "pip: requirements files were not read before injection".to_owned(),
            ));
        }

        let scratch = tempfile::tempdir()?;
        for (i, requirement) in self.requirement_texts.iter().enumerate() {
            let req_path = scratch.path().join("requirements.txt");
            fs::write(&req_path, requirement)?;
            let req = req_path.to_string_lossy().into_owned();
            let cmd = match self.constraint_texts.get(i) {
                Some(constraint) => {
                    let con_path = scratch.path().join("constraints.txt");
                    fs::write(&con_path, constraint)?;
                    let con = con_path.to_string_lossy().into_owned();
                    Self::pip_install(&["-r", &req, "-c", &con])
                }
                None => Self::pip_install(&["-r", &req]),
            };
            debug!("pip installing requirements set {i}");
            checked(&cmd, RunOptions::default())?;
        }
        Ok(())
    }
}

// --- charm libraries ---

const CHARM_LIB_ROOT: &str = "/root";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UnvalidatedCharmlib {
    auth_token_path: PathBuf,
    charmlibs: Vec<String>,
    #[serde(default)]
    auth_token: Option<String>,
}

/// Charm libraries fetched with `charmcraft fetch-lib` into `/root/lib`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UnvalidatedCharmlib")]
pub struct Charmlib {
    pub auth_token_path: PathBuf,
    pub charmlibs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
}

impl TryFrom<UnvalidatedCharmlib> for Charmlib {
    type Error = InjectError;

    fn try_from(raw: UnvalidatedCharmlib) -> Result<Self, Self::Error> {
        if raw.charmlibs.is_empty() {
            return Err(InjectError::InvalidPackage(
                "charmlib: no charm libraries specified".to_owned(),
            ));
        }
        Ok(Self {
            auth_token_path: raw.auth_token_path,
            charmlibs: raw.charmlibs,
            auth_token: raw.auth_token,
        })
    }
}

impl Charmlib {
    pub fn new(
        auth_token_path: impl Into<PathBuf>,
        charmlibs: Vec<String>,
    ) -> Result<Self, InjectError> {
        Self::try_from(UnvalidatedCharmlib {
            auth_token_path: auth_token_path.into(),
            charmlibs,
            auth_token: None,
        })
    }
}

impl PackageSpec for Charmlib {
    fn prepare(&mut self) -> Result<(), InjectError> {
        if !self.auth_token_path.is_file() {
            return Err(InjectError::SourceNotFound(self.auth_token_path.clone()));
        }
        self.auth_token = Some(fs::read_to_string(&self.auth_token_path)?.trim().to_owned());
        Ok(())
    }

    fn setup(&self) -> Result<(), InjectError> {
        if !command_exists("snap") {
            let pm = system_package_manager()?;
            pm.refresh()?;
            pm.install("snapd", None)?;
        }
        if !command_exists("charmcraft") && !Path::new("/snap/bin/charmcraft").exists() {
            SnapCli::classic().install("charmcraft", None)?;
        }
        Ok(())
    }

    fn install(&self) -> Result<(), InjectError> {
        let token = self.auth_token.as_ref().ok_or_else(|| {
            InjectError::InvalidPackage(
                "charmlib: auth token was not read before injection".to_owned(),
            )
        })?;
        for lib in &self.charmlibs {
            info!("fetching charm library {lib}");
            checked(
                &[
                    "/snap/bin/charmcraft".to_owned(),
                    "fetch-lib".to_owned(),
                    lib.clone(),
                ],
                RunOptions {
                    env: BTreeMap::from([("CHARMCRAFT_AUTH".to_owned(), token.clone())]),
                    cwd: Some(PathBuf::from(CHARM_LIB_ROOT)),
                    check: true,
                },
            )?;
        }
        Ok(())
    }

    fn emits_env(&self) -> bool {
        true
    }

    fn env_contribution(&self) -> Option<EnvContribution> {
        Some(BTreeMap::from([(
            "PYTHONPATH".to_owned(),
            EnvValue::List(vec![format!("{CHARM_LIB_ROOT}/lib")]),
        )]))
    }
}

// --- snaps ---

const LOCAL_SNAP_PATH: &str = "/root/tmp.snap";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confinement {
    #[default]
    Strict,
    Classic,
    Devmode,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UnvalidatedSnap {
    #[serde(default)]
    snaps: Vec<String>,
    #[serde(default)]
    local_snaps: Vec<PathBuf>,
    #[serde(default)]
    confinement: Confinement,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    cohort: Option<String>,
    #[serde(default)]
    dangerous: bool,
    #[serde(default)]
    local_snap_data: Vec<String>,
}

/// Snaps from the store and/or `.snap` files read from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UnvalidatedSnap")]
pub struct Snap {
    pub snaps: Vec<String>,
    pub local_snaps: Vec<PathBuf>,
    pub confinement: Confinement,
    pub channel: Option<String>,
    pub cohort: Option<String>,
    pub dangerous: bool,
    /// Base64 contents of `local_snaps`, filled by `prepare`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    local_snap_data: Vec<String>,
}

impl TryFrom<UnvalidatedSnap> for Snap {
    type Error = InjectError;

    fn try_from(raw: UnvalidatedSnap) -> Result<Self, Self::Error> {
        if raw.snaps.is_empty() && raw.local_snaps.is_empty() {
            return Err(InjectError::InvalidPackage(
                "snap: no snaps or local snap files specified".to_owned(),
            ));
        }
        Ok(Self {
            snaps: raw.snaps,
            local_snaps: raw.local_snaps,
            confinement: raw.confinement,
            channel: raw.channel,
            cohort: raw.cohort,
            dangerous: raw.dangerous,
            local_snap_data: raw.local_snap_data,
        })
    }
}

impl Snap {
    pub fn new(snaps: Vec<String>, local_snaps: Vec<PathBuf>) -> Result<Self, InjectError> {
        Self::try_from(UnvalidatedSnap {
            snaps,
            local_snaps,
            confinement: Confinement::default(),
            channel: None,
            cohort: None,
            dangerous: false,
            local_snap_data: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_confinement(mut self, confinement: Confinement) -> Self {
        self.confinement = confinement;
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn with_cohort(mut self, cohort: impl Into<String>) -> Self {
        self.cohort = Some(cohort.into());
        self
    }

    #[must_use]
    pub fn dangerous(mut self, dangerous: bool) -> Self {
        self.dangerous = dangerous;
        self
    }

    fn manager(&self) -> SnapCli {
        let cli = match self.confinement {
            Confinement::Strict => SnapCli::default(),
            Confinement::Classic => SnapCli::classic(),
            Confinement::Devmode => SnapCli::devmode(),
        };
        match &self.cohort {
            Some(cohort) => cli.with_cohort(cohort.as_str()),
            None => cli,
        }
    }
}

impl PackageSpec for Snap {
    fn prepare(&mut self) -> Result<(), InjectError> {
        self.local_snap_data = self
            .local_snaps
            .iter()
            .map(|p| {
                fs::read(p)
                    .map(|bytes| encode(&bytes))
                    .map_err(|_| InjectError::SourceNotFound(p.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn setup(&self) -> Result<(), InjectError> {
        if command_exists("snap") {
            return Ok(());
        }
        let pm = system_package_manager()?;
        pm.refresh()?;
        pm.install("snapd", None)?;
        Ok(())
    }

    fn install(&self) -> Result<(), InjectError> {
        if self.local_snap_data.len() != self.local_snaps.len() {
            return Err(InjectError::InvalidPackage(
                "snap: local snap files were not read before injection".to_owned(),
            ));
        }
        let cli = self.manager();
        for snap in &self.snaps {
            cli.install(snap, self.channel.as_deref())?;
        }
        for (path, data) in self.local_snaps.iter().zip(&self.local_snap_data) {
            let bytes = decode(data).map_err(|e| {
                InjectError::InvalidPackage(format!("snap: {}: {e}", path.display()))
            })?;
            fs::write(LOCAL_SNAP_PATH, bytes)?;
            debug!("installing {} from {LOCAL_SNAP_PATH}", path.display());
            cli.install_local(LOCAL_SNAP_PATH, self.dangerous)?;
        }
        Ok(())
    }
}

// --- native packages ---

/// Packages from the instance's native package manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct System {
    pub packages: Vec<String>,
}

impl PackageSpec for System {
    fn setup(&self) -> Result<(), InjectError> {
        system_package_manager()?.refresh()?;
        Ok(())
    }

    fn install(&self) -> Result<(), InjectError> {
        let pm = system_package_manager()?;
        for package in &self.packages {
            pm.install(package, None)?;
        }
        Ok(())
    }
}

/// Any installable package, tagged by `kind` in project files and payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Package {
    Pip(Pip),
    Charmlib(Charmlib),
    Snap(Snap),
    System(System),
}

impl Package {
    fn spec(&self) -> &dyn PackageSpec {
        match self {
            Self::Pip(p) => p,
            Self::Charmlib(c) => c,
            Self::Snap(s) => s,
            Self::System(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pip(_) => "pip",
            Self::Charmlib(_) => "charmlib",
            Self::Snap(_) => "snap",
            Self::System(_) => "system",
        }
    }
}

impl PackageSpec for Package {
    fn prepare(&mut self) -> Result<(), InjectError> {
        match self {
            Self::Pip(p) => p.prepare(),
            Self::Charmlib(c) => c.prepare(),
            Self::Snap(s) => s.prepare(),
            Self::System(s) => s.prepare(),
        }
    }

    fn setup(&self) -> Result<(), InjectError> {
        self.spec().setup()
    }

    fn install(&self) -> Result<(), InjectError> {
        self.spec().install()
    }

    fn emits_env(&self) -> bool {
        self.spec().emits_env()
    }

    fn env_contribution(&self) -> Option<EnvContribution> {
        self.spec().env_contribution()
    }
}

impl Injectable for Package {
    fn entry_point(&self, _direction: Direction) -> EntryPoint {
        EntryPoint::Install
    }
}
