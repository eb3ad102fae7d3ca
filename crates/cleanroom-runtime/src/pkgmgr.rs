use crate::os::{detect_os, OsRelease};
use crate::process::{command_exists, run, RunOptions};
use crate::RuntimeError;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// What a package manager knows about one package.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub installed: bool,
    pub version: Option<String>,
    pub repo: Option<String>,
}

impl PackageInfo {
    fn absent(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }
}

pub trait PackageManager: Send + Sync {
    fn name(&self) -> &str;

    /// Binary the manager shells out to.
    fn executable(&self) -> &str;

    fn install_command(&self, package: &str, version: Option<&str>) -> Vec<String>;

    fn remove_command(&self, package: &str) -> Vec<String>;

    /// Query the host and describe `package`. Missing packages are reported
    /// with `installed == false`, not as an error.
    fn fetch(&self, package: &str) -> Result<PackageInfo, RuntimeError>;

    fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Update the package index, for managers that keep one locally.
    fn refresh(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        command_exists(self.executable())
    }

    fn ensure_available(&self) -> Result<(), RuntimeError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RuntimeError::UnsupportedPlatform(format!(
                "{} is not available on this system",
                self.executable()
            )))
        }
    }

    fn install(&self, package: &str, version: Option<&str>) -> Result<(), RuntimeError> {
        self.ensure_available()?;
        info!("installing {package} with {}", self.name());
        run(
            &self.install_command(package, version),
            &RunOptions {
                env: self.env(),
                check: true,
                ..RunOptions::default()
            },
        )?;
        Ok(())
    }

    fn remove(&self, package: &str) -> Result<(), RuntimeError> {
        self.ensure_available()?;
        info!("removing {package} with {}", self.name());
        run(
            &self.remove_command(package),
            &RunOptions {
                env: self.env(),
                check: true,
                ..RunOptions::default()
            },
        )?;
        Ok(())
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

fn query(argv: &[&str]) -> Result<String, RuntimeError> {
    Ok(run(argv, &RunOptions::default())?.stdout)
}

// --- apt ---

#[derive(Debug, Clone, Copy, Default)]
pub struct Apt;

impl PackageManager for Apt {
    fn name(&self) -> &str {
        "apt"
    }

    fn executable(&self) -> &str {
        "apt-get"
    }

    fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("DEBIAN_FRONTEND".to_owned(), "noninteractive".to_owned())])
    }

    /// Fresh images ship without package lists, so installs need this first.
    fn refresh(&self) -> Result<(), RuntimeError> {
        self.ensure_available()?;
        run(
            &["apt-get", "update", "-y"],
            &RunOptions {
                env: self.env(),
                check: true,
                ..RunOptions::default()
            },
        )?;
        Ok(())
    }

    fn install_command(&self, package: &str, version: Option<&str>) -> Vec<String> {
        let mut cmd = argv(&[
            "apt-get",
            "install",
            "-y",
            "--option=Dpkg::Options::=--force-confold",
        ]);
        cmd.push(match version {
            Some(v) => format!("{package}={v}"),
            None => package.to_owned(),
        });
        cmd
    }

    fn remove_command(&self, package: &str) -> Vec<String> {
        argv(&["apt-get", "remove", "-y", package])
    }

    fn fetch(&self, package: &str) -> Result<PackageInfo, RuntimeError> {
        self.ensure_available()?;
        let status = query(&[
            "dpkg-query",
            "-W",
            "-f=${Status}\t${Version}\n",
            package,
        ])?;
        let policy = query(&["apt-cache", "policy", package])?;
        Ok(parse_apt(package, &status, &policy))
    }
}

/// Combine `dpkg-query` status output with `apt-cache policy` output.
pub fn parse_apt(package: &str, dpkg_status: &str, policy: &str) -> PackageInfo {
    let mut info = PackageInfo::absent(package);
    if let Some((status, version)) = dpkg_status.lines().next().and_then(|l| l.split_once('\t')) {
        if status.ends_with("installed") && !status.contains("not-installed") {
            info.installed = true;
            info.version = Some(version.trim().to_owned());
        }
    }

    let mut in_table = false;
    for line in policy.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Version table:") {
            in_table = true;
            continue;
        }
        if !info.installed && info.version.is_none() {
            if let Some(candidate) = trimmed.strip_prefix("Candidate:") {
                let candidate = candidate.trim();
                if candidate != "(none)" {
                    info.version = Some(candidate.to_owned());
                }
            }
        }
        // Version table rows: "500 http://archive.ubuntu.com/ubuntu jammy/main amd64 Packages"
        if in_table && info.repo.is_none() {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 3 && fields[0].parse::<u32>().is_ok() && fields[1].contains("://")
            {
                info.repo = Some(format!("{} {}", fields[1], fields[2]));
            }
        }
    }
    info
}

// --- dnf ---

#[derive(Debug, Clone, Copy, Default)]
pub struct Dnf;

impl PackageManager for Dnf {
    fn name(&self) -> &str {
        "dnf"
    }

    fn executable(&self) -> &str {
        "dnf"
    }

    fn install_command(&self, package: &str, version: Option<&str>) -> Vec<String> {
        let mut cmd = argv(&["dnf", "install", "-y"]);
        cmd.push(match version {
            Some(v) => format!("{package}-{v}"),
            None => package.to_owned(),
        });
        cmd
    }

    fn remove_command(&self, package: &str) -> Vec<String> {
        argv(&["dnf", "remove", "-y", package])
    }

    fn fetch(&self, package: &str) -> Result<PackageInfo, RuntimeError> {
        self.ensure_available()?;
        let installed = query(&["dnf", "list", "--installed", package])?;
        let info = parse_dnf_list(package, &installed, true);
        if info.installed {
            return Ok(info);
        }
        let available = query(&["dnf", "list", "--available", package])?;
        Ok(parse_dnf_list(package, &available, false))
    }
}

/// Parse `dnf list` rows of the form `name.arch  version  @repo`.
pub fn parse_dnf_list(package: &str, output: &str, installed: bool) -> PackageInfo {
    let prefix = format!("{package}.");
    output
        .lines()
        .filter(|l| l.starts_with(&prefix))
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            (fields.len() >= 3).then(|| PackageInfo {
                name: package.to_owned(),
                installed,
                version: Some(fields[1].to_owned()),
                repo: Some(fields[2].trim_start_matches('@').to_owned()),
            })
        })
        .unwrap_or_else(|| PackageInfo::absent(package))
}

// --- pacman ---

#[derive(Debug, Clone, Copy, Default)]
pub struct Pacman;

impl PackageManager for Pacman {
    fn name(&self) -> &str {
        "pacman"
    }

    fn executable(&self) -> &str {
        "pacman"
    }

    /// pacman cannot pin a version from the sync database, so `version` is
    /// ignored and the repository's current build is installed.
    fn install_command(&self, package: &str, _version: Option<&str>) -> Vec<String> {
        argv(&["pacman", "-S", "--noconfirm", "--needed", package])
    }

    fn remove_command(&self, package: &str) -> Vec<String> {
        argv(&["pacman", "-R", "--noconfirm", package])
    }

    fn fetch(&self, package: &str) -> Result<PackageInfo, RuntimeError> {
        self.ensure_available()?;
        let sync = query(&["pacman", "-Si", package])?;
        let local = query(&["pacman", "-Qi", package])?;
        Ok(parse_pacman_info(package, &local, &sync))
    }
}

fn pacman_fields(output: &str) -> BTreeMap<&str, &str> {
    output
        .lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// Merge `pacman -Qi` (local) and `pacman -Si` (sync) key/value output.
pub fn parse_pacman_info(package: &str, local: &str, sync: &str) -> PackageInfo {
    let local = pacman_fields(local);
    let sync = pacman_fields(sync);
    let installed = local.contains_key("Version");
    PackageInfo {
        name: package.to_owned(),
        installed,
        version: local
            .get("Version")
            .or_else(|| sync.get("Version"))
            .map(|v| (*v).to_owned()),
        repo: sync.get("Repository").map(|v| (*v).to_owned()),
    }
}

// --- snap ---

#[derive(Debug, Clone, Default)]
pub struct Snap {
    classic: bool,
    devmode: bool,
    cohort: Option<String>,
}

impl Snap {
    /// Install with `--classic` confinement.
    pub fn classic() -> Self {
        Self {
            classic: true,
            ..Self::default()
        }
    }

    pub fn devmode() -> Self {
        Self {
            devmode: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cohort(mut self, cohort: impl Into<String>) -> Self {
        self.cohort = Some(cohort.into());
        self
    }

    fn push_flags(&self, cmd: &mut Vec<String>) {
        if self.classic {
            cmd.push("--classic".to_owned());
        }
        if self.devmode {
            cmd.push("--devmode".to_owned());
        }
    }

    /// `snap install` of a `.snap` file already on disk.
    pub fn install_local_command(&self, path: &str, dangerous: bool) -> Vec<String> {
        let mut cmd = argv(&["snap", "install", path]);
        self.push_flags(&mut cmd);
        if dangerous {
            cmd.push("--dangerous".to_owned());
        }
        cmd
    }

    pub fn install_local(&self, path: &str, dangerous: bool) -> Result<(), RuntimeError> {
        self.ensure_available()?;
        info!("installing local snap {path}");
        run(
            self.install_local_command(path, dangerous).as_slice(),
            &RunOptions::checked(),
        )?;
        Ok(())
    }
}

impl PackageManager for Snap {
    fn name(&self) -> &str {
        "snap"
    }

    fn executable(&self) -> &str {
        "snap"
    }

    /// For snaps the version is a channel such as `latest/stable`.
    fn install_command(&self, package: &str, version: Option<&str>) -> Vec<String> {
        let mut cmd = argv(&["snap", "install", package]);
        if let Some(channel) = version {
            cmd.push(format!("--channel={channel}"));
        }
        self.push_flags(&mut cmd);
        if let Some(cohort) = &self.cohort {
            cmd.push(format!("--cohort={cohort}"));
        }
        cmd
    }

    fn remove_command(&self, package: &str) -> Vec<String> {
        argv(&["snap", "remove", package])
    }

    fn fetch(&self, package: &str) -> Result<PackageInfo, RuntimeError> {
        self.ensure_available()?;
        Ok(parse_snap_list(package, &query(&["snap", "list", package])?))
    }
}

/// Parse `snap list <name>`: a header row then `Name Version Rev Tracking ...`.
pub fn parse_snap_list(package: &str, output: &str) -> PackageInfo {
    output
        .lines()
        .skip(1)
        .find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            (fields.len() >= 4 && fields[0] == package).then(|| PackageInfo {
                name: package.to_owned(),
                installed: true,
                version: Some(fields[1].to_owned()),
                repo: Some(fields[3].to_owned()),
            })
        })
        .unwrap_or_else(|| PackageInfo::absent(package))
}

// --- selection ---

fn choose_for_os(
    os: &OsRelease,
    available: impl Fn(&str) -> bool,
) -> Option<Box<dyn PackageManager>> {
    let preferred: Option<Box<dyn PackageManager>> = if os.is_like("debian") {
        Some(Box::new(Apt))
    } else if os.is_like("fedora") || os.is_like("rhel") {
        Some(Box::new(Dnf))
    } else if os.is_like("arch") {
        Some(Box::new(Pacman))
    } else {
        None
    };
    if let Some(pm) = preferred.filter(|pm| available(pm.executable())) {
        return Some(pm);
    }

    let fallbacks: [Box<dyn PackageManager>; 3] = [Box::new(Apt), Box::new(Dnf), Box::new(Pacman)];
    fallbacks.into_iter().find(|pm| available(pm.executable()))
}

/// The native package manager for the running host.
pub fn system_package_manager() -> Result<Box<dyn PackageManager>, RuntimeError> {
    let os = detect_os()?;
    let pm = choose_for_os(&os, command_exists).ok_or_else(|| {
        RuntimeError::UnsupportedPlatform(format!(
            "no supported package manager found for '{}'",
            os.id
        ))
    })?;
    debug!("using {} on {}", pm.name(), os.id);
    Ok(pm)
}
