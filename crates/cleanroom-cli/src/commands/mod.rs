pub mod address;
pub mod agent;
pub mod completions;
pub mod configs;
pub mod destroy;
pub mod exec;
pub mod pull;
pub mod push;
pub mod restart;
pub mod run;

use cleanroom_core::{Orchestrator, Project, Registries, TransferOptions, PROJECT_FILE};
use cleanroom_runtime::{select_connector, ExecResult};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_NOT_FOUND: u8 = 3;
/// At least one payload or command exited non-zero.
pub const EXIT_TEST_FAILURE: u8 = 4;

/// Global options that decide how the orchestrator is built.
#[derive(Debug, Default)]
pub struct Connection {
    pub config: Option<PathBuf>,
    pub backend: Option<String>,
    pub threads: Option<usize>,
}

impl Connection {
    /// Explicit `--config` must exist; the default project file is optional.
    pub fn project(&self) -> Result<Project, String> {
        match &self.config {
            Some(path) => Project::load(path).map_err(|e| format!("{e} ({})", path.display())),
            None if Path::new(PROJECT_FILE).is_file() => {
                Project::load(PROJECT_FILE).map_err(|e| e.to_string())
            }
            None => Ok(Project::default()),
        }
    }

    pub fn registries(&self, project: &Project) -> Result<Registries, String> {
        let mut registries = Registries::new();
        project
            .apply(&mut registries)
            .map_err(|e| e.to_string())?;
        Ok(registries)
    }

    pub fn orchestrator(&self) -> Result<(Orchestrator, Project), String> {
        let project = self.project()?;
        let registries = self.registries(&project)?;
        let backend = self.backend.as_deref().unwrap_or(&project.run.backend);
        let connector = select_connector(backend).map_err(|e| e.to_string())?;
        let threads = cleanroom_core::thread_count(self.threads.or(project.run.threads));
        // This binary carries the `agent` subcommand bootstrap scripts invoke.
        let orchestrator = Orchestrator::new(registries, connector)
            .with_threads(threads)
            .with_support_binary(std::env::current_exe().ok());
        Ok((orchestrator, project))
    }
}

/// Ownership flags shared by push and pull.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct TransferArgs {
    /// Owner uid for the copied path.
    #[arg(long)]
    pub uid: Option<u32>,
    /// Owner user name for the copied path.
    #[arg(long = "user")]
    pub username: Option<String>,
    /// Group id for the copied path.
    #[arg(long)]
    pub gid: Option<u32>,
    /// Group name for the copied path.
    #[arg(long = "group")]
    pub groupname: Option<String>,
    /// Octal permission bits, e.g. 0644.
    #[arg(long)]
    pub mode: Option<String>,
    /// Replace an existing destination.
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
}

impl TransferArgs {
    pub fn options(&self) -> Result<TransferOptions, String> {
        let mode = self
            .mode
            .as_deref()
            .map(|m| {
                u32::from_str_radix(m.trim_start_matches("0o"), 8)
                    .map_err(|_| format!("configuration error: invalid octal mode '{m}'"))
            })
            .transpose()?;
        Ok(TransferOptions {
            uid: self.uid,
            username: self.username.clone(),
            gid: self.gid,
            groupname: self.groupname.clone(),
            mode,
        })
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_exit(code: i32) -> String {
    use console::Style;
    let text = format!("exit {code}");
    if code == 0 {
        Style::new().green().apply_to(text).to_string()
    } else {
        Style::new().red().bold().apply_to(text).to_string()
    }
}

/// Print per-instance results and pick the process exit code.
pub fn report(results: &BTreeMap<String, ExecResult>, json: bool) -> Result<u8, String> {
    if json {
        println!("{}", json_pretty(results)?);
    } else {
        for (name, result) in results {
            println!("── {name} ({})", colorize_exit(result.exit_code));
            if !result.stdout.is_empty() {
                print!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprint!("{}", result.stderr);
            }
        }
    }
    if results.values().all(ExecResult::success) {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_TEST_FAILURE)
    }
}
