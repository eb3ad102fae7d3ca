use crate::client::ExecResult;
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Extra variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Turn a non-zero exit into `RuntimeError::CommandExecution`.
    pub check: bool,
}

impl RunOptions {
    pub fn checked() -> Self {
        Self {
            check: true,
            ..Self::default()
        }
    }
}

/// Run a host command to completion and capture its output.
///
/// A missing executable is always an error. A non-zero exit code is an error
/// only when `options.check` is set.
pub fn run<S: AsRef<str>>(argv: &[S], options: &RunOptions) -> Result<ExecResult, RuntimeError> {
    let command_line = argv
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ");
    let Some((program, args)) = argv.split_first() else {
        return Err(RuntimeError::CommandExecution {
            command: command_line,
            code: None,
            stderr: "empty command".to_owned(),
        });
    };

    let mut cmd = Command::new(program.as_ref());
    cmd.args(args.iter().map(AsRef::as_ref)).envs(&options.env);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    debug!("running `{command_line}`");
    let output = cmd.output().map_err(|e| {
        let stderr = if e.kind() == ErrorKind::NotFound {
            format!("{}: command not found", program.as_ref())
        } else {
            e.to_string()
        };
        RuntimeError::CommandExecution {
            command: command_line.clone(),
            code: None,
            stderr,
        }
    })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if options.check && !output.status.success() {
        return Err(RuntimeError::CommandExecution {
            command: command_line,
            code: output.status.code(),
            stderr: result.stderr.trim().to_owned(),
        });
    }
    Ok(result)
}

pub fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
