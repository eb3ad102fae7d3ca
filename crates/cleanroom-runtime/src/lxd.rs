//! Runtime driver that shells out to the `lxc` command-line client.
//!
//! Instance queries and creation go through `lxc query` against the REST API;
//! lifecycle, exec, and file transfer use the regular subcommands.

use crate::client::{ExecResult, InstanceStatus, RuntimeClient, RuntimeConnector};
use crate::process::{command_exists, run, RunOptions};
use crate::RuntimeError;
use cleanroom_schema::{ClientConfig, InstanceConfig};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct LxcConnector;

impl LxcConnector {
    pub fn new() -> Self {
        Self
    }
}

impl RuntimeConnector for LxcConnector {
    fn name(&self) -> &str {
        "lxd"
    }

    fn connect(&self, config: &ClientConfig) -> Result<Box<dyn RuntimeClient>, RuntimeError> {
        if !command_exists("lxc") {
            return Err(RuntimeError::BackendUnavailable(
                "lxd (the `lxc` client is not installed)".to_owned(),
            ));
        }
        Ok(Box::new(LxcClient::new(config)?))
    }
}

pub struct LxcClient {
    remote: Option<String>,
    socket: Option<String>,
    project: Option<String>,
    version: String,
}

impl LxcClient {
    pub fn new(config: &ClientConfig) -> Result<Self, RuntimeError> {
        let (remote, socket) = match config.endpoint.as_deref() {
            None => (None, None),
            Some(url) if url.starts_with("https://") || url.starts_with("http://") => {
                return Err(RuntimeError::Api(format!(
                    "endpoint '{url}' is a URL; register it with `lxc remote add <name> {url}` \
                     and set endpoint to the remote name"
                )));
            }
            Some(path) if path.starts_with('/') => (None, Some(path.to_owned())),
            Some(remote) => (Some(remote.to_owned()), None),
        };
        if config.cert.is_some() || config.key.is_some() {
            warn!("client certificates are managed by `lxc remote`; cert/key options are ignored");
        }
        if config.timeout_secs.is_some() {
            debug!("the lxc client has no request timeout; timeout_secs ignored");
        }
        Ok(Self {
            remote,
            socket,
            project: config.project.clone(),
            version: config.version.clone(),
        })
    }

    fn target(&self, name: &str) -> String {
        match &self.remote {
            Some(remote) => format!("{remote}:{name}"),
            None => name.to_owned(),
        }
    }

    fn api_path(&self, path: &str) -> String {
        let path = format!("/{}{path}", self.version);
        match &self.remote {
            Some(remote) => format!("{remote}:{path}"),
            None => path,
        }
    }

    fn options(&self, check: bool) -> RunOptions {
        let mut options = RunOptions {
            check,
            ..RunOptions::default()
        };
        if let Some(socket) = &self.socket {
            options.env.insert("LXD_SOCKET".to_owned(), socket.clone());
        }
        options
    }

    fn lxc(&self, args: Vec<String>, check: bool) -> Result<ExecResult, RuntimeError> {
        let mut argv = vec!["lxc".to_owned()];
        argv.extend(args);
        if let Some(project) = &self.project {
            argv.push("--project".to_owned());
            argv.push(project.clone());
        }
        run(&argv, &self.options(check))
    }

    fn query(&self, method: &str, path: &str, body: Option<&str>) -> Result<Value, RuntimeError> {
        let mut args = vec!["query".to_owned(), "-X".to_owned(), method.to_owned()];
        if method != "GET" {
            args.push("--wait".to_owned());
        }
        if let Some(body) = body {
            args.push("-d".to_owned());
            args.push(body.to_owned());
        }
        args.push(self.api_path(path));
        let result = self.lxc(args, true)?;
        if result.stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&result.stdout)?)
    }

    fn lifecycle(&self, action: &str, name: &str) -> Result<(), RuntimeError> {
        debug!("lxc {action} {name}");
        self.lxc(vec![action.to_owned(), self.target(name)], true)?;
        Ok(())
    }
}

impl RuntimeClient for LxcClient {
    fn exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let list = self.query("GET", "/instances", None)?;
        Ok(instance_names(&list).iter().any(|n| n == name))
    }

    fn create(&self, config: &InstanceConfig) -> Result<(), RuntimeError> {
        let body = config.to_api_json()?;
        self.query("POST", "/instances", Some(&body))?;
        Ok(())
    }

    fn status(&self, name: &str) -> Result<InstanceStatus, RuntimeError> {
        let state = self.query("GET", &format!("/instances/{name}/state"), None)?;
        Ok(parse_status(&state))
    }

    fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle("start", name)
    }

    fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle("stop", name)
    }

    fn delete(&self, name: &str) -> Result<(), RuntimeError> {
        self.lifecycle("delete", name)
    }

    fn execute(
        &self,
        name: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecResult, RuntimeError> {
        let mut args = vec!["exec".to_owned(), self.target(name)];
        for (key, value) in env {
            args.push("--env".to_owned());
            args.push(format!("{key}={value}"));
        }
        if let Some(project) = &self.project {
            args.push("--project".to_owned());
            args.push(project.clone());
        }
        args.push("--".to_owned());
        args.extend(argv.iter().cloned());

        let mut full = vec!["lxc".to_owned()];
        full.extend(args);
        run(&full, &self.options(false))
    }

    fn put_file(&self, name: &str, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(data)?;
        tmp.flush()?;
        self.lxc(
            vec![
                "file".to_owned(),
                "push".to_owned(),
                "-p".to_owned(),
                tmp.path().to_string_lossy().into_owned(),
                format!("{}{}", self.target(name), absolute(path)),
            ],
            true,
        )?;
        Ok(())
    }

    fn get_file(&self, name: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let dir = tempfile::tempdir()?;
        let local = dir.path().join("pulled");
        self.lxc(
            vec![
                "file".to_owned(),
                "pull".to_owned(),
                format!("{}{}", self.target(name), absolute(path)),
                local.to_string_lossy().into_owned(),
            ],
            true,
        )?;
        Ok(std::fs::read(&local)?)
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpAddr>, RuntimeError> {
        let state = self.query("GET", &format!("/instances/{name}/state"), None)?;
        Ok(parse_addresses(&state))
    }
}

fn absolute(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

/// Names from a `GET /instances` listing of resource URLs.
pub fn instance_names(list: &Value) -> Vec<String> {
    list.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|url| url.split('?').next())
                .filter_map(|url| url.rsplit('/').next())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_status(state: &Value) -> InstanceStatus {
    state
        .get("status")
        .and_then(Value::as_str)
        .map_or(InstanceStatus::Unknown, InstanceStatus::parse)
}

/// Global-scope addresses of every non-loopback interface in an instance state.
pub fn parse_addresses(state: &Value) -> Vec<IpAddr> {
    let Some(network) = state.get("network").and_then(Value::as_object) else {
        return Vec::new();
    };
    network
        .iter()
        .filter(|(iface, _)| iface.as_str() != "lo")
        .filter_map(|(_, iface)| iface.get("addresses").and_then(Value::as_array))
        .flatten()
        .filter(|addr| addr.get("scope").and_then(Value::as_str) == Some("global"))
        .filter_map(|addr| addr.get("address").and_then(Value::as_str))
        .filter_map(|addr| addr.parse().ok())
        .collect()
}
