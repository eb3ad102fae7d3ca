//! Orchestrator and harness behaviour against the in-memory runtime.
//!
//! Bootstrap scripts are answered by a responder that plays the in-instance
//! agent: it pulls the checksum and payload out of the script and runs
//! `dispatch` on the host, so artifact paths are tempdir paths.

use cleanroom_core::{
    CoreError, DeployRequest, Harness, Orchestrator, Payload, Registries, StartEnvHook,
    StopEnvHook, Strategy, TransferOptions,
};
use cleanroom_inject::{
    dispatch, Artifact, Charmlib, EntryPoint, File, Injectable, Injected, Package, AGENT_PATH,
};
use cleanroom_runtime::{ExecResult, InstanceStatus, MockConnector, MockEvent};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

const JAMMY: &str = "ubuntu-jammy-amd64";
const DEBIAN: &str = "debian-12-amd64";

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

fn parse_bootstrap(script: &str) -> Option<(EntryPoint, String, String)> {
    let mut lines = script.lines();
    lines.by_ref().find(|l| l.starts_with("cat > "))?;
    let mut encoded = String::new();
    for line in lines.by_ref() {
        if line == "CLEANROOM_PAYLOAD" {
            break;
        }
        encoded.push_str(line);
    }
    let agent = lines.find(|l| l.contains(" agent "))?;
    let mut words = agent.split_whitespace();
    words.find(|w| *w == "agent")?;
    let entry = words.next()?.parse().ok()?;
    words.find(|w| *w == "--checksum")?;
    let checksum = words.next()?.to_owned();
    Some((entry, checksum, encoded))
}

/// Answer bootstrap scripts like the agent would and log `<entry> <subject>`
/// for each one. Installs are logged but not run. `test -f|-d` is answered
/// from the host filesystem.
fn emulate_agent(mock: &MockConnector) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);
    mock.on_exec(move |call| {
        if let [test, flag, path] = call.argv {
            if test == "test" {
                let path = Path::new(path);
                let found = match flag.as_str() {
                    "-f" => path.is_file(),
                    "-d" => path.is_dir(),
                    _ => false,
                };
                return Some(ExecResult {
                    exit_code: i32::from(!found),
                    ..ExecResult::default()
                });
            }
        }
        let script = std::str::from_utf8(call.script?).ok()?;
        let (entry, checksum, encoded) = parse_bootstrap(script)?;
        let subject = match Injected::deserialize_payload(&checksum, &encoded) {
            Ok(Injected::Artifact(a)) => a.dest().display().to_string(),
            Ok(Injected::Package(p)) => p.kind().to_owned(),
            Err(e) => {
                return Some(ExecResult {
                    exit_code: 65,
                    stderr: e.to_string(),
                    ..ExecResult::default()
                })
            }
        };
        seen.lock().unwrap().push(format!("{entry} {subject}"));
        if entry == EntryPoint::Install {
            return Some(ExecResult::default());
        }
        Some(match dispatch(entry, &checksum, &encoded) {
            Ok(Some(reply)) => ExecResult {
                stdout: format!("{}\n", serde_json::to_string(&reply).unwrap()),
                ..ExecResult::default()
            },
            Ok(None) => ExecResult::default(),
            Err(e) => ExecResult {
                exit_code: 1,
                stderr: e.to_string(),
                ..ExecResult::default()
            },
        })
    });
    log
}

fn orchestrator(mock: &MockConnector) -> Orchestrator {
    Orchestrator::new(Registries::new(), Arc::new(mock.clone()))
        .with_threads(4)
        .with_support_binary(None)
}

fn upload(src: &Path, dest: &Path) -> Artifact {
    Artifact::from(File::new(src, dest, false))
}

#[test]
fn deploy_creates_and_starts() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    let deployed = orch
        .deploy(&names(&["a", "b"]), JAMMY, &DeployRequest::default())
        .unwrap();
    assert_eq!(deployed.into_iter().collect::<Vec<_>>(), names(&["a", "b"]));
    assert_eq!(mock.status_of("a"), Some(InstanceStatus::Running));
    assert_eq!(mock.status_of("b"), Some(InstanceStatus::Running));
    assert_eq!(orch.created().collect::<Vec<_>>(), vec!["a", "b"]);
}

#[test]
fn deploy_is_idempotent() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    orch.deploy(&names(&["a"]), JAMMY, &DeployRequest::default())
        .unwrap();
    orch.deploy(&names(&["a"]), JAMMY, &DeployRequest::default())
        .unwrap();
    assert_eq!(mock.creates(), 1);
    assert_eq!(mock.status_of("a"), Some(InstanceStatus::Running));
}

#[test]
fn deploy_starts_stopped_instance_without_creating() {
    let mock = MockConnector::new();
    mock.insert_instance("old", InstanceStatus::Stopped);
    let mut orch = orchestrator(&mock);
    orch.deploy(&names(&["old"]), JAMMY, &DeployRequest::default())
        .unwrap();
    assert_eq!(mock.creates(), 0);
    assert_eq!(mock.status_of("old"), Some(InstanceStatus::Running));
    assert_eq!(orch.created().count(), 0);
}

#[test]
fn deploy_unknown_image_fails_before_connecting() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    let err = orch
        .deploy(&names(&["a"]), "plan9-amd64", &DeployRequest::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
    assert_eq!(mock.connects(), 0);
}

#[test]
fn support_binary_is_uploaded_on_create_only() {
    let dir = tempfile::tempdir().unwrap();
    let agent = dir.path().join("agent");
    fs::write(&agent, b"agent-binary").unwrap();

    let mock = MockConnector::new();
    mock.insert_instance("existing", InstanceStatus::Running);
    let mut orch = Orchestrator::new(Registries::new(), Arc::new(mock.clone()))
        .with_support_binary(Some(agent));
    orch.deploy(&names(&["fresh", "existing"]), JAMMY, &DeployRequest::default())
        .unwrap();

    assert_eq!(mock.file("fresh", AGENT_PATH).as_deref(), Some(&b"agent-binary"[..]));
    assert!(mock.file("existing", AGENT_PATH).is_none());
}

#[test]
fn deploy_runs_resources_and_provision_script() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("seed.txt");
    fs::write(&src, b"seed").unwrap();
    let dest = dir.path().join("seeded.txt");

    let mock = MockConnector::new();
    let log = emulate_agent(&mock);
    let mut orch = orchestrator(&mock);
    let request = DeployRequest {
        provision_script: Some("apt-get update\n".to_owned()),
        resources: vec![upload(&src, &dest)],
    };
    orch.deploy(&names(&["a"]), JAMMY, &request).unwrap();

    assert_eq!(fs::read(&dest).unwrap(), b"seed");
    assert_eq!(*log.lock().unwrap(), vec![format!("dump {}", dest.display())]);
    assert_eq!(
        mock.file("a", "/root/init/provision").as_deref(),
        Some(&b"apt-get update\n"[..])
    );
    assert!(mock.events().contains(&MockEvent::Exec {
        name: "a".to_owned(),
        argv: names(&["sh", "/root/init/provision"]),
    }));
}

#[test]
fn partial_deploy_failure_keeps_survivors_for_destroy() {
    let mock = MockConnector::new();
    mock.fail_create("b");
    let mut orch = orchestrator(&mock);
    let err = orch
        .deploy(&names(&["a", "b"]), JAMMY, &DeployRequest::default())
        .unwrap_err();
    match err {
        CoreError::PartialFailure {
            succeeded,
            failures,
        } => {
            assert_eq!(succeeded, names(&["a"]));
            assert!(failures.contains_key("b"));
        }
        other => panic!("expected PartialFailure, got {other}"),
    }
    assert_eq!(mock.status_of("a"), Some(InstanceStatus::Running));

    let destroyed = orch.destroy().unwrap();
    assert_eq!(destroyed, names(&["a"]));
    assert_eq!(mock.status_of("a"), None);
    assert_eq!(orch.created().count(), 0);
}

#[test]
fn single_target_failure_keeps_original_error() {
    let mock = MockConnector::new();
    mock.fail_create("a");
    let mut orch = orchestrator(&mock);
    let err = orch
        .deploy(&names(&["a"]), JAMMY, &DeployRequest::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::Runtime(_)), "{err}");
}

#[test]
fn execute_checks_every_target_first() {
    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    let mut orch = orchestrator(&mock);
    let err = orch
        .execute(&names(&["a", "ghost"]), &names(&["true"]))
        .unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotFound(ref n) if n == "ghost"));
    assert_eq!(mock.execs(), 0);
}

#[test]
fn execute_returns_results_keyed_by_instance() {
    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    mock.insert_instance("b", InstanceStatus::Running);
    mock.on_exec(|call| {
        (call.instance == "b").then(|| ExecResult {
            exit_code: 3,
            stderr: "boom".to_owned(),
            ..ExecResult::default()
        })
    });
    let mut orch = orchestrator(&mock);
    let results = orch
        .execute(&names(&["a", "b"]), &names(&["uname", "-a"]))
        .unwrap();
    assert_eq!(results["a"].stdout, "mock-exec: uname -a\n");
    assert_eq!(results["b"].exit_code, 3);
}

#[test]
fn execute_passes_environment() {
    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    mock.on_exec(|call| {
        Some(ExecResult {
            stdout: call.env.get("GREETING").cloned().unwrap_or_default(),
            ..ExecResult::default()
        })
    });
    let mut registries = Registries::new();
    registries
        .env
        .add("GREETING", cleanroom_inject::EnvValue::Scalar("hello".to_owned()));
    let mut orch = Orchestrator::new(registries, Arc::new(mock.clone())).with_support_binary(None);
    let results = orch.execute(&names(&["a"]), &names(&["env"])).unwrap();
    assert_eq!(results["a"].stdout, "hello");
}

#[test]
fn push_rejects_conflicting_owner_without_remote_calls() {
    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    let mut orch = orchestrator(&mock);
    let options = TransferOptions {
        uid: Some(1000),
        username: Some("ubuntu".to_owned()),
        ..TransferOptions::default()
    };
    let artifact = upload(Path::new("/nonexistent"), Path::new("/tmp/x"));
    let err = orch.push("a", &artifact, &options).unwrap_err();
    assert!(matches!(err, CoreError::Configuration(_)));
    assert_eq!(mock.connects(), 0);
    assert_eq!(mock.puts(), 0);
}

#[test]
fn push_delivers_file_and_applies_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("config.yaml");
    fs::write(&src, b"key: value\n").unwrap();
    let dest = dir.path().join("pushed.yaml");

    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    emulate_agent(&mock);
    let mut orch = orchestrator(&mock);
    let options = TransferOptions {
        username: Some("ubuntu".to_owned()),
        mode: Some(0o600),
        ..TransferOptions::default()
    };
    orch.push("a", &upload(&src, &dest), &options).unwrap();

    assert_eq!(fs::read(&dest).unwrap(), b"key: value\n");
    let dest = dest.display().to_string();
    let events = mock.events();
    assert!(events.contains(&MockEvent::Exec {
        name: "a".to_owned(),
        argv: vec!["chown".to_owned(), "ubuntu".to_owned(), dest.clone()],
    }));
    assert!(events.contains(&MockEvent::Exec {
        name: "a".to_owned(),
        argv: vec!["chmod".to_owned(), "600".to_owned(), dest],
    }));
}

#[test]
fn push_to_missing_instance_fails() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    let artifact = upload(Path::new("/nonexistent"), Path::new("/tmp/x"));
    let err = orch
        .push("ghost", &artifact, &TransferOptions::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotFound(_)));
    assert_eq!(mock.puts(), 0);
}

#[test]
fn push_reports_digest_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f");
    fs::write(&src, b"x").unwrap();

    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    mock.on_exec(|call| {
        (call.argv.first().map(String::as_str) == Some("sh")).then(|| ExecResult {
            exit_code: 65,
            stderr: "cleanroom: payload digest mismatch".to_owned(),
            ..ExecResult::default()
        })
    });
    let mut orch = orchestrator(&mock);
    let err = orch
        .push("a", &upload(&src, &dir.path().join("g")), &TransferOptions::default())
        .unwrap_err();
    match err {
        CoreError::RemoteCommand { code, stage, .. } => {
            assert_eq!(code, 65);
            assert!(stage.contains("digest mismatch"));
        }
        other => panic!("expected RemoteCommand, got {other}"),
    }
}

#[test]
fn destroy_keeps_tracking_instances_it_could_not_delete() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    orch.deploy(&names(&["a", "b"]), JAMMY, &DeployRequest::default())
        .unwrap();
    mock.fail_delete("b");

    let err = orch.destroy().unwrap_err();
    match err {
        CoreError::PartialFailure { succeeded, failures } => {
            assert_eq!(succeeded, names(&["a"]));
            assert!(failures["b"].contains("failed to delete"));
        }
        other => panic!("expected PartialFailure, got {other}"),
    }
    assert_eq!(mock.status_of("a"), None);
    assert_eq!(mock.status_of("b"), Some(InstanceStatus::Stopped));
    assert_eq!(orch.created().collect::<Vec<_>>(), vec!["b"]);

    mock.clear_failures("b");
    assert_eq!(orch.destroy().unwrap(), names(&["b"]));
    assert_eq!(mock.status_of("b"), None);
    assert_eq!(orch.created().count(), 0);
}

#[test]
fn destroy_forgets_instances_removed_elsewhere() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    orch.deploy(&names(&["a"]), JAMMY, &DeployRequest::default())
        .unwrap();
    let removed = orchestrator(&mock).discard(&names(&["a", "ghost"])).unwrap();
    assert_eq!(removed, names(&["a"]));

    assert!(orch.destroy().unwrap().is_empty());
    assert_eq!(orch.created().count(), 0);
}

#[test]
fn restart_cycles_each_target() {
    let mock = MockConnector::new();
    mock.insert_instance("up", InstanceStatus::Running);
    mock.insert_instance("down", InstanceStatus::Stopped);
    let mut orch = orchestrator(&mock);
    orch.restart(&names(&["up", "down"])).unwrap();

    assert_eq!(mock.status_of("up"), Some(InstanceStatus::Running));
    assert_eq!(mock.status_of("down"), Some(InstanceStatus::Running));
    let events = mock.events();
    let stop = events
        .iter()
        .position(|e| matches!(e, MockEvent::Stop { name } if name == "up"))
        .unwrap();
    let start = events
        .iter()
        .position(|e| matches!(e, MockEvent::Start { name } if name == "up"))
        .unwrap();
    assert!(stop < start);
    assert!(!events
        .iter()
        .any(|e| matches!(e, MockEvent::Stop { name } if name == "down")));
}

#[test]
fn restart_checks_existence_first() {
    let mock = MockConnector::new();
    mock.insert_instance("up", InstanceStatus::Running);
    let mut orch = orchestrator(&mock);
    let err = orch.restart(&names(&["up", "ghost"])).unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotFound(ref n) if n == "ghost"));
    assert_eq!(mock.status_of("up"), Some(InstanceStatus::Running));
    assert!(!mock
        .events()
        .iter()
        .any(|e| matches!(e, MockEvent::Stop { .. } | MockEvent::Start { .. })));
}

#[test]
fn missing_agent_is_named_in_the_error() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f");
    fs::write(&src, b"x").unwrap();

    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    mock.on_exec(|call| {
        (call.argv.first().map(String::as_str) == Some("sh")).then(|| ExecResult {
            exit_code: 66,
            ..ExecResult::default()
        })
    });
    let mut orch = orchestrator(&mock);
    let err = orch
        .push("a", &upload(&src, &dir.path().join("g")), &TransferOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains(AGENT_PATH), "{err}");
}

#[test]
fn pull_retrieves_directory() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote-logs");
    fs::create_dir_all(remote.join("nested")).unwrap();
    fs::write(remote.join("app.log"), b"started").unwrap();
    fs::write(remote.join("nested/trace.log"), b"trace").unwrap();
    let local = dir.path().join("collected");

    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    let log = emulate_agent(&mock);
    let mut orch = orchestrator(&mock);
    orch.pull("a", &remote, &local, false, &TransferOptions::default())
        .unwrap();

    assert_eq!(fs::read(local.join("app.log")).unwrap(), b"started");
    assert_eq!(fs::read(local.join("nested/trace.log")).unwrap(), b"trace");
    assert_eq!(*log.lock().unwrap(), vec![format!("load {}", local.display())]);
}

#[test]
fn pull_detects_file_in_instance() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("result.json");
    fs::write(&remote, b"{}").unwrap();
    let local = dir.path().join("result-local.json");

    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    emulate_agent(&mock);
    let mut orch = orchestrator(&mock);
    orch.pull("a", &remote, &local, false, &TransferOptions::default())
        .unwrap();

    assert_eq!(fs::read(&local).unwrap(), b"{}");
    let remote = remote.display().to_string();
    assert!(mock.events().contains(&MockEvent::Exec {
        name: "a".to_owned(),
        argv: vec!["test".to_owned(), "-f".to_owned(), remote],
    }));
}

#[test]
fn pull_of_missing_path_fails_before_injecting() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    let log = emulate_agent(&mock);
    let mut orch = orchestrator(&mock);
    let err = orch
        .pull(
            "a",
            &dir.path().join("absent"),
            &dir.path().join("out"),
            false,
            &TransferOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::RemotePathNotFound { .. }), "{err}");
    assert_eq!(mock.puts(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn pull_applies_mode_locally() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("report.txt");
    fs::write(&remote, b"ok").unwrap();
    let local = dir.path().join("report-local.txt");

    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    emulate_agent(&mock);
    let mut orch = orchestrator(&mock);
    let options = TransferOptions {
        mode: Some(0o640),
        ..TransferOptions::default()
    };
    orch.pull("a", &remote, &local, false, &options).unwrap();

    let mode = fs::metadata(&local).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o640);
}

#[test]
fn hooks_run_in_registration_order() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload.txt");
    fs::write(&src, b"data").unwrap();
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");
    let remote_log = dir.path().join("remote.log");
    fs::write(&remote_log, b"log").unwrap();
    let collected = dir.path().join("collected.log");

    let mock = MockConnector::new();
    let log = emulate_agent(&mock);
    let mut registries = Registries::new();
    registries
        .hooks
        .register([
            StartEnvHook {
                name: "first".to_owned(),
                packages: Vec::new(),
                upload: vec![upload(&src, &first)],
            },
            StartEnvHook {
                name: "second".to_owned(),
                packages: Vec::new(),
                upload: vec![upload(&src, &second)],
            },
        ])
        .unwrap();
    registries
        .hooks
        .register([StopEnvHook {
            name: "collect".to_owned(),
            download: vec![upload(&remote_log, &collected)],
        }])
        .unwrap();
    let mut orch = Orchestrator::new(registries, Arc::new(mock.clone())).with_support_binary(None);

    orch.deploy(&names(&["a"]), JAMMY, &DeployRequest::default())
        .unwrap();
    orch.remove(&names(&["a"])).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            format!("dump {}", first.display()),
            format!("dump {}", second.display()),
            format!("load {}", collected.display()),
        ]
    );
    assert_eq!(fs::read(&collected).unwrap(), b"log");
    assert_eq!(mock.status_of("a"), None);
}

#[test]
fn duplicate_hook_is_rejected() {
    let mut registries = Registries::new();
    let hook = StartEnvHook {
        name: "deps".to_owned(),
        packages: Vec::new(),
        upload: Vec::new(),
    };
    registries.hooks.register([hook.clone()]).unwrap();
    let err = registries.hooks.register([hook]).unwrap_err();
    assert!(matches!(err, CoreError::DuplicateHook { ref name, .. } if name == "deps"));
}

#[test]
fn package_env_contributions_reach_the_store_once() {
    let dir = tempfile::tempdir().unwrap();
    let token = dir.path().join("token");
    fs::write(&token, "secret\n").unwrap();

    let mock = MockConnector::new();
    let log = emulate_agent(&mock);
    let mut registries = Registries::new();
    registries
        .hooks
        .register([StartEnvHook {
            name: "libs".to_owned(),
            packages: vec![Package::Charmlib(
                Charmlib::new(&token, names(&["charms.operator_libs_linux.v0.apt"])).unwrap(),
            )],
            upload: Vec::new(),
        }])
        .unwrap();
    let mut orch = Orchestrator::new(registries, Arc::new(mock.clone())).with_support_binary(None);
    orch.deploy(&names(&["a", "b"]), JAMMY, &DeployRequest::default())
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["install charmlib".to_owned(), "install charmlib".to_owned()]
    );
    assert_eq!(orch.registries().env.get("PYTHONPATH").as_deref(), Some("/root/lib"));
}

#[test]
fn env_contributions_do_not_grow_across_serial_runs() {
    let dir = tempfile::tempdir().unwrap();
    let token = dir.path().join("token");
    fs::write(&token, "secret\n").unwrap();

    let mock = MockConnector::new();
    emulate_agent(&mock);
    let mut registries = Registries::new();
    registries
        .hooks
        .register([StartEnvHook {
            name: "libs".to_owned(),
            packages: vec![Package::Charmlib(
                Charmlib::new(&token, names(&["charms.operator_libs_linux.v0.apt"])).unwrap(),
            )],
            upload: Vec::new(),
        }])
        .unwrap();
    let mut orch = Orchestrator::new(registries, Arc::new(mock.clone())).with_support_binary(None);
    Harness::new(&mut orch, smoke())
        .run(Strategy::SerialFresh, &names(&[JAMMY, DEBIAN]))
        .unwrap();
    orch.deploy(&names(&["extra"]), JAMMY, &DeployRequest::default())
        .unwrap();

    assert_eq!(orch.registries().env.get("PYTHONPATH").as_deref(), Some("/root/lib"));
}

#[test]
fn remove_stops_and_deletes() {
    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    mock.insert_instance("b", InstanceStatus::Stopped);
    let mut orch = orchestrator(&mock);
    orch.remove(&names(&["a", "b"])).unwrap();
    assert_eq!(mock.status_of("a"), None);
    assert_eq!(mock.status_of("b"), None);
    let stops = mock
        .events()
        .into_iter()
        .filter(|e| matches!(e, MockEvent::Stop { .. }))
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn public_address_by_family() {
    let mock = MockConnector::new();
    mock.insert_instance("a", InstanceStatus::Running);
    mock.insert_instance("b", InstanceStatus::Running);
    let v4: IpAddr = "10.0.3.15".parse().unwrap();
    let v6: IpAddr = "fd42::15".parse().unwrap();
    mock.set_addresses("a", vec![v6, v4]);
    let orch = orchestrator(&mock);

    assert_eq!(orch.get_public_address("a", false).unwrap(), Some(v4));
    assert_eq!(orch.get_public_address("a", true).unwrap(), Some(v6));
    assert_eq!(orch.get_public_address("b", false).unwrap(), None);
    assert!(matches!(
        orch.get_public_address("ghost", false),
        Err(CoreError::InstanceNotFound(_))
    ));
}

fn smoke() -> Payload {
    Payload::new("smoke", "check() { echo ok; }", "check")
}

#[test]
fn serial_fresh_builds_runs_and_removes() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    let results = Harness::new(&mut orch, smoke())
        .run(Strategy::SerialFresh, &names(&[JAMMY, DEBIAN]))
        .unwrap();

    let keys: Vec<_> = results.keys().cloned().collect();
    assert_eq!(keys, names(&["smoke-debian-12-amd64", "smoke-ubuntu-jammy-amd64"]));
    assert!(results.values().all(ExecResult::success));
    assert_eq!(mock.status_of("smoke-ubuntu-jammy-amd64"), None);
    assert_eq!(mock.creates(), 2);

    // serial: the first instance is gone before the second is created
    let events = mock.events();
    let first_delete = events
        .iter()
        .position(|e| matches!(e, MockEvent::Delete { .. }))
        .unwrap();
    let second_create = events
        .iter()
        .rposition(|e| matches!(e, MockEvent::Create { .. }))
        .unwrap();
    assert!(first_delete < second_create);
}

#[test]
fn parallel_fresh_preserve_keeps_instances() {
    let mock = MockConnector::new();
    let mut orch = orchestrator(&mock);
    let results = Harness::new(&mut orch, smoke())
        .preserve(true)
        .run(Strategy::ParallelFresh, &names(&[JAMMY, DEBIAN]))
        .unwrap();

    assert_eq!(results.len(), 2);
    for name in ["smoke-ubuntu-jammy-amd64", "smoke-debian-12-amd64"] {
        assert_eq!(mock.status_of(name), Some(InstanceStatus::Running));
        assert_eq!(
            mock.file(name, "/root/test").as_deref(),
            Some(&b"#!/bin/sh\ncheck() { echo ok; }\ncheck\n"[..])
        );
        assert_eq!(results[name].stdout, "mock-exec: /root/test\n");
    }
}

#[test]
fn serial_target_reuses_existing_instances() {
    let mock = MockConnector::new();
    mock.insert_instance("ci-1", InstanceStatus::Running);
    mock.insert_instance("ci-2", InstanceStatus::Running);
    let mut orch = orchestrator(&mock);
    let results = Harness::new(&mut orch, smoke())
        .run(Strategy::SerialTarget, &names(&["ci-1", "ci-2"]))
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(mock.creates(), 0);
    assert_eq!(mock.status_of("ci-1"), Some(InstanceStatus::Running));
    assert_eq!(mock.status_of("ci-2"), Some(InstanceStatus::Running));
}

#[test]
fn parallel_target_requires_existing_instances() {
    let mock = MockConnector::new();
    mock.insert_instance("ci-1", InstanceStatus::Running);
    let mut orch = orchestrator(&mock);
    let err = Harness::new(&mut orch, smoke())
        .run(Strategy::ParallelTarget, &names(&["ci-1", "ci-9"]))
        .unwrap_err();
    assert!(matches!(err, CoreError::InstanceNotFound(ref n) if n == "ci-9"));
    assert_eq!(mock.execs(), 0);
    assert_eq!(mock.puts(), 0);
}

#[test]
fn target_strategies_skip_hooks() {
    let dir = tempfile::tempdir().unwrap();
    let token = dir.path().join("token");
    fs::write(&token, "secret\n").unwrap();
    let remote_log = dir.path().join("remote.log");
    fs::write(&remote_log, b"log").unwrap();

    let mock = MockConnector::new();
    mock.insert_instance("ci-1", InstanceStatus::Running);
    mock.insert_instance("ci-2", InstanceStatus::Running);
    let log = emulate_agent(&mock);
    let mut registries = Registries::new();
    registries
        .hooks
        .register([StartEnvHook {
            name: "libs".to_owned(),
            packages: vec![Package::Charmlib(
                Charmlib::new(&token, names(&["charms.operator_libs_linux.v0.apt"])).unwrap(),
            )],
            upload: Vec::new(),
        }])
        .unwrap();
    registries
        .hooks
        .register([StopEnvHook {
            name: "collect".to_owned(),
            download: vec![upload(&remote_log, &dir.path().join("collected.log"))],
        }])
        .unwrap();
    let mut orch = Orchestrator::new(registries, Arc::new(mock.clone())).with_support_binary(None);

    for strategy in [Strategy::SerialTarget, Strategy::ParallelTarget] {
        let results = Harness::new(&mut orch, smoke())
            .run(strategy, &names(&["ci-1", "ci-2"]))
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    assert!(log.lock().unwrap().is_empty());
    assert!(orch.registries().env.get("PYTHONPATH").is_none());
    assert!(!mock
        .events()
        .iter()
        .any(|e| matches!(e, MockEvent::Exec { argv, .. } if argv[0] == "sh")));
    assert_eq!(mock.status_of("ci-1"), Some(InstanceStatus::Running));
}

#[test]
fn failed_fresh_run_discards_its_instances() {
    let mock = MockConnector::new();
    mock.on_exec(|call| {
        (call.argv.first().map(String::as_str) == Some("chmod")).then(|| ExecResult {
            exit_code: 1,
            stderr: "chmod: read-only file system".to_owned(),
            ..ExecResult::default()
        })
    });
    let mut orch = orchestrator(&mock);
    let err = Harness::new(&mut orch, smoke())
        .run(Strategy::SerialFresh, &names(&[JAMMY]))
        .unwrap_err();

    assert!(matches!(err, CoreError::RemoteCommand { ref stage, .. } if stage == "chmod"));
    assert_eq!(mock.status_of("smoke-ubuntu-jammy-amd64"), None);
    assert_eq!(orch.created().count(), 0);
}

#[test]
fn failed_fresh_run_with_preserve_keeps_instances() {
    let mock = MockConnector::new();
    mock.on_exec(|call| {
        (call.argv.first().map(String::as_str) == Some("chmod")).then(|| ExecResult {
            exit_code: 1,
            ..ExecResult::default()
        })
    });
    let mut orch = orchestrator(&mock);
    assert!(Harness::new(&mut orch, smoke())
        .preserve(true)
        .run(Strategy::ParallelFresh, &names(&[JAMMY, DEBIAN]))
        .is_err());

    assert_eq!(mock.status_of("smoke-ubuntu-jammy-amd64"), Some(InstanceStatus::Running));
    assert_eq!(mock.status_of("smoke-debian-12-amd64"), Some(InstanceStatus::Running));
}
