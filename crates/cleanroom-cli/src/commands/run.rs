use super::{report, spin_fail, spin_ok, spinner, Connection};
use cleanroom_core::{DeployRequest, Harness, Payload, Strategy};
use std::fs;
use std::path::PathBuf;

#[derive(Debug)]
pub struct RunArgs {
    pub strategy: String,
    pub name: String,
    pub source: PathBuf,
    pub entry: String,
    pub interpreter: String,
    pub images: Vec<String>,
    pub targets: Vec<String>,
    pub preserve: bool,
    pub provision: Option<PathBuf>,
}

pub fn run(conn: &Connection, args: &RunArgs, json: bool) -> Result<u8, String> {
    let strategy: Strategy = args
        .strategy
        .parse()
        .map_err(|e: cleanroom_core::CoreError| e.to_string())?;
    let names = if strategy.is_fresh() {
        if args.images.is_empty() {
            return Err(format!(
                "configuration error: the {strategy} strategy needs at least one --image"
            ));
        }
        &args.images
    } else {
        if args.targets.is_empty() {
            return Err(format!(
                "configuration error: the {strategy} strategy needs at least one --target"
            ));
        }
        &args.targets
    };

    let source = fs::read_to_string(&args.source)
        .map_err(|e| format!("failed to read {}: {e}", args.source.display()))?;
    let provision_script = args
        .provision
        .as_ref()
        .map(|p| fs::read_to_string(p).map_err(|e| format!("failed to read {}: {e}", p.display())))
        .transpose()?;
    let payload = Payload::new(&args.name, source, &args.entry).with_interpreter(&args.interpreter);

    let (mut orchestrator, project) = conn.orchestrator()?;
    let preserve = args.preserve || project.run.preserve;
    let request = DeployRequest {
        provision_script,
        resources: Vec::new(),
    };

    let pb = (!json).then(|| spinner(&format!("running '{}' ({strategy})…", args.name)));
    let outcome = Harness::new(&mut orchestrator, payload)
        .preserve(preserve)
        .with_request(request)
        .run(strategy, names);
    let results = match outcome {
        Ok(results) => {
            if let Some(pb) = &pb {
                spin_ok(pb, &format!("ran '{}' on {} instance(s)", args.name, results.len()));
            }
            results
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "run failed");
            }
            return Err(e.to_string());
        }
    };
    report(&results, json)
}
