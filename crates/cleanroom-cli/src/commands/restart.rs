use super::{json_pretty, spin_fail, spin_ok, spinner, Connection, EXIT_SUCCESS};

pub fn run(conn: &Connection, targets: &[String], json: bool) -> Result<u8, String> {
    let (mut orchestrator, _) = conn.orchestrator()?;
    let pb = (!json).then(|| spinner(&format!("restarting {}…", targets.join(", "))));
    if let Err(e) = orchestrator.restart(targets) {
        if let Some(pb) = &pb {
            spin_fail(pb, "restart failed");
        }
        return Err(e.to_string());
    }
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("restarted {}", targets.join(", ")));
    }
    if json {
        println!("{}", json_pretty(&serde_json::json!({ "restarted": targets }))?);
    }
    Ok(EXIT_SUCCESS)
}
