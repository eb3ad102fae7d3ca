use super::{json_pretty, spin_fail, spin_ok, spinner, Connection, TransferArgs, EXIT_SUCCESS};
use std::path::Path;

pub fn run(
    conn: &Connection,
    target: &str,
    src: &Path,
    dest: &Path,
    transfer: &TransferArgs,
    json: bool,
) -> Result<u8, String> {
    let options = transfer.options()?;
    let (mut orchestrator, _) = conn.orchestrator()?;

    let pb = (!json).then(|| spinner(&format!("pulling {target}:{}…", src.display())));
    if let Err(e) = orchestrator.pull(target, src, dest, transfer.overwrite, &options) {
        if let Some(pb) = &pb {
            spin_fail(pb, "pull failed");
        }
        return Err(e.to_string());
    }
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("pulled {target}:{} to {}", src.display(), dest.display()));
    }

    if json {
        let payload = serde_json::json!({
            "instance": target,
            "src": src,
            "dest": dest,
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
