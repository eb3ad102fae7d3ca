use super::{json_pretty, spin_fail, spin_ok, spinner, Connection, TransferArgs, EXIT_SUCCESS};
use cleanroom_inject::{Artifact, Directory, File};
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
    let artifact = if src.is_dir() {
        Artifact::from(Directory::new(src, dest, transfer.overwrite))
    } else {
        Artifact::from(File::new(src, dest, transfer.overwrite))
    };
    let (mut orchestrator, _) = conn.orchestrator()?;

    let pb = (!json).then(|| spinner(&format!("pushing {} to {target}…", src.display())));
    if let Err(e) = orchestrator.push(target, &artifact, &options) {
        if let Some(pb) = &pb {
            spin_fail(pb, "push failed");
        }
        return Err(e.to_string());
    }
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("pushed {} to {target}:{}", src.display(), dest.display()));
    }

    if json {
        let payload = serde_json::json!({
            "instance": target,
            "src": src,
            "dest": dest,
            "directory": artifact.is_directory(),
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
