//! Runs inside an instance, invoked by a bootstrap script after its own
//! digest check. The payload is verified again before anything is rebuilt.

use super::{EXIT_FAILURE, EXIT_SUCCESS};
use cleanroom_inject::{dispatch, EntryPoint, InjectError, INTEGRITY_EXIT_CODE};
use std::fs;
use std::path::Path;

pub fn run(entry: EntryPoint, checksum: &str, payload: &Path) -> Result<u8, String> {
    let encoded = fs::read_to_string(payload)
        .map_err(|e| format!("failed to read payload {}: {e}", payload.display()))?;
    match dispatch(entry, checksum, &encoded) {
        Ok(Some(reply)) => {
            let line = serde_json::to_string(&reply)
                .map_err(|e| format!("JSON serialization failed: {e}"))?;
            println!("{line}");
            Ok(EXIT_SUCCESS)
        }
        Ok(None) => Ok(EXIT_SUCCESS),
        Err(e @ InjectError::Integrity { .. }) => {
            eprintln!("error: {e}");
            Ok(u8::try_from(INTEGRITY_EXIT_CODE).unwrap_or(EXIT_FAILURE))
        }
        Err(e) => Err(e.to_string()),
    }
}
