use crate::injectable::EntryPoint;
use std::fmt::Write as _;

/// Where the orchestrator uploads its own binary inside a new instance.
pub const AGENT_PATH: &str = "/root/.init/cleanroom/cleanroom";

/// Exit status of a bootstrap whose payload failed the digest check.
pub const INTEGRITY_EXIT_CODE: i32 = 65;

/// Exit status of a bootstrap that found no executable at [`AGENT_PATH`].
pub const AGENT_MISSING_EXIT_CODE: i32 = 66;

const WRAP: usize = 76;
const HEREDOC: &str = "CLEANROOM_PAYLOAD";

/// Render the sh script that verifies `encoded` and hands it to the agent.
///
/// The script needs only `mktemp`, `base64`, `sha224sum` and `cut`, so the
/// digest is checked before the agent binary ever reads the payload.
pub fn render(entry: EntryPoint, checksum: &str, encoded: &str) -> String {
    let mut script = String::with_capacity(encoded.len() + 512);
    script.push_str("#!/bin/sh\nset -eu\n");
    script.push_str("payload=\"$(mktemp)\"\n");
    script.push_str("trap 'rm -f \"$payload\"' EXIT\n");
    let _ = writeln!(script, "cat > \"$payload\" <<'{HEREDOC}'");
    for chunk in encoded.as_bytes().chunks(WRAP) {
        script.push_str(&String::from_utf8_lossy(chunk));
        script.push('\n');
    }
    let _ = writeln!(script, "{HEREDOC}");
    script.push_str("actual=\"$(base64 -d \"$payload\" | sha224sum | cut -d' ' -f1)\"\n");
    let _ = writeln!(script, "if [ \"$actual\" != \"{checksum}\" ]; then");
    let _ = writeln!(
        script,
        "    echo \"cleanroom: payload digest mismatch (expected {checksum}, got $actual)\" >&2"
    );
    let _ = writeln!(script, "    exit {INTEGRITY_EXIT_CODE}");
    script.push_str("fi\n");
    let _ = writeln!(script, "if [ ! -x \"{AGENT_PATH}\" ]; then");
    let _ = writeln!(
        script,
        "    echo \"cleanroom: nothing executable at {AGENT_PATH}\" >&2"
    );
    let _ = writeln!(script, "    exit {AGENT_MISSING_EXIT_CODE}");
    script.push_str("fi\n");
    let _ = writeln!(
        script,
        "\"{AGENT_PATH}\" agent {entry} --checksum {checksum} --payload \"$payload\""
    );
    script
}
