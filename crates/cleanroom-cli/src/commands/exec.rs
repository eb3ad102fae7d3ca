use super::{report, Connection};

pub fn run(
    conn: &Connection,
    targets: &[String],
    command: &[String],
    json: bool,
) -> Result<u8, String> {
    let (mut orchestrator, _) = conn.orchestrator()?;
    let results = orchestrator
        .execute(targets, command)
        .map_err(|e| e.to_string())?;
    report(&results, json)
}
