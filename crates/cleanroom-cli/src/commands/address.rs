use super::{json_pretty, Connection, EXIT_FAILURE, EXIT_SUCCESS};

pub fn run(conn: &Connection, target: &str, ipv6: bool, json: bool) -> Result<u8, String> {
    let (orchestrator, _) = conn.orchestrator()?;
    let address = orchestrator
        .get_public_address(target, ipv6)
        .map_err(|e| e.to_string())?;

    if json {
        let payload = serde_json::json!({ "instance": target, "address": address });
        println!("{}", json_pretty(&payload)?);
    } else if let Some(addr) = address {
        println!("{addr}");
    } else {
        let family = if ipv6 { "IPv6" } else { "IPv4" };
        eprintln!("{target} has no public {family} address");
    }
    Ok(if address.is_some() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
