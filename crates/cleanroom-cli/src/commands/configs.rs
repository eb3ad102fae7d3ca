use super::{json_pretty, Connection, EXIT_SUCCESS};
use cleanroom_schema::InstanceConfig;

pub fn run(conn: &Connection, json: bool) -> Result<u8, String> {
    let project = conn.project()?;
    let registries = conn.registries(&project)?;
    let store = &registries.configs;
    let configs = store
        .names()
        .map(|name| store.fetch(name))
        .collect::<Result<Vec<InstanceConfig>, _>>()
        .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&configs)?);
    } else {
        println!("{:<28} {:<12} ALIAS", "NAME", "TYPE");
        for config in &configs {
            println!(
                "{:<28} {:<12} {}",
                config.name.as_str(),
                config.instance_type.to_string(),
                config.source.alias
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
