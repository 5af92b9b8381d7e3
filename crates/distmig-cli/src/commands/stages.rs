use super::{json_pretty, EXIT_SUCCESS};
use distmig_core::StageName;
use serde::Serialize;

#[derive(Serialize)]
struct StageEntry {
    position: usize,
    name: StageName,
    description: &'static str,
}

pub fn run(json: bool) -> Result<u8, String> {
    let entries: Vec<StageEntry> = StageName::ALL
        .into_iter()
        .map(|stage| StageEntry {
            position: stage.position(),
            name: stage,
            description: stage.description(),
        })
        .collect();

    if json {
        println!("{}", json_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!(
                "{:>2}. {:<18} {}",
                entry.position,
                entry.name.as_str(),
                entry.description
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
