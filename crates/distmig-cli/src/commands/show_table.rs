use super::{json_pretty, EXIT_SUCCESS};
use distmig_store::{MigrationLayout, MountTable};

pub fn run(layout: &MigrationLayout, json: bool) -> Result<u8, String> {
    let path = layout.mount_table();
    let table = MountTable::read_if_exists(&path).map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&table.get_devices())?);
    } else if table.is_empty() {
        println!("mount table {} is empty", path.display());
    } else {
        println!("{:<28} {:<36} {:<8} OPTIONS", "DEVICE", "MOUNTPOINT", "TYPE");
        for record in &table {
            println!(
                "{:<28} {:<36} {:<8} {}",
                record.device().display(),
                record.mountpoint().display(),
                record.filesystem_type(),
                record.options()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
