use crate::commands::Context;
use crate::output::{format_bytes, OutputFormatter};
use serde::Serialize;
use silo_core::Result;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct VolumeRow {
    volid: String,
    format: String,
    size: String,
    vmid: String,
}

pub async fn execute(storage: String, vmid: Option<u32>, ctx: Context) -> Result<()> {
    let entries = ctx.manager.list_images(&storage, vmid).await?;
    let rows: Vec<VolumeRow> = entries
        .into_iter()
        .map(|entry| VolumeRow {
            volid: entry.volid,
            format: entry.format.to_string(),
            size: format_bytes(entry.size),
            vmid: entry
                .vmid
                .map(|vmid| vmid.to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    println!("{}", ctx.format.format_table(rows));
    Ok(())
}
