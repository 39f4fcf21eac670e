use crate::commands::Context;
use crate::output::print_success;
use crate::utils::parse_size_kb;
use silo_core::{ImageFormat, Result};

pub async fn execute(
    storage: String,
    vmid: u32,
    size: String,
    name: Option<String>,
    format: Option<String>,
    ctx: Context,
) -> Result<()> {
    let size_kb = parse_size_kb(&size)?;
    let format = format.map(|f| f.parse::<ImageFormat>()).transpose()?;

    let volid = ctx
        .manager
        .alloc_image(&storage, vmid, format, name.as_deref(), size_kb)
        .await?;
    print_success(&format!("Allocated volume '{volid}'"));
    println!("{volid}");
    Ok(())
}
