use crate::commands::Context;
use silo_core::Result;

pub async fn execute(volid: String, snapshot: Option<String>, ctx: Context) -> Result<()> {
    let resolved = ctx
        .manager
        .volume_path(&volid, snapshot.as_deref())
        .await?;
    println!("{}", resolved.path);
    Ok(())
}
