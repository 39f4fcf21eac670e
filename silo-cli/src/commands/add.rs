use crate::commands::{Context, StorageOptions};
use crate::output::print_success;
use silo_core::Result;

pub async fn execute(
    ty: String,
    storage: String,
    options: StorageOptions,
    ctx: Context,
) -> Result<()> {
    let mut params = options.into_params()?;
    params.insert("type".to_string(), ty);
    params.insert("storage".to_string(), storage.clone());

    ctx.api.create(&params).await?;
    print_success(&format!("Storage '{storage}' created"));
    Ok(())
}
