use crate::commands::Context;
use crate::output::print_success;
use silo_core::Result;

pub async fn execute(storage: String, ctx: Context) -> Result<()> {
    ctx.api.delete(&storage).await?;
    print_success(&format!("Storage '{storage}' removed"));
    Ok(())
}
