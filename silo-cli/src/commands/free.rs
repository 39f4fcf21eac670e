use crate::commands::Context;
use crate::output::print_success;
use silo_core::Result;

pub async fn execute(volid: String, ctx: Context) -> Result<()> {
    ctx.manager.free_image(&volid).await?;
    print_success(&format!("Freed volume '{volid}'"));
    Ok(())
}
