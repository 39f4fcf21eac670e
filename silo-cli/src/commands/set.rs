use crate::commands::{Context, StorageOptions};
use crate::output::print_success;
use silo_core::Result;

pub async fn execute(
    storage: String,
    digest: Option<String>,
    options: StorageOptions,
    ctx: Context,
) -> Result<()> {
    let params = options.into_params()?;

    // Without an explicit digest, guard against concurrent edits with the
    // digest of the configuration as it stands now.
    let digest = match digest {
        Some(digest) => digest,
        None => ctx.api.read(&storage).await?.1,
    };

    let new_digest = ctx.api.update(&storage, &params, Some(&digest)).await?;
    print_success(&format!("Storage '{storage}' updated (digest {new_digest})"));
    Ok(())
}
