use crate::commands::Context;
use crate::output::{format_bytes, OutputFormatter};
use colored::*;
use serde::Serialize;
use silo_core::{Result, StorageStatus};
use silo_storage::StorageConfig;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct StorageRow {
    name: String,
    #[tabled(rename = "type")]
    ty: String,
    status: String,
    total: String,
    used: String,
    available: String,
    #[tabled(rename = "%")]
    percent: String,
}

impl StorageRow {
    fn new(name: &str, scfg: &StorageConfig, status: &StorageStatus) -> Self {
        let state = if scfg.disable {
            "disabled".yellow().to_string()
        } else if status.active {
            "active".green().to_string()
        } else {
            "inactive".red().to_string()
        };
        let percent = if status.total > 0 {
            format!("{:.2}%", status.used as f64 * 100.0 / status.total as f64)
        } else {
            "-".to_string()
        };
        StorageRow {
            name: name.to_string(),
            ty: scfg.ty.clone(),
            status: state,
            total: format_bytes(status.total),
            used: format_bytes(status.used),
            available: format_bytes(status.avail),
            percent,
        }
    }
}

pub async fn execute(storage: Option<String>, ctx: Context) -> Result<()> {
    let rows = match storage {
        Some(storeid) => {
            let status = ctx.manager.status(&storeid).await?;
            let (scfg, _) = ctx.api.read(&storeid).await?;
            vec![StorageRow::new(&storeid, &scfg, &status)]
        }
        None => ctx
            .manager
            .status_all()
            .await?
            .iter()
            .map(|(storeid, scfg, status)| StorageRow::new(storeid, scfg, status))
            .collect(),
    };

    println!("{}", ctx.format.format_table(rows));
    Ok(())
}
