mod commands;
mod output;
mod utils;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "silo")]
#[command(about = "silo - cluster storage manager", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    #[arg(short, long, global = true, help = "Verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Quiet output")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        help = "Output format",
        value_enum,
        default_value = "table"
    )]
    format: output::OutputFormat,

    #[arg(
        long,
        global = true,
        help = "Path to the cluster storage configuration",
        default_value = "/etc/silo/storage.cfg"
    )]
    config: PathBuf,

    #[arg(
        long,
        global = true,
        help = "Directory for node-local storage locks",
        default_value = "/var/lock/silo"
    )]
    lock_dir: PathBuf,

    #[arg(
        long,
        global = true,
        help = "Name of this node, for node-restricted storages"
    )]
    node: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .init();

    let ctx = commands::Context::new(cli.config, cli.lock_dir, cli.node, cli.format);
    match commands::execute(cli.command, ctx).await {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
