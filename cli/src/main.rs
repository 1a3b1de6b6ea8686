//! dgc — Data Guard convergence from the command line.
//!
//! # Usage
//!
//! ```text
//! dgc provision --instance ora-1
//! dgc provision --instance ora-2 --skip-kernel
//! dgc converge --primary ora-1 --standby ora-2
//! dgc status --primary ora-1 --standby ora-2
//! dgc steps
//! ```
//!
//! Exit status is 0 when the pair (or instance) converged, 1 when it did not,
//! and 2 when no report could be produced.

mod commands;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dgc", version, about = "Converge two database instances into a Data Guard pair")]
pub struct Cli {
    /// Settings file; defaults to ./dgc.yaml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cloud project; defaults to the settings file, then gcloud config.
    #[arg(long, global = true)]
    pub project: Option<String>,

    /// Cloud zone; defaults to the settings file, then gcloud config.
    #[arg(long, global = true)]
    pub zone: Option<String>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// SYS password shared by both databases.
    #[arg(
        long,
        global = true,
        env = "DGC_SYS_PASSWORD",
        default_value = "DataGu4rd#2025",
        hide_env_values = true,
        hide_default_value = true
    )]
    pub sys_password: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, install and prepare one instance.
    Provision(ProvisionArgs),
    /// Run the Data Guard pipeline against a pair and report its status.
    Converge(ConvergeArgs),
    /// Report replication status without changing anything.
    Status(PairArgs),
    /// List pipeline steps.
    Steps {
        /// List the single-instance setup steps instead.
        #[arg(long)]
        setup: bool,
    },
}

#[derive(clap::Args, Debug)]
pub struct ProvisionArgs {
    #[arg(long, default_value = "ora-1")]
    pub instance: String,
    #[arg(long)]
    pub swlib_bucket: Option<String>,
    #[arg(long)]
    pub media_version: Option<String>,
    /// Diskgroups besides the CDB one, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub extra_diskgroups: Option<Vec<String>>,
    #[arg(long)]
    pub run_log: Option<PathBuf>,
    #[arg(long)]
    pub skip_create: bool,
    #[arg(long)]
    pub skip_kernel: bool,
    #[arg(long)]
    pub skip_install: bool,
    #[arg(long)]
    pub skip_asmfd: bool,
    /// Delete the instance and exit.
    #[arg(long)]
    pub delete: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PairArgs {
    #[arg(long, default_value = "ora-1")]
    pub primary: String,
    #[arg(long, default_value = "ora-2")]
    pub standby: String,
}

#[derive(clap::Args, Debug)]
pub struct ConvergeArgs {
    #[command(flatten)]
    pub pair: PairArgs,
    #[arg(long)]
    pub run_log: Option<PathBuf>,
    #[arg(long)]
    pub skip_primary_config: bool,
    #[arg(long)]
    pub skip_duplication: bool,
    /// Stop cleanly once this step has succeeded.
    #[arg(long)]
    pub stop_after: Option<String>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let code = match commands::run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("dgc: {:#}", e);
            2
        }
    };
    process::exit(code);
}
