use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sediag")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIME"), ")"))]
#[command(about = "Docker host and container diagnostic report tool", long_about = None)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Suppress progress output on stderr
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run all checks and write a report bundle
    Report {
        /// Target container ID or name
        #[arg(short, long)]
        container: Option<String>,

        /// Time window for events and logs (e.g. 30m, 24h, 2d)
        #[arg(long, default_value = "24h")]
        since: String,

        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        output: String,

        /// Report checks that could not run instead of skipping them
        #[arg(short, long)]
        verbose: bool,

        /// Directory receiving raw artifacts and the .tar.gz bundle
        #[arg(long, env = "SEDIAG_DATA_DIR", default_value = "/tmp/sediag")]
        data_dir: PathBuf,

        /// JSON config file
        #[arg(long, env = "SEDIAG_CONFIG")]
        config: Option<PathBuf>,

        /// Run the orchestrated etcd performance probe in the target container
        #[arg(long)]
        etcd_perf: bool,
    },

    /// List the checks of the report without running them
    List {
        /// JSON config file
        #[arg(long, env = "SEDIAG_CONFIG")]
        config: Option<PathBuf>,

        /// Include the etcd performance probe
        #[arg(long)]
        etcd_perf: bool,
    },
}
