//! Configuration for Stampede.
//!
//! Holds the clap structs for command line arguments and flags, plus the
//! batch-queue resource settings that end up in submission descriptors.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Direct dispatch across the machine pool (d) or batch queue (b)
    #[arg(value_enum)]
    pub strategy: Strategy,

    /// Queue file listing pending jobs. Defaults to `queue.yaml`
    #[arg(long, default_value = "queue.yaml")]
    pub queue_file: String,

    /// Host file listing the machine pool. Defaults to `hosts.yaml`
    #[arg(long, default_value = "hosts.yaml")]
    pub hosts_file: String,

    /// Directory where per-job result directories are placed
    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Harness home directory. Defaults to the current working directory
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Scheduler poll interval in milliseconds
    #[arg(long, default_value = "500")]
    pub poll_interval_ms: u64,

    /// (Batch) Cap on simultaneously in-flight submissions.
    /// Defaults to the number of CPUs on this host
    #[arg(long)]
    pub submit_ceiling: Option<usize>,

    /// (Batch) CPUs requested per submission
    #[arg(long, default_value = "8")]
    pub request_cpus: u32,

    /// (Batch) Memory requested per submission, in MB
    #[arg(long, default_value = "1024")]
    pub request_memory: u32,

    /// (Batch) Placement requirement expression
    #[arg(long, default_value = "true")]
    pub requirements: String,

    /// (Batch) Placement rank expression
    #[arg(long, default_value = "true")]
    pub rank: String,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, ValueEnum)]
pub enum Strategy {
    #[value(name = "d")]
    Direct,
    #[value(name = "b")]
    Batch,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolves the harness home directory: the `--home` flag if given,
    /// otherwise the current working directory.
    pub fn resolve_home(&self) -> std::io::Result<PathBuf> {
        match &self.home {
            Some(home) => Ok(home.clone()),
            None => std::env::current_dir(),
        }
    }

    pub fn submit_ceiling(&self) -> usize {
        self.submit_ceiling.unwrap_or_else(num_cpus::get)
    }
}
