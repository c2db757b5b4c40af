//! Stampede: a multi-machine compute-job launcher.

// Command line arguments and configuration.
pub mod config;
// Error handling and exit codes.
pub mod error;
// How to parse and represent the machine pool.
pub mod host;
// The process launcher: process groups, poll/wait/kill.
pub mod launcher;
// Jobs and their lifecycle.
pub mod job;
// The ssh master/slave remote launch protocol.
pub mod remote;
// The batch queue adapter.
pub mod batch;
// Scheduling strategies and the run driver.
pub mod scheduler;

pub use batch::{BatchJob, BatchSettings, BatchSystem, CondorSystem};
pub use config::{Config, Strategy};
pub use error::StampedeError;
pub use host::{get_hosts, local_hostname, Host, MachinePool};
pub use job::{read_queue, Job, JobStatus, LaunchDescriptor};
pub use launcher::{EnvOverlay, ProcessHandle};
pub use remote::{ControlChannel, ParentPidChannel, Slave};
pub use scheduler::{run, BatchScheduler, DirectScheduler, RunSummary, Scheduler};
