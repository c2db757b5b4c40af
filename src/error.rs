use std::path::PathBuf;

use thiserror::Error;

/// Process exit code for configuration errors (bad hosts file, bad queue
/// file, missing descriptor fields).
pub const CONFIG_ERROR_EXIT_CODE: i32 = 2;
/// Process exit code when the batch system misbehaves (no parseable cluster
/// id, no exit-code record).
pub const BATCH_ANOMALY_EXIT_CODE: i32 = 3;
/// Process exit code after an operator interrupt.
pub const CANCELLED_EXIT_CODE: i32 = 130;
/// Exit code of the slave binary when the control connection was lost.
/// Deliberately outside the range a well-behaved job would use.
pub const CONNECTION_LOST_EXIT_CODE: i32 = 250;

#[derive(Error, Debug)]
pub enum StampedeError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to spawn or control a process: {0}")]
    Process(#[from] std::io::Error),
    #[error("Job '{command}' was spawned before machines were assigned")]
    NotAssigned { command: String },
    #[error("Batch system anomaly: {0}")]
    BatchAnomaly(String),
}

impl StampedeError {
    /// Maps an error to the process exit code the harness reports.
    pub fn exit_code(&self) -> i32 {
        match self {
            StampedeError::BatchAnomaly(_) => BATCH_ANOMALY_EXIT_CODE,
            _ => CONFIG_ERROR_EXIT_CODE,
        }
    }
}
