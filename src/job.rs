//! Jobs and their lifecycle.
//!
//! A job is one unit of work: a command, a machine requirement, an output
//! directory, and a config file to snapshot. The lifecycle contract is the
//! same whether the command runs locally, on a remote host through the
//! master/slave protocol, or under a batch queue.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use colored::{ColoredString, Colorize};
use serde::Deserialize;

use crate::error::{StampedeError, CONNECTION_LOST_EXIT_CODE};
use crate::host::Host;
use crate::launcher::{self, EnvOverlay, ProcessHandle, SpawnOptions, POLL_INTERVAL};
use crate::remote;

/// One pending job as read from the queue file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchDescriptor {
    /// The program invocation plus all of its flags.
    pub command: String,
    /// How many machines the job needs. Defaults to 1.
    #[serde(default = "default_machines")]
    pub machines: usize,
    /// Where results for this job are placed.
    pub output_dir: PathBuf,
    /// Configuration file snapshotted into the output directory.
    pub config: PathBuf,
    /// Target index for multi-target runs. Defaults to 0.
    #[serde(default)]
    pub target_index: usize,
}

fn default_machines() -> usize {
    1
}

/// Reads and parses the queue file: a YAML list of launch descriptors.
/// Any missing required field is a configuration error; no job starts.
pub fn read_queue(queue_file: impl AsRef<Path>) -> Result<Vec<LaunchDescriptor>, StampedeError> {
    let queue_file = queue_file.as_ref();
    let fd = File::open(queue_file).map_err(|source| StampedeError::FileRead {
        path: queue_file.to_path_buf(),
        source,
    })?;
    serde_yaml::from_reader(fd).map_err(|e| StampedeError::Parse {
        path: queue_file.to_path_buf(),
        message: e.to_string(),
    })
}

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The command exited on its own with this code.
    Exited(i32),
    /// The operator force-killed the job.
    Killed,
    /// The remote control connection died and the slave reaped the subtree.
    ConnectionLost,
}

impl JobStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            JobStatus::Exited(code) => *code,
            JobStatus::Killed => 128 + nix::sys::signal::Signal::SIGKILL as i32,
            JobStatus::ConnectionLost => CONNECTION_LOST_EXIT_CODE,
        }
    }

    pub fn pretty(&self) -> ColoredString {
        match self {
            JobStatus::Exited(0) => "exited with code 0".green(),
            JobStatus::Exited(code) => format!("exited with code {}", code).red(),
            JobStatus::Killed => "killed".red(),
            JobStatus::ConnectionLost => "lost its control connection".red(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pretty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    Running,
    Done(JobStatus),
}

/// One schedulable unit of work.
pub struct Job {
    descriptor: LaunchDescriptor,
    home: PathBuf,
    machines: Vec<Host>,
    procs: Vec<ProcessHandle>,
    state: JobState,
    /// Set once peers are being force-killed, either by the operator or
    /// because one process failed.
    killing: bool,
    operator_killed: bool,
    first_failure: Option<i32>,
}

impl Job {
    pub fn new(descriptor: LaunchDescriptor, home: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            home: home.into(),
            machines: Vec::new(),
            procs: Vec::new(),
            state: JobState::Pending,
            killing: false,
            operator_killed: false,
            first_failure: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.descriptor.command
    }

    pub fn num_machines(&self) -> usize {
        self.descriptor.machines
    }

    pub fn machines(&self) -> &[Host] {
        &self.machines
    }

    /// Takes back the assigned machines once the job is terminal.
    pub fn release_machines(&mut self) -> Vec<Host> {
        std::mem::take(&mut self.machines)
    }

    pub fn status(&self) -> Option<JobStatus> {
        match self.state {
            JobState::Done(status) => Some(status),
            _ => None,
        }
    }

    /// Hands the job its machine slots. Must happen exactly once, with
    /// exactly as many machines as the descriptor requires, before spawn.
    pub fn assign(&mut self, machines: Vec<Host>) -> Result<(), StampedeError> {
        if machines.len() != self.descriptor.machines {
            return Err(StampedeError::Config(format!(
                "Job '{}' requires {} machines but was assigned {}",
                self.descriptor.command,
                self.descriptor.machines,
                machines.len()
            )));
        }
        self.machines = machines;
        Ok(())
    }

    /// Prepares the output directory, then starts one process per assigned
    /// machine: a direct launcher spawn for the local host, the master side
    /// of the remote protocol otherwise.
    pub fn spawn(&mut self) -> Result<(), StampedeError> {
        if self.machines.len() != self.descriptor.machines {
            return Err(StampedeError::NotAssigned {
                command: self.descriptor.command.clone(),
            });
        }
        prepare_output_dir(&self.descriptor, &self.home)?;

        let working_dir = std::env::current_dir()?;
        for (i, host) in self.machines.iter().enumerate() {
            let capture = self.descriptor.output_dir.join(format!("output.{}", i));
            let handle = if host.is_local() {
                eprintln!("[stampede] Starting process {}: {}", i, self.descriptor.command);
                let env = EnvOverlay::new(i, self.descriptor.target_index, &self.home);
                launcher::spawn(
                    &self.descriptor.command,
                    SpawnOptions {
                        env: Some(&env),
                        working_dir: None,
                        capture: Some(&capture),
                    },
                )?
            } else {
                let ssh_command = remote::master_command(
                    &self.home,
                    host,
                    &working_dir,
                    i,
                    self.descriptor.target_index,
                    &self.descriptor.command,
                );
                eprintln!("[stampede] Starting process {}: {}", i, ssh_command);
                launcher::spawn(
                    &ssh_command,
                    SpawnOptions {
                        env: None,
                        working_dir: None,
                        capture: Some(&capture),
                    },
                )?
            };
            self.procs.push(handle);
        }
        self.state = JobState::Running;
        Ok(())
    }

    /// Non-blocking status check. Returns the terminal status once every
    /// spawned process has been reaped, `None` while anything is running.
    ///
    /// The first non-zero exit force-kills the remaining process groups;
    /// the job stays `Running` until those are reaped too.
    pub fn poll(&mut self) -> Result<Option<JobStatus>, StampedeError> {
        if let JobState::Done(status) = self.state {
            return Ok(Some(status));
        }
        if self.state == JobState::Pending {
            return Ok(None);
        }

        let mut all_exited = true;
        let mut failed = false;
        for (i, proc) in self.procs.iter_mut().enumerate() {
            match proc.poll()? {
                Some(status) => {
                    let code = launcher::exit_code(status);
                    if code != 0 && self.first_failure.is_none() {
                        self.first_failure = Some(code);
                        if !self.killing && !self.operator_killed {
                            eprintln!(
                                "[stampede] Process {} failed with code {}; killing peers",
                                i, code
                            );
                            failed = true;
                        }
                    }
                }
                None => all_exited = false,
            }
        }

        if failed {
            self.killing = true;
            for proc in &mut self.procs {
                proc.kill()?;
            }
            // Peers still need reaping; stay running until they are gone.
            return Ok(None);
        }

        if !all_exited {
            return Ok(None);
        }

        let status = if self.operator_killed {
            JobStatus::Killed
        } else {
            match self.first_failure {
                Some(CONNECTION_LOST_EXIT_CODE) => JobStatus::ConnectionLost,
                Some(code) => JobStatus::Exited(code),
                None => JobStatus::Exited(0),
            }
        };
        self.state = JobState::Done(status);
        Ok(Some(status))
    }

    /// Blocks with bounded polling granularity until the job is terminal.
    pub async fn wait(&mut self) -> Result<JobStatus, StampedeError> {
        loop {
            if let Some(status) = self.poll()? {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Force-kills every process group of the job. Idempotent, and safe to
    /// call concurrently with an in-flight natural exit.
    pub fn kill(&mut self) -> Result<(), StampedeError> {
        match self.state {
            // Never started; nothing to signal.
            JobState::Pending => self.state = JobState::Done(JobStatus::Killed),
            JobState::Running => self.operator_killed = true,
            JobState::Done(_) => {}
        }
        for proc in &mut self.procs {
            proc.kill()?;
        }
        Ok(())
    }

    /// Kill plus reap: used on operator cancellation so no process tree
    /// survives the harness exiting.
    pub async fn kill_and_reap(&mut self) -> Result<JobStatus, StampedeError> {
        self.kill()?;
        self.wait().await
    }
}

/// Creates a job's output directory and snapshots everything needed to
/// reproduce the run: the verbatim command and the config file. Idempotent;
/// a pre-existing directory or symlink is tolerated. Happens exactly once,
/// before the underlying process is spawned or submitted.
pub(crate) fn prepare_output_dir(
    descriptor: &LaunchDescriptor,
    home: &Path,
) -> Result<(), StampedeError> {
    let output_dir = &descriptor.output_dir;
    std::fs::create_dir_all(output_dir)?;
    std::fs::write(output_dir.join("command"), format!("{}\n", descriptor.command))?;
    std::fs::copy(&descriptor.config, output_dir.join("job.cfg")).map_err(|source| {
        StampedeError::FileRead {
            path: descriptor.config.clone(),
            source,
        }
    })?;

    // Convenience symlink to the most recently started job, best effort.
    let results = home.join("results");
    if std::fs::create_dir_all(&results).is_ok() {
        let latest = results.join("latest");
        let _ = std::fs::remove_file(&latest);
        let _ = std::os::unix::fs::symlink(output_dir, &latest);
    }
    Ok(())
}
