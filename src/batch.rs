//! The batch queue adapter.
//!
//! Instead of spawning a process tree directly, a job can be handed to an
//! external HTCondor-style batch system: the adapter writes a submission
//! descriptor, records the correlation (cluster) id the system returns, and
//! from then on tracks the job through the system's own queue listing and
//! historical exit-code records. The adapter is the only entity that ever
//! queries or cancels a cluster id it owns.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::StampedeError;
use crate::job::{prepare_output_dir, JobStatus, LaunchDescriptor};
use crate::launcher::POLL_INTERVAL;

/// How many polls the adapter tolerates between a job leaving the active
/// queue and its exit-code record appearing. The record is written by the
/// batch system asynchronously, so one missed read is normal; a record that
/// never shows up means the job's true outcome is unknown.
pub const MAX_RECORD_ATTEMPTS: u32 = 20;

/// Resource request rendered into every submission descriptor.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub request_cpus: u32,
    pub request_memory: u32,
    pub requirements: String,
    pub rank: String,
}

/// The external batch system's entry points. Abstracted so tests can stand
/// in a mock for the real `condor_*` tools.
#[async_trait]
pub trait BatchSystem: Send + Sync {
    /// Submits a descriptor file; returns the submit tool's raw stdout.
    async fn submit(&self, submit_file: &Path) -> Result<String, StampedeError>;
    /// Cluster ids currently in the active queue.
    async fn active_ids(&self) -> Result<Vec<String>, StampedeError>;
    /// Exit code recorded for a finished cluster id, if available yet.
    async fn exit_record(&self, id: &str) -> Result<Option<i32>, StampedeError>;
    /// Removes a cluster id from the queue. Idempotent.
    async fn remove(&self, id: &str) -> Result<(), StampedeError>;
}

/// The real thing, shelling out to the HTCondor command line tools.
pub struct CondorSystem;

#[async_trait]
impl BatchSystem for CondorSystem {
    async fn submit(&self, submit_file: &Path) -> Result<String, StampedeError> {
        let output = Command::new("condor_submit")
            .arg(submit_file)
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn active_ids(&self) -> Result<Vec<String>, StampedeError> {
        let output = Command::new("condor_q")
            .args(["-format", "%d\\n", "ClusterId"])
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_owned)
            .collect())
    }

    async fn exit_record(&self, id: &str) -> Result<Option<i32>, StampedeError> {
        let output = Command::new("condor_history")
            .args([id, "-limit", "1", "-format", "%d", "ExitCode"])
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim().parse().ok())
    }

    async fn remove(&self, id: &str) -> Result<(), StampedeError> {
        // condor_rm of an already-gone cluster fails; that is fine.
        let _ = Command::new("condor_rm").arg(id).output().await?;
        Ok(())
    }
}

/// Pulls the cluster id out of the submit tool's response
/// ("... submitted to cluster NNN.").
pub fn parse_cluster_id(submit_output: &str) -> Option<String> {
    let rest = submit_output.split("submitted to cluster").nth(1)?;
    let id: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    (!id.is_empty()).then_some(id)
}

/// A job handed off to the batch system.
pub struct BatchJob {
    descriptor: LaunchDescriptor,
    home: PathBuf,
    system: Arc<dyn BatchSystem>,
    settings: BatchSettings,
    cluster_id: Option<String>,
    record_attempts: u32,
    status: Option<JobStatus>,
}

impl BatchJob {
    pub fn new(
        descriptor: LaunchDescriptor,
        home: impl Into<PathBuf>,
        system: Arc<dyn BatchSystem>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            descriptor,
            home: home.into(),
            system,
            settings,
            cluster_id: None,
            record_attempts: 0,
            status: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.descriptor.command
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref()
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.status
    }

    /// Prepares the output directory, writes the submission descriptor and
    /// job script, and submits. A response without a recognizable cluster
    /// id is fatal: a malformed id could never be polled or canceled.
    pub async fn submit(&mut self) -> Result<(), StampedeError> {
        prepare_output_dir(&self.descriptor, &self.home)?;
        let output_dir = &self.descriptor.output_dir;
        let submit_file = output_dir.join("batch_job.submit");
        std::fs::write(&submit_file, self.render_submit_descriptor())?;
        std::fs::write(output_dir.join("batch_job.sh"), self.render_job_script())?;

        let response = self.system.submit(&submit_file).await?;
        let id = parse_cluster_id(&response).ok_or_else(|| {
            StampedeError::BatchAnomaly(format!(
                "No cluster id in submit response: {:?}",
                response.trim()
            ))
        })?;
        eprintln!("[stampede] Batch cluster {} submitted: {}", id, self.descriptor.command);
        self.cluster_id = Some(id);
        Ok(())
    }

    /// Non-blocking status check against the batch system's own registries.
    /// A job that left the active queue without an exit-code record after
    /// the bounded retry window is a fatal anomaly.
    pub async fn poll(&mut self) -> Result<Option<JobStatus>, StampedeError> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let id = match &self.cluster_id {
            Some(id) => id.clone(),
            None => return Ok(None),
        };

        if self.system.active_ids().await?.contains(&id) {
            return Ok(None);
        }
        match self.system.exit_record(&id).await? {
            Some(code) => {
                let status = JobStatus::Exited(code);
                self.status = Some(status);
                Ok(Some(status))
            }
            None => {
                self.record_attempts += 1;
                if self.record_attempts >= MAX_RECORD_ATTEMPTS {
                    return Err(StampedeError::BatchAnomaly(format!(
                        "No exit-code record for cluster {} after {} attempts",
                        id, MAX_RECORD_ATTEMPTS
                    )));
                }
                Ok(None)
            }
        }
    }

    /// Polls until the job is terminal.
    pub async fn wait(&mut self) -> Result<JobStatus, StampedeError> {
        loop {
            if let Some(status) = self.poll().await? {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Cancels the submission. Idempotent.
    pub async fn kill(&mut self) -> Result<(), StampedeError> {
        if let Some(id) = self.cluster_id.clone() {
            self.system.remove(&id).await?;
            if self.status.is_none() {
                self.status = Some(JobStatus::Killed);
            }
        }
        Ok(())
    }

    fn render_submit_descriptor(&self) -> String {
        let dir = self.descriptor.output_dir.display();
        format!(
            "GetEnv = True\n\
             Universe = vanilla\n\
             Notification = Error\n\
             should_transfer_files = IF_NEEDED\n\
             WhenToTransferOutput = ON_EXIT\n\
             Executable = /bin/bash\n\
             Arguments = {dir}/batch_job.sh\n\
             Log = /tmp/stampede.$ENV(USER).log\n\
             RequestCpus = {cpus}\n\
             RequestMemory = {memory}\n\
             Requirements = {requirements}\n\
             Rank = {rank}\n\
             Error = {dir}/error\n\
             Output = {dir}/output\n\
             queue 1\n",
            dir = dir,
            cpus = self.settings.request_cpus,
            memory = self.settings.request_memory,
            requirements = self.settings.requirements,
            rank = self.settings.rank,
        )
    }

    fn render_job_script(&self) -> String {
        let escaped = self.descriptor.command.replace('"', "\\\"");
        format!(
            "#!/bin/bash\n\n\
             {home}/target/release/stampede-slave --batch --home {home} \
             --working-dir {dir} --process-index 0 --target-index {target} \
             --command \"{escaped}\"\n",
            home = self.home.display(),
            dir = self.descriptor.output_dir.display(),
            target = self.descriptor.target_index,
            escaped = escaped,
        )
    }
}
