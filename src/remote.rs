//! The remote launch protocol.
//!
//! The master encodes a job's command into a fully-escaped invocation of the
//! slave binary and runs it through a single `ssh` session, spawned locally
//! as its own process group. The slave performs the real spawn on the target
//! host, supervises it, and independently watches for loss of the control
//! connection so the process tree is reaped even if the master disappears.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::unistd::{getppid, Pid};

use crate::host::Host;
use crate::job::JobStatus;
use crate::launcher::{self, EnvOverlay, ProcessHandle, SpawnOptions, POLL_INTERVAL};

/// Builds the ssh invocation that bootstraps the slave on a remote host.
///
/// The returned string is spawned locally as a process group, so the
/// master's poll/wait/kill reflect the ssh connection's own lifetime.
/// Double quotes in the command survive two layers of shell quoting.
pub fn master_command(
    home: &Path,
    host: &Host,
    working_dir: &Path,
    process_index: usize,
    target_index: usize,
    command: &str,
) -> String {
    let escaped = command.replace('"', "\\\"");
    let slave_command = format!(
        "{}/target/release/stampede-slave --home {} --working-dir {} \
         --process-index {} --target-index {} --command \\\"{}\\\"",
        home.display(),
        home.display(),
        working_dir.display(),
        process_index,
        target_index,
        escaped,
    );
    format!("ssh -x {} \"{}\"", host.hostname, slave_command)
}

/// Capability to detect that the controlling connection is gone.
///
/// The production implementation polls the parent pid; a reimplementation
/// can substitute a heartbeat without touching the slave's state machine.
pub trait ControlChannel {
    fn is_lost(&self) -> bool;
}

/// Detects connection loss by reparenting: when the ssh connection dies,
/// the slave becomes a child of init.
pub struct ParentPidChannel;

impl ControlChannel for ParentPidChannel {
    fn is_lost(&self) -> bool {
        getppid() == Pid::from_raw(1)
    }
}

/// The slave side of the protocol: spawns the real command on the target
/// host and guarantees the process group (and the credential helper) never
/// outlives `wait()`.
pub struct Slave<C: ControlChannel> {
    command: String,
    working_dir: PathBuf,
    process_index: usize,
    target_index: usize,
    home: PathBuf,
    channel: C,
    proc: Option<ProcessHandle>,
    helper: Option<ProcessHandle>,
}

impl<C: ControlChannel> Slave<C> {
    pub fn new(
        command: String,
        working_dir: PathBuf,
        process_index: usize,
        target_index: usize,
        home: PathBuf,
        channel: C,
    ) -> Self {
        Self {
            command,
            working_dir,
            process_index,
            target_index,
            home,
            channel,
            proc: None,
            helper: None,
        }
    }

    /// Spawns the command in the job's working directory, plus the
    /// best-effort credential-renewal helper.
    pub fn spawn(&mut self) -> std::io::Result<()> {
        eprintln!(
            "[stampede-slave] Starting process {}: {}",
            self.process_index, self.command
        );
        let env = EnvOverlay::new(self.process_index, self.target_index, &self.home);
        self.proc = Some(launcher::spawn(
            &self.command,
            SpawnOptions {
                env: Some(&env),
                working_dir: Some(&self.working_dir),
                capture: None,
            },
        )?);
        self.helper = spawn_credential_helper();
        Ok(())
    }

    /// Waits for the command to finish or the control connection to die,
    /// whichever comes first. Either way the spawned process group and the
    /// helper are dead by the time this returns.
    pub async fn wait(&mut self) -> std::io::Result<JobStatus> {
        let proc = self
            .proc
            .as_mut()
            .expect("Slave::wait called before spawn");
        loop {
            if let Some(status) = proc.poll()? {
                // Reap any stragglers the command left in its group.
                proc.kill()?;
                kill_helper(&mut self.helper).await;
                let code = launcher::exit_code(status);
                eprintln!(
                    "[stampede-slave] Process {} exited with code {}",
                    self.process_index, code
                );
                return Ok(JobStatus::Exited(code));
            }

            if self.channel.is_lost() {
                // The connection is gone; nobody is listening anymore.
                proc.kill()?;
                proc.wait().await?;
                kill_helper(&mut self.helper).await;
                return Ok(JobStatus::ConnectionLost);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Spawns the credential-renewal helper that keeps Kerberos/AFS tickets
/// alive over long runs. Missing `krenew` is not an error.
fn spawn_credential_helper() -> Option<ProcessHandle> {
    // Probe first so hosts without krenew stay silent.
    let present = std::process::Command::new("sh")
        .args(["-c", "command -v krenew"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !present {
        return None;
    }
    launcher::spawn("krenew -K 60 -t", SpawnOptions::default()).ok()
}

async fn kill_helper(helper: &mut Option<ProcessHandle>) {
    if let Some(mut handle) = helper.take() {
        let _ = handle.kill();
        let _ = handle.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::launcher::process_group_exists;

    struct FlagChannel(Arc<AtomicBool>);

    impl ControlChannel for FlagChannel {
        fn is_lost(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn slave_for(command: &str, channel: FlagChannel) -> Slave<FlagChannel> {
        let dir = std::env::temp_dir();
        Slave::new(command.to_string(), dir.clone(), 0, 0, dir, channel)
    }

    #[test]
    fn master_command_escapes_both_quoting_layers() {
        let home = PathBuf::from("/shared/stampede");
        let host = Host::new("hostA");
        let cmd = master_command(
            &home,
            &host,
            Path::new("/work"),
            2,
            1,
            "run --label \"fft\"",
        );
        assert!(cmd.starts_with("ssh -x hostA \""));
        assert!(cmd.contains("/shared/stampede/target/release/stampede-slave"));
        assert!(cmd.contains("--process-index 2"));
        assert!(cmd.contains("--target-index 1"));
        // The job's own quotes survive both the ssh layer and the slave layer.
        assert!(cmd.contains("\\\"run --label \\\"fft\\\"\\\""));
    }

    #[tokio::test]
    async fn slave_returns_the_job_exit_code() {
        let mut slave = slave_for("exit 5", FlagChannel(Arc::new(AtomicBool::new(false))));
        slave.spawn().unwrap();
        let status = slave.wait().await.unwrap();
        assert_eq!(status, JobStatus::Exited(5));
    }

    #[tokio::test]
    async fn connection_loss_kills_the_subtree() {
        let lost = Arc::new(AtomicBool::new(false));
        let mut slave = slave_for("sleep 30", FlagChannel(Arc::clone(&lost)));
        slave.spawn().unwrap();
        let pgid = slave.proc.as_ref().unwrap().pgid();
        assert!(process_group_exists(pgid));

        lost.store(true, Ordering::SeqCst);
        let status = slave.wait().await.unwrap();
        // Never a fabricated exit code on this path.
        assert_eq!(status, JobStatus::ConnectionLost);
        assert!(!process_group_exists(pgid));
    }

    #[tokio::test]
    async fn natural_exit_wins_over_a_later_loss() {
        let lost = Arc::new(AtomicBool::new(false));
        let mut slave = slave_for("true", FlagChannel(Arc::clone(&lost)));
        slave.spawn().unwrap();
        let status = slave.wait().await.unwrap();
        assert_eq!(status, JobStatus::Exited(0));
    }
}
