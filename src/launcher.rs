//! The process launcher.
//!
//! Every command is spawned through `sh -c` as the leader of a fresh process
//! group, so that killing the group terminates the entire subtree a command
//! may have fanned out into. Poll, wait, and kill all operate on the process
//! group handle, never on a shared process table.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Environment variable naming the process index of a spawned peer.
pub const PROCESS_INDEX_ENV: &str = "STAMPEDE_PROCESS_INDEX";
/// Environment variable naming the target index for multi-target runs.
pub const TARGET_INDEX_ENV: &str = "STAMPEDE_TARGET_INDEX";
/// Environment variable pointing at the harness home directory.
pub const HOME_ENV: &str = "STAMPEDE_HOME";

/// Granularity of all polling waits in the harness.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Environment handed to every spawned process so cooperating peers of a
/// multi-machine job can find each other and shared resources.
#[derive(Debug, Clone)]
pub struct EnvOverlay {
    pub process_index: usize,
    pub target_index: usize,
    pub home: PathBuf,
}

impl EnvOverlay {
    pub fn new(process_index: usize, target_index: usize, home: impl Into<PathBuf>) -> Self {
        Self {
            process_index,
            target_index,
            home: home.into(),
        }
    }

    fn apply(&self, command: &mut Command) {
        command.env(PROCESS_INDEX_ENV, self.process_index.to_string());
        command.env(TARGET_INDEX_ENV, self.target_index.to_string());
        command.env(HOME_ENV, &self.home);
        if let Some(lib_dir) = runtime_lib_dir(&self.home) {
            command.env("LD_LIBRARY_PATH", lib_dir);
        }
    }
}

/// Locates the runtime dependency's library directory from the
/// `RUNTIME_HOME` entry of `<home>/Makefile.config`, if present.
pub fn runtime_lib_dir(home: &Path) -> Option<PathBuf> {
    let file = File::open(home.join("Makefile.config")).ok()?;
    for line in BufReader::new(file).lines() {
        let line = line.ok()?;
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("RUNTIME_HOME") {
            let value = rest.trim_start().strip_prefix('=')?.trim();
            if !value.is_empty() {
                return Some(PathBuf::from(value).join("lib"));
            }
        }
    }
    None
}

/// How to spawn a command: optional environment overlay, working directory,
/// and a file capturing combined stdout/stderr.
#[derive(Debug, Default)]
pub struct SpawnOptions<'a> {
    pub env: Option<&'a EnvOverlay>,
    pub working_dir: Option<&'a Path>,
    pub capture: Option<&'a Path>,
}

/// Spawns `command` through the shell as a new process group and returns the
/// handle owning that group.
pub fn spawn(command: &str, options: SpawnOptions<'_>) -> std::io::Result<ProcessHandle> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).process_group(0);
    if let Some(env) = options.env {
        env.apply(&mut cmd);
    }
    if let Some(dir) = options.working_dir {
        cmd.current_dir(dir);
    }
    if let Some(path) = options.capture {
        let out = File::create(path)?;
        let err = out.try_clone()?;
        cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
    }
    let child = cmd.spawn()?;
    // The child was made its own process-group leader, so its pid is the pgid.
    let pgid = Pid::from_raw(child.id().expect("child reaped before wait") as i32);
    Ok(ProcessHandle { child, pgid })
}

/// The live OS-level resource representing one spawned process group.
/// Owned exclusively by the job (or slave) that created it.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pgid: Pid,
}

impl ProcessHandle {
    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    /// Non-blocking status check. `None` means still running.
    pub fn poll(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Waits for the process with bounded polling granularity. The handle
    /// may stand in for a remote process tree, so there is no OS-level
    /// blocking primitive to lean on.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Forcefully terminates the entire process group. Idempotent: killing
    /// an already-exited group is not an error.
    pub fn kill(&mut self) -> std::io::Result<()> {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }
}

/// Whether any process in the group still exists. Used to verify lifecycle
/// completeness after a wait returns.
pub fn process_group_exists(pgid: Pid) -> bool {
    !matches!(killpg(pgid, None), Err(Errno::ESRCH))
}

/// Exit code of a terminated process, following the shell convention of
/// 128 + signal number for signal deaths.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn spawn_and_wait_propagates_exit_code() {
        let mut handle = spawn("exit 7", SpawnOptions::default()).unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(exit_code(status), 7);
    }

    #[tokio::test]
    async fn poll_does_not_block_while_running() {
        let mut handle = spawn("sleep 10", SpawnOptions::default()).unwrap();
        assert!(handle.poll().unwrap().is_none());
        handle.kill().unwrap();
        let status = handle.wait().await.unwrap();
        assert_ne!(exit_code(status), 0);
    }

    #[tokio::test]
    async fn kill_terminates_the_whole_process_group() {
        // The shell fans out into a child; killing the group must take
        // both down.
        let mut handle = spawn("sleep 30 & sleep 30", SpawnOptions::default()).unwrap();
        let pgid = handle.pgid();
        assert!(process_group_exists(pgid));
        handle.kill().unwrap();
        handle.wait().await.unwrap();
        assert!(!process_group_exists(pgid));
    }

    #[tokio::test]
    async fn kill_is_idempotent_after_natural_exit() {
        let mut handle = spawn("true", SpawnOptions::default()).unwrap();
        let status = handle.wait().await.unwrap();
        assert_eq!(exit_code(status), 0);
        // Both kills land after the group is gone.
        handle.kill().unwrap();
        handle.kill().unwrap();
    }

    #[tokio::test]
    async fn env_overlay_reaches_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("out");
        let env = EnvOverlay::new(3, 1, dir.path());
        let mut handle = spawn(
            &format!("echo \"${}:${}\"", PROCESS_INDEX_ENV, TARGET_INDEX_ENV),
            SpawnOptions {
                env: Some(&env),
                capture: Some(&capture),
                ..Default::default()
            },
        )
        .unwrap();
        handle.wait().await.unwrap();
        let out = std::fs::read_to_string(&capture).unwrap();
        assert_eq!(out.trim(), "3:1");
    }

    #[test]
    fn runtime_lib_dir_reads_makefile_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("Makefile.config")).unwrap();
        writeln!(file, "# build settings").unwrap();
        writeln!(file, "RUNTIME_HOME = /opt/runtime").unwrap();
        assert_eq!(
            runtime_lib_dir(dir.path()),
            Some(PathBuf::from("/opt/runtime/lib"))
        );
    }

    #[test]
    fn runtime_lib_dir_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(runtime_lib_dir(dir.path()), None);
    }
}
