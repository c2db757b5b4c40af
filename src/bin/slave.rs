//! The slave side of the remote launch protocol.
//!
//! Bootstrapped on the target host through a single ssh session by the
//! master, or from a batch job script with `--batch`. Spawns the real
//! command and guarantees the process tree is reaped even if the control
//! connection dies.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use stampede::error::CONNECTION_LOST_EXIT_CODE;
use stampede::job::JobStatus;
use stampede::launcher::{self, EnvOverlay, SpawnOptions};
use stampede::remote::{ParentPidChannel, Slave};

#[derive(Parser, Debug)]
#[command(version, about = "Stampede slave: spawns and supervises one job process tree")]
struct Args {
    /// Harness home directory on this host
    #[arg(long)]
    home: PathBuf,

    /// Directory to run the command in
    #[arg(long)]
    working_dir: PathBuf,

    /// Process index of this peer within its job
    #[arg(long)]
    process_index: usize,

    /// Target index for multi-target runs
    #[arg(long, default_value = "0")]
    target_index: usize,

    /// Batch mode: plain spawn and wait, no control-connection watch
    #[arg(long)]
    batch: bool,

    /// The command to run
    #[arg(long)]
    command: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let code = if args.batch {
        run_batch(&args).await
    } else {
        run_supervised(args).await
    };
    match code {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("[stampede-slave] {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Supervised mode: poll the process and the control channel; on either
/// connection loss or exit, nothing of the tree survives.
async fn run_supervised(args: Args) -> std::io::Result<i32> {
    let mut slave = Slave::new(
        args.command,
        args.working_dir,
        args.process_index,
        args.target_index,
        args.home,
        ParentPidChannel,
    );
    slave.spawn()?;
    match slave.wait().await? {
        JobStatus::ConnectionLost => Ok(CONNECTION_LOST_EXIT_CODE),
        status => Ok(status.exit_code()),
    }
}

/// Batch mode: the batch system owns the lifecycle, so just spawn in a
/// fresh process group and wait.
async fn run_batch(args: &Args) -> std::io::Result<i32> {
    let env = EnvOverlay::new(args.process_index, args.target_index, &args.home);
    let mut handle = launcher::spawn(
        &args.command,
        SpawnOptions {
            env: Some(&env),
            working_dir: Some(&args.working_dir),
            capture: None,
        },
    )?;
    let status = handle.wait().await?;
    Ok(launcher::exit_code(status))
}
