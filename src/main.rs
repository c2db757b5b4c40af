use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use stampede::batch::{BatchJob, BatchSettings, BatchSystem, CondorSystem};
use stampede::config::{Config, Strategy};
use stampede::error::{StampedeError, CANCELLED_EXIT_CODE};
use stampede::host::{get_hosts, MachinePool};
use stampede::job::{read_queue, Job};
use stampede::scheduler::{run, BatchScheduler, DirectScheduler, Scheduler};

async fn run_harness(cli: &Config) -> Result<i32, StampedeError> {
    let home = cli.resolve_home()?;
    let queue = read_queue(&cli.queue_file)?;
    eprintln!("[stampede] {} job(s) in {}", queue.len(), cli.queue_file);
    std::fs::create_dir_all(&cli.results_dir)?;

    // Strategy is selected exactly once; everything downstream goes through
    // the scheduler lifecycle contract.
    let mut scheduler: Box<dyn Scheduler + Send> = match cli.strategy {
        Strategy::Direct => {
            let hosts = get_hosts(&cli.hosts_file)?;
            eprintln!("[stampede] Machine pool: {:?}", hosts);
            let jobs: Vec<Job> = queue
                .into_iter()
                .map(|descriptor| Job::new(descriptor, &home))
                .collect();
            Box::new(DirectScheduler::new(jobs, MachinePool::new(hosts)))
        }
        Strategy::Batch => {
            let system: Arc<dyn BatchSystem> = Arc::new(CondorSystem);
            let settings = BatchSettings {
                request_cpus: cli.request_cpus,
                request_memory: cli.request_memory,
                requirements: cli.requirements.clone(),
                rank: cli.rank.clone(),
            };
            let jobs: Vec<BatchJob> = queue
                .into_iter()
                .map(|descriptor| {
                    BatchJob::new(descriptor, &home, Arc::clone(&system), settings.clone())
                })
                .collect();
            Box::new(BatchScheduler::new(jobs, cli.submit_ceiling()))
        }
    };

    // An operator interrupt flips the flag; the run loop then kills every
    // running job before exiting.
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[stampede] Interrupt received. Killing running jobs.");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let summary = run(scheduler.as_mut(), cli.poll_interval(), cancelled).await?;
    if summary.cancelled {
        return Ok(CANCELLED_EXIT_CODE);
    }
    eprintln!("[stampede] Run complete: {} job(s) finished", summary.outcomes.len());
    Ok(summary.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    match run_harness(&cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("[stampede] {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
