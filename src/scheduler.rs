//! Scheduling strategies.
//!
//! Both strategies share one lifecycle contract: `start` validates and
//! initializes, `iterate` runs one admission-and-poll round, `stop` tears
//! everything down on operator cancellation. A single control task drives
//! the loop with a fixed poll interval; concurrency comes entirely from the
//! external process trees running on their own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use itertools::Itertools;

use crate::batch::BatchJob;
use crate::error::StampedeError;
use crate::host::MachinePool;
use crate::job::{Job, JobStatus};

#[async_trait]
pub trait Scheduler {
    /// Validates configuration and prepares the run.
    async fn start(&mut self) -> Result<(), StampedeError>;
    /// Runs one scheduling iteration. Returns `true` once the run is done.
    async fn iterate(&mut self) -> Result<bool, StampedeError>;
    /// Force-kills everything running; pending jobs are never started.
    async fn stop(&mut self);
    /// Terminal statuses observed so far, in completion order.
    fn outcomes(&self) -> &[JobStatus];
}

/// Greedily dispatches pending jobs onto the machine pool as machines free
/// up. Admission happens in pending order; completion order between
/// concurrently running jobs is unconstrained.
pub struct DirectScheduler {
    pending: VecDeque<Job>,
    running: Vec<Job>,
    pool: MachinePool,
    outcomes: Vec<JobStatus>,
}

impl DirectScheduler {
    pub fn new(jobs: Vec<Job>, pool: MachinePool) -> Self {
        Self {
            pending: jobs.into(),
            running: Vec::new(),
            pool,
            outcomes: Vec::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn pool(&self) -> &MachinePool {
        &self.pool
    }

    /// Admits as many pending jobs as the pool permits, in pending order.
    fn schedule(&mut self) -> Result<(), StampedeError> {
        let mut i = 0;
        while i < self.pending.len() {
            let needed = self.pending[i].num_machines();
            match self.pool.take(needed) {
                Some(machines) => match self.pending.remove(i) {
                    Some(mut job) => {
                        job.assign(machines)?;
                        job.spawn()?;
                        self.running.push(job);
                    }
                    None => self.pool.release(machines),
                },
                None => i += 1,
            }
        }
        Ok(())
    }

    /// Polls every running job; terminal jobs return their machines.
    fn check_active(&mut self) -> Result<(), StampedeError> {
        let mut i = 0;
        while i < self.running.len() {
            match self.running[i].poll()? {
                Some(status) => {
                    let mut job = self.running.remove(i);
                    eprintln!(
                        "[stampede] Job '{}' on {} {}",
                        job.command(),
                        job.machines().iter().join(", "),
                        status.pretty()
                    );
                    self.pool.release(job.release_machines());
                    self.outcomes.push(status);
                }
                None => i += 1,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Scheduler for DirectScheduler {
    async fn start(&mut self) -> Result<(), StampedeError> {
        for job in &self.pending {
            if job.num_machines() == 0 {
                return Err(StampedeError::Config(format!(
                    "Job '{}' requires zero machines",
                    job.command()
                )));
            }
            if job.num_machines() > self.pool.total() {
                return Err(StampedeError::Config(format!(
                    "Job '{}' requires {} machines but the pool only has {}",
                    job.command(),
                    job.num_machines(),
                    self.pool.total()
                )));
            }
        }
        Ok(())
    }

    async fn iterate(&mut self) -> Result<bool, StampedeError> {
        self.schedule()?;
        self.check_active()?;
        Ok(self.pending.is_empty() && self.running.is_empty())
    }

    async fn stop(&mut self) {
        self.pending.clear();
        for job in &mut self.running {
            eprintln!(
                "{} {}",
                "[stampede] Interrupted. Killing job:".red(),
                job.command()
            );
            if let Ok(status) = job.kill_and_reap().await {
                self.outcomes.push(status);
            }
            self.pool.release(job.release_machines());
        }
        self.running.clear();
    }

    fn outcomes(&self) -> &[JobStatus] {
        &self.outcomes
    }
}

/// Hands jobs to the external batch system, capping how many submissions
/// are simultaneously in flight so thousands of near-simultaneous jobs do
/// not flood the system's front door.
pub struct BatchScheduler {
    pending: VecDeque<BatchJob>,
    in_flight: Vec<BatchJob>,
    ceiling: usize,
    outcomes: Vec<JobStatus>,
}

impl BatchScheduler {
    pub fn new(jobs: Vec<BatchJob>, ceiling: usize) -> Self {
        Self {
            pending: jobs.into(),
            in_flight: Vec::new(),
            ceiling,
            outcomes: Vec::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl Scheduler for BatchScheduler {
    async fn start(&mut self) -> Result<(), StampedeError> {
        if self.ceiling == 0 {
            return Err(StampedeError::Config(
                "Batch submission ceiling must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    async fn iterate(&mut self) -> Result<bool, StampedeError> {
        while self.in_flight.len() < self.ceiling {
            match self.pending.pop_front() {
                Some(mut job) => {
                    job.submit().await?;
                    self.in_flight.push(job);
                }
                None => break,
            }
        }

        let mut i = 0;
        while i < self.in_flight.len() {
            match self.in_flight[i].poll().await? {
                Some(status) => {
                    let job = self.in_flight.remove(i);
                    eprintln!(
                        "[stampede] Batch cluster {} {}",
                        job.cluster_id().unwrap_or("?"),
                        status.pretty()
                    );
                    self.outcomes.push(status);
                }
                None => i += 1,
            }
        }
        Ok(self.pending.is_empty() && self.in_flight.is_empty())
    }

    async fn stop(&mut self) {
        self.pending.clear();
        for job in &mut self.in_flight {
            eprintln!(
                "{} {}",
                "[stampede] Interrupted. Removing batch cluster:".red(),
                job.cluster_id().unwrap_or("?")
            );
            let _ = job.kill().await;
        }
        self.in_flight.clear();
    }

    fn outcomes(&self) -> &[JobStatus] {
        &self.outcomes
    }
}

/// Summary of a finished (or cancelled) run.
#[derive(Debug)]
pub struct RunSummary {
    pub cancelled: bool,
    pub outcomes: Vec<JobStatus>,
}

impl RunSummary {
    /// The harness propagates the first failing job's exit code; 0 when
    /// every job exited cleanly.
    pub fn exit_code(&self) -> i32 {
        self.outcomes
            .iter()
            .map(JobStatus::exit_code)
            .find(|&code| code != 0)
            .unwrap_or(0)
    }
}

/// Drives a scheduler to completion or to a clean abort. The cancellation
/// flag is checked once per iteration, so an operator interrupt reaches
/// every running job's kill before the harness exits.
pub async fn run(
    scheduler: &mut (dyn Scheduler + Send),
    poll_interval: Duration,
    cancelled: Arc<AtomicBool>,
) -> Result<RunSummary, StampedeError> {
    scheduler.start().await?;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            scheduler.stop().await;
            return Ok(RunSummary {
                cancelled: true,
                outcomes: scheduler.outcomes().to_vec(),
            });
        }
        if scheduler.iterate().await? {
            return Ok(RunSummary {
                cancelled: false,
                outcomes: scheduler.outcomes().to_vec(),
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}
