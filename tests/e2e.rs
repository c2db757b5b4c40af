//! End-to-end tests for Stampede scheduling, driving real local processes
//! through the public API the same way the `stampede` binary does.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stampede::{
    get_hosts, local_hostname, read_queue, run, DirectScheduler, Job, JobStatus, MachinePool,
};

fn write_hosts_file(dir: &Path, hosts: &[&str]) -> std::path::PathBuf {
    let path = dir.join("hosts.yaml");
    let contents: String = hosts.iter().map(|h| format!("- {}\n", h)).collect();
    std::fs::write(&path, contents).unwrap();
    path
}

fn write_queue_file(dir: &Path, entries: &[(&str, usize)]) -> std::path::PathBuf {
    let config = dir.join("run.cfg");
    std::fs::write(&config, "mode = test\n").unwrap();
    let path = dir.join("queue.yaml");
    let mut contents = String::new();
    for (i, (command, machines)) in entries.iter().enumerate() {
        contents.push_str(&format!(
            "- command: \"{}\"\n  machines: {}\n  output_dir: {}\n  config: {}\n",
            command,
            machines,
            dir.join(format!("results/job{}", i)).display(),
            config.display(),
        ));
    }
    std::fs::write(&path, contents).unwrap();
    path
}

fn scheduler_for(dir: &Path, entries: &[(&str, usize)], pool_size: usize) -> DirectScheduler {
    let local = local_hostname().unwrap();
    let hosts_file = write_hosts_file(dir, &vec![local.as_str(); pool_size]);
    let queue_file = write_queue_file(dir, entries);

    let hosts = get_hosts(hosts_file).unwrap();
    let jobs: Vec<Job> = read_queue(queue_file)
        .unwrap()
        .into_iter()
        .map(|descriptor| Job::new(descriptor, dir))
        .collect();
    DirectScheduler::new(jobs, MachinePool::new(hosts))
}

fn not_cancelled() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[tokio::test]
async fn single_host_single_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler_for(dir.path(), &[("echo ok", 1)], 1);

    let summary = run(&mut scheduler, Duration::from_millis(100), not_cancelled())
        .await
        .unwrap();
    assert!(!summary.cancelled);
    assert_eq!(summary.outcomes, vec![JobStatus::Exited(0)]);
    assert_eq!(summary.exit_code(), 0);
    // The machine came back and nothing is left running.
    assert_eq!(scheduler.running(), 0);
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(scheduler.pool().available(), 1);

    // Result directory layout: verbatim command, config snapshot, output.
    let job_dir = dir.path().join("results/job0");
    assert_eq!(
        std::fs::read_to_string(job_dir.join("command")).unwrap(),
        "echo ok\n"
    );
    assert_eq!(
        std::fs::read_to_string(job_dir.join("job.cfg")).unwrap(),
        "mode = test\n"
    );
    assert_eq!(
        std::fs::read_to_string(job_dir.join("output.0")).unwrap(),
        "ok\n"
    );
}

#[tokio::test]
async fn first_failing_exit_code_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler_for(dir.path(), &[("exit 4", 1), ("echo ok", 1)], 1);

    let summary = run(&mut scheduler, Duration::from_millis(100), not_cancelled())
        .await
        .unwrap();
    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.exit_code(), 4);
}

#[tokio::test]
async fn oversubscribed_pool_still_drains_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let entries = [
        ("sleep 1", 1),
        ("sleep 1", 1),
        ("sleep 1", 1),
        ("echo done", 1),
    ];
    let mut scheduler = scheduler_for(dir.path(), &entries, 2);

    let summary = run(&mut scheduler, Duration::from_millis(100), not_cancelled())
        .await
        .unwrap();
    assert_eq!(summary.outcomes.len(), 4);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(scheduler.pool().available(), 2);
}

#[tokio::test]
async fn multi_machine_job_sees_distinct_process_indices() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler_for(dir.path(), &[("echo $STAMPEDE_PROCESS_INDEX", 2)], 2);

    let summary = run(&mut scheduler, Duration::from_millis(100), not_cancelled())
        .await
        .unwrap();
    assert_eq!(summary.exit_code(), 0);

    let job_dir = dir.path().join("results/job0");
    assert_eq!(
        std::fs::read_to_string(job_dir.join("output.0")).unwrap(),
        "0\n"
    );
    assert_eq!(
        std::fs::read_to_string(job_dir.join("output.1")).unwrap(),
        "1\n"
    );
}

#[tokio::test]
async fn cancellation_kills_running_jobs_and_discards_pending() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler_for(dir.path(), &[("sleep 30", 1), ("echo never", 1)], 1);

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        flag.store(true, Ordering::SeqCst);
    });

    let summary = run(&mut scheduler, Duration::from_millis(100), cancelled)
        .await
        .unwrap();
    assert!(summary.cancelled);
    // The running job was killed; the pending one was never started.
    assert_eq!(summary.outcomes, vec![JobStatus::Killed]);
    assert!(!dir.path().join("results/job1/command").exists());
    assert_eq!(scheduler.pool().available(), 1);
}
