use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use afrun::error::{AfrunError, Result};
use afrun::scheduler::{
    DeviceProbe, DevicePool, Job, Pipeline, StageSpec, StageStateMachine, StageStatus, StaticProbe,
};

fn prep_eval() -> StageStateMachine {
    let pipeline = Pipeline::new(vec![
        StageSpec::new("prep").with_flags(true, false),
        StageSpec::new("eval").after("prep").with_flags(false, true),
    ])
    .unwrap();
    StageStateMachine::new(pipeline)
}

fn temp_job(dir: &TempDir) -> Job {
    Job::new("J1", dir.path().join("J1").join("af3"))
}

fn marker(job: &Job, name: &str) -> bool {
    job.work_dir.join(name).exists()
}

// =============================================================================
// Stage state machine
// =============================================================================

#[test]
fn test_fresh_stage_is_pending() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Pending);
}

#[test]
fn test_status_transitions() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    states.begin(&job, "prep").unwrap();
    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Running);
    assert!(marker(&job, "prep.running"));

    states.complete(&job, "prep", true).unwrap();
    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Done);
    assert!(marker(&job, "prep.done"));
    assert!(!marker(&job, "prep.running"));

    states.begin(&job, "eval").unwrap();
    states.complete(&job, "eval", false).unwrap();
    assert_eq!(states.status(&job, "eval").unwrap(), StageStatus::Error);
    assert!(marker(&job, "eval.error"));
    assert!(!marker(&job, "eval.running"));
}

#[test]
fn test_running_marker_blocks_every_stage_of_job() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    states.begin(&job, "prep").unwrap();
    states.complete(&job, "prep", true).unwrap();
    states.begin(&job, "eval").unwrap();

    // prep is done, but the job as a whole is busy
    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Running);
    assert_eq!(states.status(&job, "eval").unwrap(), StageStatus::Running);
}

#[test]
fn test_unknown_running_marker_counts_as_running() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);
    job.ensure_dir().unwrap();
    std::fs::write(job.work_dir.join("relax.running"), b"").unwrap();

    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Running);
}

#[test]
fn test_unmet_dependency_reports_error() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    assert_eq!(states.status(&job, "eval").unwrap(), StageStatus::Error);
    let eval = states.pipeline().stage("eval").unwrap();
    assert!(!states.dependency_met(&job, eval));

    states.begin(&job, "prep").unwrap();
    states.complete(&job, "prep", true).unwrap();
    assert!(states.dependency_met(&job, eval));
    assert_eq!(states.status(&job, "eval").unwrap(), StageStatus::Pending);
}

#[test]
fn test_error_marker_is_retryable_and_cleared() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    states.begin(&job, "prep").unwrap();
    states.complete(&job, "prep", false).unwrap();
    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Error);

    // Retry: running and error never coexist
    states.begin(&job, "prep").unwrap();
    assert!(marker(&job, "prep.running"));
    assert!(!marker(&job, "prep.error"));

    states.complete(&job, "prep", true).unwrap();
    assert!(marker(&job, "prep.done"));
    assert!(!marker(&job, "prep.error"));
    assert!(!marker(&job, "prep.running"));
}

#[test]
fn test_second_claim_of_same_stage_fails() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    states.begin(&job, "prep").unwrap();
    let err = states.begin(&job, "prep").unwrap_err();
    assert!(matches!(err, AfrunError::AlreadyRunning { .. }));
}

#[test]
fn test_claim_withdrawn_when_other_stage_running() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    states.begin(&job, "prep").unwrap();
    let err = states.begin(&job, "eval").unwrap_err();
    assert!(matches!(err, AfrunError::AlreadyRunning { .. }));
    assert!(!marker(&job, "eval.running"));
    assert!(marker(&job, "prep.running"));
}

#[test]
fn test_stale_running_marker_persists_until_cleared() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    // A runner that died after begin() leaves the marker behind
    states.begin(&job, "prep").unwrap();
    let restarted = prep_eval();
    assert_eq!(restarted.status(&job, "prep").unwrap(), StageStatus::Running);

    assert!(restarted.clear_running(&job, "prep").unwrap());
    assert!(!restarted.clear_running(&job, "prep").unwrap());
    assert_eq!(restarted.status(&job, "prep").unwrap(), StageStatus::Pending);
}

#[test]
fn test_clear_all_running_removes_markers_of_unknown_stages() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);
    job.ensure_dir().unwrap();
    // Left over by a pipeline that had a relax stage
    std::fs::write(job.work_dir.join("relax.running"), b"").unwrap();
    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Running);

    let cleared = states.clear_all_running(&job).unwrap();

    assert_eq!(cleared, vec!["relax"]);
    assert!(!marker(&job, "relax.running"));
    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Pending);
    assert!(states.clear_all_running(&job).unwrap().is_empty());
}

#[test]
fn test_clear_all_running_on_missing_job_dir() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    assert!(states.clear_all_running(&job).unwrap().is_empty());
}

#[test]
fn test_running_and_error_pair_resolved() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);
    job.ensure_dir().unwrap();
    // Crash inside begin(): running marker written, old error marker not yet removed
    std::fs::write(job.work_dir.join("prep.error"), b"").unwrap();
    std::fs::write(job.work_dir.join("prep.running"), b"").unwrap();

    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Running);

    states.complete(&job, "prep", true).unwrap();
    assert!(marker(&job, "prep.done"));
    assert!(!marker(&job, "prep.running"));
    assert!(!marker(&job, "prep.error"));
}

#[test]
fn test_running_and_error_pair_cleared_to_error() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);
    job.ensure_dir().unwrap();
    std::fs::write(job.work_dir.join("prep.error"), b"").unwrap();
    std::fs::write(job.work_dir.join("prep.running"), b"").unwrap();

    assert!(states.clear_running(&job, "prep").unwrap());
    assert_eq!(states.status(&job, "prep").unwrap(), StageStatus::Error);
    // The stage is retryable again
    states.begin(&job, "prep").unwrap();
    assert!(!marker(&job, "prep.error"));
}

#[test]
fn test_concurrent_claimants_at_most_one_running() {
    let dir = TempDir::new().unwrap();
    let job = temp_job(&dir);
    job.ensure_dir().unwrap();

    let claimants = 16;
    let barrier = Arc::new(Barrier::new(claimants));
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..claimants)
        .map(|i| {
            let barrier = barrier.clone();
            let winners = winners.clone();
            let job = job.clone();
            std::thread::spawn(move || {
                let states = prep_eval();
                let stage = if i % 2 == 0 { "prep" } else { "eval" };
                barrier.wait();
                if states.begin(&job, stage).is_ok() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(winners.load(Ordering::SeqCst) <= 1);
    let running = std::fs::read_dir(&job.work_dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".running")
        })
        .count();
    assert_eq!(running, winners.load(Ordering::SeqCst));
}

#[test]
fn test_unknown_stage_rejected() {
    let dir = TempDir::new().unwrap();
    let states = prep_eval();
    let job = temp_job(&dir);

    assert!(matches!(
        states.status(&job, "relax"),
        Err(AfrunError::Validation(_))
    ));
    assert!(states.begin(&job, "relax").is_err());
}

// =============================================================================
// Device pool
// =============================================================================

fn fit_pool(devices: Vec<u32>) -> DevicePool {
    DevicePool::new(devices, Arc::new(StaticProbe::unlimited())).unwrap()
}

/// Reports plenty of memory only for the listed devices.
struct SelectiveProbe {
    fit: Vec<u32>,
    calls: AtomicUsize,
}

#[async_trait]
impl DeviceProbe for SelectiveProbe {
    async fn free_memory_mb(&self, device: u32) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(if self.fit.contains(&device) { 80_000 } else { 100 })
    }
}

struct FailingProbe;

#[async_trait]
impl DeviceProbe for FailingProbe {
    async fn free_memory_mb(&self, _device: u32) -> Result<u64> {
        Err(AfrunError::DeviceQuery("no driver".into()))
    }
}

struct SlowProbe;

#[async_trait]
impl DeviceProbe for SlowProbe {
    async fn free_memory_mb(&self, _device: u32) -> Result<u64> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(u64::MAX)
    }
}

#[tokio::test]
async fn test_pool_blocks_beyond_capacity() {
    let pool = fit_pool(vec![0, 1]);
    assert_eq!(pool.capacity(), 2);

    let a = pool.acquire(0).await;
    let _b = pool.acquire(0).await;
    assert_eq!(pool.available(), 0);

    let third = tokio::time::timeout(Duration::from_millis(100), pool.acquire(0)).await;
    assert!(third.is_err(), "third acquire should block");

    let device = a.device();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(0).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.release();

    let lease = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should wake after release")
        .unwrap();
    assert_eq!(lease.device(), device);
}

#[tokio::test]
async fn test_one_waiter_unblocks_per_release() {
    let pool = fit_pool(vec![7]);
    let held = pool.acquire(0).await;

    let acquired = Arc::new(AtomicUsize::new(0));
    let mut waiters = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        let acquired = acquired.clone();
        waiters.push(tokio::spawn(async move {
            let lease = pool.acquire(0).await;
            acquired.fetch_add(1, Ordering::SeqCst);
            // Hold on to the device until the test finishes.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(lease);
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(acquired.load(Ordering::SeqCst), 0);

    held.release();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(acquired.load(Ordering::SeqCst), 1);

    for waiter in waiters {
        waiter.abort();
    }
}

#[tokio::test]
async fn test_unfit_device_is_skipped() {
    let probe = Arc::new(SelectiveProbe {
        fit: vec![1],
        calls: AtomicUsize::new(0),
    });
    let pool = DevicePool::new(vec![0, 1], probe.clone())
        .unwrap()
        .with_unfit_backoff(Duration::from_millis(10));

    let lease = tokio::time::timeout(Duration::from_secs(2), pool.acquire(60_000))
        .await
        .expect("device 1 is fit");
    assert_eq!(lease.device(), 1);
    assert!(probe.calls.load(Ordering::SeqCst) >= 2);
    // The unfit device went back into the pool
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_probe_failure_treated_as_unfit() {
    let pool = DevicePool::new(vec![0], Arc::new(FailingProbe))
        .unwrap()
        .with_unfit_backoff(Duration::from_millis(10));

    let result = tokio::time::timeout(Duration::from_millis(200), pool.acquire(1)).await;
    assert!(result.is_err(), "acquire keeps retrying");
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_cancelled_acquire_returns_device() {
    let pool = DevicePool::new(vec![0], Arc::new(SlowProbe)).unwrap();

    let result = tokio::time::timeout(Duration::from_millis(50), pool.acquire(0)).await;
    assert!(result.is_err());
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_pool_never_exceeds_capacity() {
    let pool = fit_pool(vec![0, 1, 2]);
    let leases: Vec<_> = futures_all(&pool, 3).await;
    assert_eq!(pool.available(), 0);
    drop(leases);
    assert_eq!(pool.available(), pool.capacity());
}

async fn futures_all(pool: &DevicePool, n: usize) -> Vec<afrun::scheduler::DeviceLease> {
    let mut leases = Vec::with_capacity(n);
    for _ in 0..n {
        leases.push(pool.acquire(0).await);
    }
    leases
}
