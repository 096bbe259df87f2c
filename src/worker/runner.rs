use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{AfrunError, Result};
use crate::scheduler::job::discover_jobs;
use crate::scheduler::{DevicePool, Job, Pipeline, RunMode, StageStateMachine, StageStatus};
use crate::worker::executor::StageExecutor;

/// What a call to [`JobRunner::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage command ran and succeeded on `device`.
    Completed { device: u32 },
    /// Nothing was executed because the stage was done or the job busy.
    Skipped(StageStatus),
}

/// Per-job results of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.completed.len() + self.skipped.len() + self.failed.len()
    }
}

/// Drives job stages: checks markers, claims the stage, takes a device,
/// runs the stage command and records the outcome.
#[derive(Debug)]
pub struct JobRunner {
    config: RunnerConfig,
    states: StageStateMachine,
    pool: DevicePool,
    executor: StageExecutor,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(
        config: RunnerConfig,
        pipeline: Pipeline,
        pool: DevicePool,
        executor: StageExecutor,
    ) -> Self {
        Self {
            config,
            states: StageStateMachine::new(pipeline),
            pool,
            executor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Runner for the default data-pipeline-then-inference pipeline.
    pub fn from_config(config: RunnerConfig) -> Result<Self> {
        let pool = DevicePool::from_config(&config)?;
        let executor = StageExecutor::from_config(&config);
        Ok(Self::new(config, Pipeline::alphafold(), pool, executor))
    }

    /// Cancel in-flight stages when `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn states(&self) -> &StageStateMachine {
        &self.states
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn job(&self, job_id: &str) -> Job {
        Job::new(job_id, self.config.job_dir(job_id))
    }

    /// Run one stage of a job.
    ///
    /// Done or running stages are skipped without side effects. A stage whose
    /// prerequisite is not done gets an error marker and fails. Otherwise the
    /// stage is claimed, a device is acquired and the stage command runs; the
    /// device goes back to the pool on every exit path. Failures are not
    /// retried here.
    pub async fn run(&self, job: &Job, stage: &str) -> Result<StageOutcome> {
        let spec = self.states.pipeline().stage(stage)?.clone();

        let status = self.states.status(job, stage)?;
        match status {
            StageStatus::Done => {
                tracing::info!(job = %job.id, stage, "Stage already completed, skipping");
                return Ok(StageOutcome::Skipped(status));
            }
            StageStatus::Running => {
                tracing::info!(job = %job.id, stage, "A stage of this job is running, skipping");
                return Ok(StageOutcome::Skipped(status));
            }
            StageStatus::Error | StageStatus::Pending => {}
        }

        if !self.states.dependency_met(job, &spec) {
            self.states.mark_error(job, stage)?;
            let requires = spec.depends_on.clone().unwrap_or_default();
            tracing::error!(job = %job.id, stage, requires = %requires, "Prerequisite stage not done");
            return Err(AfrunError::Dependency {
                job: job.id.clone(),
                stage: stage.to_string(),
                requires,
            });
        }
        if status == StageStatus::Error {
            tracing::info!(job = %job.id, stage, "Stage failed previously, retrying");
        }

        match self.states.begin(job, stage) {
            Ok(()) => {}
            Err(AfrunError::AlreadyRunning { .. }) => {
                tracing::info!(job = %job.id, stage, "Lost the claim to another runner, skipping");
                return Ok(StageOutcome::Skipped(StageStatus::Running));
            }
            Err(e) => return Err(e),
        }

        let lease = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                self.states.complete(job, stage, false)?;
                return Err(self.interrupted(job, stage));
            }
            lease = self.pool.acquire(self.config.min_free_memory_mb) => lease,
        };
        let device = lease.device();

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            result = self.executor.execute(job, &spec, device) => Some(result),
        };

        match result {
            Some(result) if result.success => {
                lease.release();
                self.states.complete(job, stage, true)?;
                tracing::info!(job = %job.id, stage, device, "Stage completed successfully");
                Ok(StageOutcome::Completed { device })
            }
            Some(result) => {
                let recorded = self.states.complete(job, stage, false);
                lease.release();
                recorded?;
                Err(AfrunError::ExternalCommand {
                    job: job.id.clone(),
                    stage: stage.to_string(),
                    exit_code: result.exit_code,
                    message: result.error.unwrap_or_default(),
                })
            }
            None => {
                let recorded = self.states.complete(job, stage, false);
                lease.release();
                recorded?;
                Err(self.interrupted(job, stage))
            }
        }
    }

    /// Run every stage in pipeline order, stopping at the first failure.
    pub async fn run_full(&self, job: &Job) -> Result<Vec<StageOutcome>> {
        let mut outcomes = Vec::with_capacity(self.states.pipeline().stages().len());
        for stage in self.states.pipeline().stages() {
            outcomes.push(self.run(job, &stage.name).await?);
        }
        Ok(outcomes)
    }

    pub async fn run_mode(&self, job: &Job, mode: &RunMode) -> Result<Vec<StageOutcome>> {
        match mode {
            RunMode::Full => self.run_full(job).await,
            RunMode::Stage(stage) => Ok(vec![self.run(job, stage).await?]),
        }
    }

    /// Run `mode` for every job directory under the data dir.
    ///
    /// A failing job is logged and recorded and the scan moves on. An
    /// operator interrupt stops the scan and is returned as the error.
    pub async fn run_batch(&self, mode: &RunMode, shuffle: bool) -> Result<BatchSummary> {
        self.check_mode(mode)?;
        let mut jobs = discover_jobs(&self.config.data_dir)?;
        if shuffle {
            tracing::info!("Shuffling jobs");
            jobs.shuffle(&mut rand::thread_rng());
        }

        let total = jobs.len();
        let mut summary = BatchSummary::default();
        for (idx, job_id) in jobs.into_iter().enumerate() {
            if self.shutdown.is_cancelled() {
                return Err(AfrunError::Interrupted {
                    job: job_id,
                    stage: "-".to_string(),
                });
            }

            tracing::info!(job = %job_id, progress = %format!("{}/{}", idx + 1, total), "Running job");
            let job = self.job(&job_id);
            match self.run_mode(&job, mode).await {
                Ok(outcomes) => {
                    let ran = outcomes
                        .iter()
                        .any(|o| matches!(o, StageOutcome::Completed { .. }));
                    if ran {
                        summary.completed.push(job_id);
                    } else {
                        summary.skipped.push(job_id);
                    }
                }
                Err(e @ AfrunError::Interrupted { .. }) => return Err(e),
                Err(e) => {
                    tracing::error!(job = %job_id, error = %e, "Job failed, continuing with next job");
                    summary.failed.push((job_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            completed = summary.completed.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Batch finished"
        );
        Ok(summary)
    }

    /// Reject a mode naming a stage the pipeline does not have.
    pub fn check_mode(&self, mode: &RunMode) -> Result<()> {
        if let RunMode::Stage(stage) = mode {
            self.states.pipeline().stage(stage)?;
        }
        Ok(())
    }

    fn interrupted(&self, job: &Job, stage: &str) -> AfrunError {
        tracing::warn!(job = %job.id, stage, "Run interrupted by operator");
        AfrunError::Interrupted {
            job: job.id.clone(),
            stage: stage.to_string(),
        }
    }
}
