use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{AfrunError, Result};
use crate::scheduler::job::{Job, Pipeline, StageSpec, StageStatus};

const DONE: &str = "done";
const RUNNING: &str = "running";
const ERROR: &str = "error";

/// Durable per-stage status tracking through zero-length marker files.
///
/// For a job working directory `dir` and stage `s` the markers are
/// `dir/s.done`, `dir/s.running` and `dir/s.error`. Only their existence is
/// meaningful. The state machine never detects dead runners: a `.running`
/// marker left behind by a crashed process keeps the whole job reported as
/// running until it is cleared by hand (see [`StageStateMachine::clear_running`]).
#[derive(Debug, Clone)]
pub struct StageStateMachine {
    pipeline: Pipeline,
}

impl StageStateMachine {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn marker_path(job: &Job, stage: &str, status: &str) -> PathBuf {
        job.work_dir.join(format!("{}.{}", stage, status))
    }

    /// Current status of `stage`.
    ///
    /// A running marker for any stage of the job wins, then this stage's done
    /// marker, then an unmet dependency (reported as error), then this
    /// stage's error marker.
    pub fn status(&self, job: &Job, stage: &str) -> Result<StageStatus> {
        let spec = self.pipeline.stage(stage)?;

        if let Some(running) = running_stages(&job.work_dir)?.first() {
            tracing::debug!(job = %job.id, stage, running = %running, "Job has a running stage");
            return Ok(StageStatus::Running);
        }
        if exists(&Self::marker_path(job, stage, DONE)) {
            return Ok(StageStatus::Done);
        }
        if !self.dependency_met(job, spec) {
            return Ok(StageStatus::Error);
        }
        if exists(&Self::marker_path(job, stage, ERROR)) {
            return Ok(StageStatus::Error);
        }
        Ok(StageStatus::Pending)
    }

    /// True when the stage has no prerequisite or its prerequisite is done.
    pub fn dependency_met(&self, job: &Job, spec: &StageSpec) -> bool {
        match &spec.depends_on {
            Some(dep) => exists(&Self::marker_path(job, dep, DONE)),
            None => true,
        }
    }

    /// Claim the stage by creating its running marker.
    ///
    /// The marker is created exclusively, so two runners racing on the same
    /// stage cannot both win. If another stage of the job turns out to be
    /// running once the marker exists, the claim is withdrawn. A leftover
    /// error marker is removed once the claim holds.
    ///
    /// A crash between creating the running marker and removing the error
    /// marker leaves both behind. [`status`](Self::status) reports that pair
    /// as running, and [`complete`](Self::complete) or
    /// [`clear_running`](Self::clear_running) resolve it.
    pub fn begin(&self, job: &Job, stage: &str) -> Result<()> {
        self.pipeline.stage(stage)?;
        job.ensure_dir()?;

        let running = Self::marker_path(job, stage, RUNNING);
        match OpenOptions::new().write(true).create_new(true).open(&running) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(AfrunError::AlreadyRunning {
                    job: job.id.clone(),
                    stage: stage.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let others: Vec<String> = running_stages(&job.work_dir)?
            .into_iter()
            .filter(|s| s != stage)
            .collect();
        if !others.is_empty() {
            remove_if_exists(&running)?;
            tracing::warn!(job = %job.id, stage, running = ?others, "Another stage claimed the job first");
            return Err(AfrunError::AlreadyRunning {
                job: job.id.clone(),
                stage: stage.to_string(),
            });
        }

        remove_if_exists(&Self::marker_path(job, stage, ERROR))?;
        tracing::info!(job = %job.id, stage, marker = %running.display(), "Stage claimed");
        Ok(())
    }

    /// Record the outcome of a claimed stage.
    pub fn complete(&self, job: &Job, stage: &str, success: bool) -> Result<()> {
        self.pipeline.stage(stage)?;
        job.ensure_dir()?;

        let running = Self::marker_path(job, stage, RUNNING);
        let error = Self::marker_path(job, stage, ERROR);
        if success {
            remove_if_exists(&running)?;
            remove_if_exists(&error)?;
            touch(&Self::marker_path(job, stage, DONE))?;
            tracing::info!(job = %job.id, stage, "Stage marked done");
        } else {
            remove_if_exists(&running)?;
            touch(&error)?;
            tracing::warn!(job = %job.id, stage, "Stage marked error");
        }
        Ok(())
    }

    /// Record a stage that could not start because its prerequisite is not
    /// done. Only the error marker is written; nothing was claimed.
    pub fn mark_error(&self, job: &Job, stage: &str) -> Result<()> {
        self.pipeline.stage(stage)?;
        job.ensure_dir()?;
        touch(&Self::marker_path(job, stage, ERROR))
    }

    /// Operator helper: drop a running marker left behind by a dead process.
    /// Returns whether a marker was removed.
    pub fn clear_running(&self, job: &Job, stage: &str) -> Result<bool> {
        self.pipeline.stage(stage)?;
        let removed = remove_if_exists(&Self::marker_path(job, stage, RUNNING))?;
        if removed {
            tracing::warn!(job = %job.id, stage, "Cleared stale running marker");
        }
        Ok(removed)
    }

    /// Operator helper: drop every running marker of the job, including
    /// markers of stages the pipeline no longer has. Returns the stages
    /// that were cleared.
    pub fn clear_all_running(&self, job: &Job) -> Result<Vec<String>> {
        let stages = running_stages(&job.work_dir)?;
        for stage in &stages {
            remove_if_exists(&Self::marker_path(job, stage, RUNNING))?;
            tracing::warn!(job = %job.id, stage = %stage, "Cleared stale running marker");
        }
        Ok(stages)
    }
}

/// Names of all stages with a running marker in `dir`, sorted.
fn running_stages(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut stages = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stage) = name.strip_suffix(".running") {
            if !stage.is_empty() && entry.file_type()?.is_file() {
                stages.push(stage.to_string());
            }
        }
    }
    stages.sort();
    Ok(stages)
}

fn exists(path: &Path) -> bool {
    path.is_file()
}

fn touch(path: &Path) -> Result<()> {
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
