use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AfrunError, Result};

/// Status of one stage of a job, derived from the markers on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Done => write!(f, "done"),
            StageStatus::Error => write!(f, "error"),
        }
    }
}

/// A job and the working directory that scopes all of its markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub work_dir: PathBuf,
}

impl Job {
    pub fn new(id: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Create the working directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }
}

/// Where a stage reads its input descriptor from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageInput {
    /// `work_dir/<job>.json`, written by whoever prepared the job
    JobDescriptor,
    /// `work_dir/<job>/<job>_data.json`, written by the data pipeline stage
    DataPipelineOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub depends_on: Option<String>,
    pub input: StageInput,
    pub runs_data_pipeline: bool,
    pub runs_inference: bool,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: None,
            input: StageInput::JobDescriptor,
            runs_data_pipeline: false,
            runs_inference: false,
        }
    }

    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.depends_on = Some(stage.into());
        self
    }

    pub fn with_input(mut self, input: StageInput) -> Self {
        self.input = input;
        self
    }

    pub fn with_flags(mut self, runs_data_pipeline: bool, runs_inference: bool) -> Self {
        self.runs_data_pipeline = runs_data_pipeline;
        self.runs_inference = runs_inference;
        self
    }

    pub fn input_path(&self, job: &Job) -> PathBuf {
        match self.input {
            StageInput::JobDescriptor => job.work_dir.join(format!("{}.json", job.id)),
            StageInput::DataPipelineOutput => job
                .work_dir
                .join(&job.id)
                .join(format!("{}_data.json", job.id)),
        }
    }
}

/// The fixed, ordered stages every job goes through.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<StageSpec>,
}

impl Pipeline {
    /// Stages must be listed in execution order; a dependency must name an
    /// earlier stage.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self> {
        if stages.is_empty() {
            return Err(AfrunError::Validation("pipeline has no stages".into()));
        }
        for (idx, stage) in stages.iter().enumerate() {
            if stages[..idx].iter().any(|s| s.name == stage.name) {
                return Err(AfrunError::Validation(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            if let Some(dep) = &stage.depends_on {
                if !stages[..idx].iter().any(|s| &s.name == dep) {
                    return Err(AfrunError::Validation(format!(
                        "stage {} depends on unknown or later stage {}",
                        stage.name, dep
                    )));
                }
            }
        }
        Ok(Self { stages })
    }

    /// Data pipeline (MSA and template search) followed by model inference.
    pub fn alphafold() -> Self {
        Self {
            stages: vec![
                StageSpec::new("msa").with_flags(true, false),
                StageSpec::new("infer")
                    .after("msa")
                    .with_input(StageInput::DataPipelineOutput)
                    .with_flags(false, true),
            ],
        }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Result<&StageSpec> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| AfrunError::Validation(format!("unknown stage: {}", name)))
    }
}

/// Which part of the pipeline a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Stage(String),
}

impl std::str::FromStr for RunMode {
    type Err = AfrunError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(AfrunError::Validation("empty run mode".into())),
            "full" => Ok(RunMode::Full),
            other => Ok(RunMode::Stage(other.to_string())),
        }
    }
}

/// Job directories under `data_dir`, sorted by name.
pub fn discover_jobs(data_dir: &Path) -> Result<Vec<String>> {
    let mut jobs = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            jobs.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    jobs.sort();
    Ok(jobs)
}
