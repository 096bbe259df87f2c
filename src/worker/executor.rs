use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::RunnerConfig;
use crate::scheduler::{Job, StageSpec};

/// Result of one stage invocation
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: String,
    pub stage: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Runs the stage script for a job on one device.
///
/// The script receives five positional arguments:
/// `<input descriptor> <job working dir> <run data pipeline> <run inference> <device id>`,
/// with the two flags rendered as `true`/`false`. Exit code 0 means success.
/// Output goes straight to the caller's stdout/stderr.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    interpreter: String,
    script: PathBuf,
    verbose: bool,
}

impl StageExecutor {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            verbose: false,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            script: config.script_path.clone(),
            verbose: config.verbose,
        }
    }

    /// Command line for a stage, without the interpreter.
    pub fn build_args(&self, job: &Job, stage: &StageSpec, device: u32) -> Vec<String> {
        vec![
            absolute(&self.script).display().to_string(),
            absolute(&stage.input_path(job)).display().to_string(),
            absolute(&job.work_dir).display().to_string(),
            stage.runs_data_pipeline.to_string(),
            stage.runs_inference.to_string(),
            device.to_string(),
        ]
    }

    /// Run the stage script and wait for it to exit.
    ///
    /// The child is killed if the returned future is dropped before it
    /// finishes.
    pub async fn execute(&self, job: &Job, stage: &StageSpec, device: u32) -> ExecutionResult {
        let args = self.build_args(job, stage, device);
        if self.verbose {
            tracing::info!(job = %job.id, stage = %stage.name, command = %format!("{} {}", self.interpreter, args.join(" ")), "Running command");
        } else {
            tracing::info!(job = %job.id, stage = %stage.name, device, "Running stage");
        }

        let result = Command::new(&self.interpreter)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await;

        Self::process_status(job, stage, result)
    }

    fn process_status(
        job: &Job,
        stage: &StageSpec,
        result: Result<std::process::ExitStatus, std::io::Error>,
    ) -> ExecutionResult {
        match result {
            Ok(status) => {
                let exit_code = status.code();
                let success = status.success();
                tracing::info!(
                    job = %job.id,
                    stage = %stage.name,
                    success,
                    exit_code = ?exit_code,
                    "Stage command finished"
                );
                ExecutionResult {
                    job_id: job.id.clone(),
                    stage: stage.name.clone(),
                    success,
                    exit_code,
                    error: if success {
                        None
                    } else {
                        Some(match exit_code {
                            Some(code) => format!("Exit code: {}", code),
                            None => "Terminated by signal".to_string(),
                        })
                    },
                }
            }
            Err(e) => {
                tracing::error!(job = %job.id, stage = %stage.name, error = %e, "Failed to start stage command");
                ExecutionResult {
                    job_id: job.id.clone(),
                    stage: stage.name.clone(),
                    success: false,
                    exit_code: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
