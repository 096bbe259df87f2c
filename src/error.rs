use thiserror::Error;

#[derive(Error, Debug)]
pub enum AfrunError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Stage {stage} of job {job} requires {requires} to be done first")]
    Dependency {
        job: String,
        stage: String,
        requires: String,
    },

    #[error("Stage {stage} of job {job} failed (exit code {exit_code:?}): {message}")]
    ExternalCommand {
        job: String,
        stage: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Stage {stage} of job {job} was interrupted")]
    Interrupted { job: String, stage: String },

    #[error("Stage {stage} of job {job} is already claimed by another runner")]
    AlreadyRunning { job: String, stage: String },

    #[error("Device query failed: {0}")]
    DeviceQuery(String),

    #[error("Corrupt payload for record {id}: {reason}")]
    StoreIntegrity { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AfrunError {
    /// Process exit status used when this error ends a single-job run.
    pub fn exit_code(&self) -> i32 {
        match self {
            AfrunError::Validation(_) => 2,
            AfrunError::Dependency { .. } => 3,
            AfrunError::ExternalCommand { .. } => 4,
            AfrunError::StoreIntegrity { .. } => 5,
            AfrunError::Interrupted { .. } => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, AfrunError>;
