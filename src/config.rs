use std::path::PathBuf;
use std::time::Duration;

/// Free device memory (MB) a stage needs before it may start.
pub const DEFAULT_MIN_FREE_MEMORY_MB: u64 = 60_000;

/// Wait applied after a popped device fails the fitness check.
pub const DEFAULT_UNFIT_BACKOFF: Duration = Duration::from_secs(30);

/// How the device pool decides whether a device is fit to run a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeConfig {
    /// Query free memory through `nvidia-smi`.
    #[default]
    NvidiaSmi,
    /// Skip the query and treat every device as fit.
    Disabled,
}

/// Configuration for running job stages.
///
/// Every job lives in `data_dir/<job_id>/<model_name>`; that directory holds
/// the stage markers and is handed to the external script.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root directory holding one sub-directory per job
    pub data_dir: PathBuf,
    /// Model sub-directory inside each job directory
    pub model_name: String,
    /// Script invoked for every stage
    pub script_path: PathBuf,
    /// Program used to run the script
    pub interpreter: String,
    /// Device ids forming the pool, in acquisition order
    pub devices: Vec<u32>,
    pub min_free_memory_mb: u64,
    pub unfit_backoff: Duration,
    pub probe: ProbeConfig,
    /// Log the full command line before running it
    pub verbose: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./afdbcp"),
            model_name: "af3".to_string(),
            script_path: PathBuf::from("scripts/run_alphafold.sh"),
            interpreter: "bash".to_string(),
            devices: vec![0],
            min_free_memory_mb: DEFAULT_MIN_FREE_MEMORY_MB,
            unfit_backoff: DEFAULT_UNFIT_BACKOFF,
            probe: ProbeConfig::default(),
            verbose: true,
        }
    }
}

impl RunnerConfig {
    pub fn new(data_dir: impl Into<PathBuf>, script_path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            script_path: script_path.into(),
            ..Default::default()
        }
    }

    pub fn with_devices(mut self, devices: Vec<u32>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    /// Working directory of a job: `data_dir/<job_id>/<model_name>`.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.data_dir.join(job_id).join(&self.model_name)
    }
}

/// Configuration for the content-addressed MSA store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub header_cache_capacity: u64,
    pub payload_cache_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            header_cache_capacity: 1024,
            payload_cache_capacity: 256,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// `$HOME/.afrun/msa.sqlite`, or `./msa.sqlite` when no home directory is set.
pub fn default_store_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".afrun").join("msa.sqlite"),
        None => PathBuf::from("msa.sqlite"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_config_default() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.data_dir, PathBuf::from("./afdbcp"));
        assert_eq!(cfg.model_name, "af3");
        assert_eq!(cfg.interpreter, "bash");
        assert_eq!(cfg.devices, vec![0]);
        assert_eq!(cfg.min_free_memory_mb, 60_000);
        assert_eq!(cfg.unfit_backoff, Duration::from_secs(30));
        assert_eq!(cfg.probe, ProbeConfig::NvidiaSmi);
    }

    #[test]
    fn runner_config_builders() {
        let cfg = RunnerConfig::new("/data", "/opt/run.sh")
            .with_devices(vec![2, 3])
            .with_interpreter("sh")
            .with_probe(ProbeConfig::Disabled);
        assert_eq!(cfg.data_dir, PathBuf::from("/data"));
        assert_eq!(cfg.script_path, PathBuf::from("/opt/run.sh"));
        assert_eq!(cfg.devices, vec![2, 3]);
        assert_eq!(cfg.interpreter, "sh");
        assert_eq!(cfg.probe, ProbeConfig::Disabled);
    }

    #[test]
    fn job_dir_nests_model_name() {
        let cfg = RunnerConfig::new("/data", "run.sh");
        assert_eq!(cfg.job_dir("1abc"), PathBuf::from("/data/1abc/af3"));
    }

    #[test]
    fn store_config_default_caches() {
        let cfg = StoreConfig::new("/tmp/msa.sqlite");
        assert_eq!(cfg.path, PathBuf::from("/tmp/msa.sqlite"));
        assert_eq!(cfg.header_cache_capacity, 1024);
        assert_eq!(cfg.payload_cache_capacity, 256);
    }

    #[test]
    fn default_store_path_ends_with_file_name() {
        assert!(default_store_path().ends_with("msa.sqlite"));
    }
}
