use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use afrun::config::{ProbeConfig, RunnerConfig, StoreConfig, DEFAULT_MIN_FREE_MEMORY_MB};
use afrun::scheduler::RunMode;
use afrun::shutdown::install_shutdown_handler;
use afrun::store::{ArtifactStore, RecordHeader, DEFAULT_SEARCH_LIMIT};
use afrun::worker::JobRunner;
use afrun::{AfrunError, Result};

#[derive(Parser, Debug)]
#[command(name = "afrun")]
#[command(version)]
#[command(about = "Run structure-prediction jobs and manage the MSA cache")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run prediction stages for one job or every job in the data directory
    Predict(PredictArgs),

    /// MSA database operations
    Store {
        /// Path to the MSA database
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: StoreCommands,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Predict Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PredictArgs {
    /// Directory holding one sub-directory per job
    #[arg(long, default_value = "./afdbcp")]
    data_dir: PathBuf,

    /// Run only this job; failures end the process with a non-zero status
    #[arg(long)]
    job_id: Option<String>,

    /// `full`, or a single stage name (`msa`, `infer`)
    #[arg(long, default_value = "full")]
    mode: String,

    /// Model sub-directory inside each job directory
    #[arg(long, default_value = "af3")]
    model_name: String,

    /// Device id available to this runner (repeatable)
    #[arg(long = "device", default_value = "0")]
    devices: Vec<u32>,

    /// Script run for every stage
    #[arg(long, default_value = "scripts/run_alphafold.sh")]
    script: PathBuf,

    /// Program used to run the script
    #[arg(long, default_value = "bash")]
    interpreter: String,

    /// Free device memory (MB) required before a stage starts
    #[arg(long, default_value_t = DEFAULT_MIN_FREE_MEMORY_MB)]
    min_free_memory: u64,

    /// Seconds to wait after a device fails the memory check
    #[arg(long, default_value = "30")]
    unfit_backoff_secs: u64,

    /// Treat every device as fit instead of asking nvidia-smi
    #[arg(long)]
    no_probe: bool,

    /// Process jobs in random order (batch mode)
    #[arg(long)]
    shuffle: bool,

    /// Remove stale running markers of the selected job(s) and exit
    #[arg(long)]
    clear_running: bool,

    /// Only log stage names instead of full command lines
    #[arg(long, short)]
    quiet: bool,
}

// =============================================================================
// Store Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum StoreCommands {
    /// Show database path, record count and size
    Status,
    /// Import the protein chains of one or more JSON documents
    Add {
        paths: Vec<PathBuf>,

        /// Overwrite sequences that are already stored
        #[arg(long)]
        force: bool,
    },
    /// List records, most recently updated first
    List {
        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Search record ids (case-insensitive substring)
    Search {
        query: String,

        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Print the stored payload of a record
    Show { id: String },
    /// Delete a record
    Delete { id: String },
    /// Fill missing MSAs/templates in a document from the database
    Update {
        json_path: PathBuf,

        /// Where to write the result (default: `<stem>_data.json` next to the input)
        #[arg(long)]
        output_path: Option<PathBuf>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct HeaderOutput {
    id: String,
    created_at: String,
    updated_at: String,
}

impl From<&RecordHeader> for HeaderOutput {
    fn from(h: &RecordHeader) -> Self {
        Self {
            id: h.id.clone(),
            created_at: h.created_at.to_rfc3339(),
            updated_at: h.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct BatchOutput {
    completed: Vec<String>,
    skipped: Vec<String>,
    failed: Vec<FailedJobOutput>,
}

#[derive(Serialize)]
struct FailedJobOutput {
    job_id: String,
    error: String,
}

// =============================================================================
// Predict
// =============================================================================

async fn run_predict(args: PredictArgs) -> Result<()> {
    let mode: RunMode = args.mode.parse()?;
    let config = RunnerConfig {
        data_dir: args.data_dir,
        model_name: args.model_name,
        script_path: args.script,
        interpreter: args.interpreter,
        devices: args.devices,
        min_free_memory_mb: args.min_free_memory,
        unfit_backoff: Duration::from_secs(args.unfit_backoff_secs),
        probe: if args.no_probe {
            ProbeConfig::Disabled
        } else {
            ProbeConfig::NvidiaSmi
        },
        verbose: !args.quiet,
    };

    if !args.clear_running && !config.script_path.is_file() {
        return Err(AfrunError::Validation(format!(
            "stage script not found: {}",
            config.script_path.display()
        )));
    }

    let shutdown = install_shutdown_handler()?;
    let runner = JobRunner::from_config(config.clone())?.with_shutdown(shutdown);

    if args.clear_running {
        let jobs = match &args.job_id {
            Some(id) => vec![id.clone()],
            None => afrun::scheduler::job::discover_jobs(&config.data_dir)?,
        };
        for job_id in jobs {
            let job = runner.job(&job_id);
            runner.states().clear_all_running(&job)?;
        }
        return Ok(());
    }
    runner.check_mode(&mode)?;

    match args.job_id {
        Some(job_id) => {
            tracing::info!(job = %job_id, mode = ?mode, "Running single job");
            let job = runner.job(&job_id);
            runner.run_mode(&job, &mode).await?;
        }
        None => {
            tracing::info!(data_dir = %config.data_dir.display(), mode = ?mode, "Running all jobs");
            let summary = runner.run_batch(&mode, args.shuffle).await?;
            let output = BatchOutput {
                completed: summary.completed,
                skipped: summary.skipped,
                failed: summary
                    .failed
                    .into_iter()
                    .map(|(job_id, error)| FailedJobOutput { job_id, error })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

// =============================================================================
// Store
// =============================================================================

fn run_store(db_path: Option<PathBuf>, output: &OutputFormat, command: StoreCommands) -> Result<()> {
    let config = match db_path {
        Some(path) => StoreConfig::new(path),
        None => StoreConfig::default(),
    };
    let store = ArtifactStore::open(&config)?;

    match command {
        StoreCommands::Status => {
            let status = store.status()?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Table => println!("{}", status),
            }
        }
        StoreCommands::Add { paths, force } => {
            if paths.is_empty() {
                return Err(AfrunError::Validation("no JSON files given".into()));
            }
            let ids = store.import_files(&paths, force)?;
            tracing::info!(count = ids.len(), "Imported sequences");
            print_ids(output, &ids)?;
        }
        StoreCommands::List { limit, offset } => {
            let headers = store.list(limit, offset)?;
            match output {
                OutputFormat::Json => {
                    let rows: Vec<HeaderOutput> = headers.iter().map(HeaderOutput::from).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                OutputFormat::Table => {
                    println!("{:<64}  {:<27}  {:<27}", "ID", "CREATED", "UPDATED");
                    for h in &headers {
                        println!(
                            "{:<64}  {:<27}  {:<27}",
                            h.id,
                            h.created_at.to_rfc3339(),
                            h.updated_at.to_rfc3339()
                        );
                    }
                }
            }
        }
        StoreCommands::Search { query, limit } => {
            let ids = store.search(&query, limit)?;
            print_ids(output, &ids)?;
        }
        StoreCommands::Show { id } => match store.get_payload(&id)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&*record)?),
            None => {
                return Err(AfrunError::Validation(format!("no record with id {}", id)));
            }
        },
        StoreCommands::Delete { id } => {
            if store.delete(&id)? {
                println!("Deleted {}", id);
            } else {
                return Err(AfrunError::Validation(format!("no record with id {}", id)));
            }
        }
        StoreCommands::Update {
            json_path,
            output_path,
        } => {
            let output_path = output_path.unwrap_or_else(|| {
                let stem = json_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                json_path.with_file_name(format!("{}_data.json", stem))
            });
            let reconciled = store.reconcile_file(&json_path)?;
            reconciled.document.save(&output_path)?;
            tracing::info!(
                output = %output_path.display(),
                filled = ?reconciled.filled,
                missing = ?reconciled.missing,
                "Wrote reconciled document"
            );
        }
    }
    Ok(())
}

fn print_ids(output: &OutputFormat, ids: &[String]) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(ids)?),
        OutputFormat::Table => {
            for id in ids {
                println!("{}", id);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Predict(predict) => run_predict(predict).await,
        Commands::Store {
            db_path,
            output,
            command,
        } => run_store(db_path, &output, command),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
