//! # Knowledge Engine CLI (`kb`)
//!
//! The `kb` binary is a controller: it spawns a `kb-worker` process, sends
//! it one request per command, and prints the JSON result on stdout.
//! Progress and logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb create <name>` | Create a knowledge base |
//! | `kb list` | List knowledge bases, most recently updated first |
//! | `kb get <kb>` / `kb update <kb>` / `kb delete <kb> --yes` | Manage one knowledge base |
//! | `kb init <kb>` | Create directories and database if missing |
//! | `kb import <kb> <path>...` | Import files and directories as a job |
//! | `kb jobs <kb>` / `kb items <kb> <job>` | Inspect jobs |
//! | `kb pause` / `kb resume` / `kb cancel <kb> <job>` | Control a job |
//! | `kb watch <kb>` | Follow job progress until no job is active |
//! | `kb search <kb> "<query>"` | Full-text search |
//! | `kb note <kb> --title <t>` | Add a note |
//! | `kb stats <kb>` | Document, chunk, and job counts |
//!
//! The worker lives only as long as the command. `kb import` therefore
//! waits for its job by default; with `--no-wait`, the job is left for a
//! later `kb resume`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use knowledge_engine::client::{WorkerClient, WorkerCommand};
use knowledge_engine::config::{self, Config};
use knowledge_engine::logging;
use knowledge_engine::progress::ProgressMode;
use knowledge_engine_core::models::{ImportSource, Job, JobStatus};
use knowledge_engine_core::protocol::{
    Call, CreateKbParams, CreateNoteParams, DeleteKbParams, ImportFilesParams, JobIdResult,
    JobParams, JobUpdate, KbParams, NoParams, SearchParams, UpdateKbParams, JOB_UPDATE_EVENT,
};

/// Knowledge Engine CLI: a local-first knowledge-base ingestion and
/// retrieval engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowledge Engine: import files into searchable knowledge bases",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a knowledge base.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List knowledge bases.
    List,
    /// Show a knowledge base's manifest (initializing it if needed).
    Get { kb_id: String },
    /// Rename or re-describe a knowledge base.
    Update {
        kb_id: String,
        #[arg(long)]
        name: Option<String>,
        /// An empty string clears the description.
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a knowledge base and everything in it. Irreversible.
    Delete {
        kb_id: String,
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
    /// Create a knowledge base's directories and database if missing.
    Init { kb_id: String },
    /// Import files and directories.
    ///
    /// Each path that is a directory is walked (one level deep unless
    /// `--recursive`); every other path is imported as a file.
    Import {
        kb_id: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, short)]
        recursive: bool,
        /// Return as soon as the job is queued.
        #[arg(long)]
        no_wait: bool,
    },
    /// List recent jobs.
    Jobs { kb_id: String },
    /// List the items of one job.
    Items { kb_id: String, job_id: String },
    /// Pause a pending or running job.
    Pause { kb_id: String, job_id: String },
    /// Resume a paused job and wait for it.
    Resume {
        kb_id: String,
        job_id: String,
        #[arg(long)]
        no_wait: bool,
    },
    /// Cancel a job.
    Cancel { kb_id: String, job_id: String },
    /// Follow job progress until no job is pending or processing.
    Watch {
        kb_id: String,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Full-text search.
    Search {
        kb_id: String,
        query: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Add a note. Content comes from `--content`, `--file`, or stdin.
    Note {
        kb_id: String,
        #[arg(long)]
        title: String,
        #[arg(long, conflicts_with = "file")]
        content: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Document, chunk, and job counts.
    Stats { kb_id: String },
}

struct Controller {
    client: WorkerClient,
    call_timeout: Duration,
    import_timeout: Duration,
    progress: ProgressMode,
}

impl Controller {
    fn new(cfg: &Config, progress: ProgressMode) -> Result<Self> {
        let mut command = WorkerCommand::new(cfg.worker.resolve_binary()?, &cfg.storage.data_root);
        command.item_timeout_secs = cfg.worker.item_timeout_secs;
        command.log_level = cfg.logging.level.clone();
        Ok(Self {
            client: WorkerClient::new(command),
            call_timeout: cfg.worker.call_timeout(),
            import_timeout: cfg.worker.import_timeout(),
            progress,
        })
    }

    async fn call(&self, call: Call) -> Result<Value> {
        Ok(self.client.call(call, self.call_timeout).await?)
    }

    async fn print(&self, call: Call) -> Result<()> {
        let value = self.call(call).await?;
        print_json(&value)
    }

    /// Run `start` with job updates buffered, then follow `job_id` to a
    /// resting state.
    async fn run_job<F, Fut>(&self, kb_id: &str, start: F) -> Result<Job>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobUpdate>();
        let _subscription = self.client.on_event(move |event| {
            if event.event != JOB_UPDATE_EVENT {
                return;
            }
            if let Ok(update) = serde_json::from_value::<JobUpdate>(event.payload.clone()) {
                let _ = tx.send(update);
            }
        });

        let job_id = start().await?;
        let reporter = self.progress.reporter();

        // A job already at rest (e.g. resuming a finished job) sends no update.
        let jobs: Vec<Job> = self
            .client
            .call_as(
                Call::ListJobs(KbParams {
                    kb_id: kb_id.to_string(),
                }),
                self.call_timeout,
            )
            .await?;
        if let Some(job) = jobs.into_iter().find(|j| j.id == job_id) {
            if !job.status.is_runnable() {
                return Ok(job);
            }
        }

        while let Some(update) = rx.recv().await {
            if update.job.id != job_id {
                continue;
            }
            reporter.report(&update);
            let status = update.job.status;
            if status.is_terminal() || status == JobStatus::Paused {
                return Ok(update.job);
            }
        }
        bail!("worker stopped before job {} finished", job_id)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level)?;

    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);
    let ctl = Controller::new(&cfg, progress)?;

    match cli.command {
        Commands::Create { name, description } => {
            ctl.print(Call::Create(CreateKbParams { name, description }))
                .await?;
        }
        Commands::List => ctl.print(Call::List(NoParams {})).await?,
        Commands::Get { kb_id } => ctl.print(Call::Get(KbParams { kb_id })).await?,
        Commands::Update {
            kb_id,
            name,
            description,
        } => {
            ctl.print(Call::Update(UpdateKbParams {
                kb_id,
                name,
                description,
            }))
            .await?;
        }
        Commands::Delete { kb_id, yes } => {
            ctl.print(Call::Delete(DeleteKbParams {
                kb_id,
                confirmed: yes,
            }))
            .await?;
        }
        Commands::Init { kb_id } => {
            ctl.print(Call::EnsureInitialized(KbParams { kb_id })).await?;
        }
        Commands::Import {
            kb_id,
            paths,
            recursive,
            no_wait,
        } => {
            let sources = import_sources(&paths, recursive)?;
            let params = ImportFilesParams {
                kb_id: kb_id.clone(),
                sources,
            };
            if no_wait {
                let value = ctl
                    .client
                    .call(Call::ImportFiles(params), ctl.import_timeout)
                    .await?;
                print_json(&value)?;
            } else {
                let client = &ctl.client;
                let timeout = ctl.import_timeout;
                let job = ctl
                    .run_job(&kb_id, move || async move {
                        let result: JobIdResult =
                            client.call_as(Call::ImportFiles(params), timeout).await?;
                        Ok(result.job_id)
                    })
                    .await?;
                print_json(&job)?;
            }
        }
        Commands::Jobs { kb_id } => ctl.print(Call::ListJobs(KbParams { kb_id })).await?,
        Commands::Items { kb_id, job_id } => {
            ctl.print(Call::ListJobItems(JobParams { kb_id, job_id }))
                .await?;
        }
        Commands::Pause { kb_id, job_id } => {
            ctl.print(Call::PauseJob(JobParams { kb_id, job_id })).await?;
        }
        Commands::Resume {
            kb_id,
            job_id,
            no_wait,
        } => {
            let params = JobParams {
                kb_id: kb_id.clone(),
                job_id: job_id.clone(),
            };
            if no_wait {
                ctl.print(Call::ResumeJob(params)).await?;
            } else {
                let client = &ctl.client;
                let timeout = ctl.call_timeout;
                let job = ctl
                    .run_job(&kb_id, move || async move {
                        client.call(Call::ResumeJob(params), timeout).await?;
                        Ok(job_id)
                    })
                    .await?;
                print_json(&job)?;
            }
        }
        Commands::Cancel { kb_id, job_id } => {
            ctl.print(Call::CancelJob(JobParams { kb_id, job_id })).await?;
        }
        Commands::Watch { kb_id, interval_ms } => {
            watch(&ctl, &kb_id, Duration::from_millis(interval_ms.max(100))).await?;
        }
        Commands::Search {
            kb_id,
            query,
            limit,
        } => {
            ctl.print(Call::Search(SearchParams {
                kb_id,
                query,
                limit,
            }))
            .await?;
        }
        Commands::Note {
            kb_id,
            title,
            content,
            file,
        } => {
            let content = note_content(content, file.as_deref())?;
            ctl.print(Call::CreateNote(CreateNoteParams {
                kb_id,
                title,
                content,
            }))
            .await?;
        }
        Commands::Stats { kb_id } => ctl.print(Call::GetStats(KbParams { kb_id })).await?,
    }

    ctl.client.shutdown().await;
    Ok(())
}

/// Directories become directory sources; everything else is one file source.
fn import_sources(paths: &[PathBuf], recursive: bool) -> Result<Vec<ImportSource>> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for path in paths {
        let absolute = std::path::absolute(path)
            .with_context(|| format!("Invalid path: {}", path.display()))?;
        let text = absolute.to_string_lossy().to_string();
        if absolute.is_dir() {
            dirs.push(text);
        } else {
            files.push(text);
        }
    }

    let mut sources = Vec::new();
    if !files.is_empty() {
        sources.push(ImportSource::Files { paths: files });
    }
    if !dirs.is_empty() {
        sources.push(ImportSource::Directory {
            paths: dirs,
            recursive,
        });
    }
    Ok(sources)
}

fn note_content(content: Option<String>, file: Option<&Path>) -> Result<String> {
    if let Some(content) = content {
        return Ok(content);
    }
    if let Some(path) = file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    std::io::read_to_string(std::io::stdin()).context("Failed to read note from stdin")
}

/// Poll the job list, reporting every job whose state changed, until no job
/// is pending or processing.
async fn watch(ctl: &Controller, kb_id: &str, interval: Duration) -> Result<()> {
    let reporter = ctl.progress.reporter();
    let mut seen: HashMap<String, (JobStatus, i64)> = HashMap::new();
    loop {
        let jobs: Vec<Job> = ctl
            .client
            .call_as(
                Call::ListJobs(KbParams {
                    kb_id: kb_id.to_string(),
                }),
                ctl.call_timeout,
            )
            .await?;

        let mut active = false;
        for job in jobs {
            active |= job.status.is_runnable();
            let state = (job.status, job.progress_current);
            if seen.get(&job.id) != Some(&state) {
                seen.insert(job.id.clone(), state);
                reporter.report(&JobUpdate {
                    kb_id: kb_id.to_string(),
                    job,
                });
            }
        }
        if !active {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
