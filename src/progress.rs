//! Job progress reporting for the `kb` CLI.
//!
//! Renders `job:update` events while `kb import --wait` or `kb watch` runs.
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

use knowledge_engine_core::models::{Job, JobStatus};
use knowledge_engine_core::protocol::JobUpdate;

/// Renders job updates. Implementations write to stderr (human or JSON).
pub trait JobProgressReporter: Send + Sync {
    fn report(&self, update: &JobUpdate);
}

/// Human-friendly progress: `import 3f2a9c1e  processing  1,234 / 5,000 files`.
pub struct StderrProgress;

impl JobProgressReporter for StderrProgress {
    fn report(&self, update: &JobUpdate) {
        let line = format!("{}\n", human_line(&update.job));
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JobProgressReporter for JsonProgress {
    fn report(&self, update: &JobUpdate) {
        let obj = serde_json::json!({
            "event": "progress",
            "kbId": update.kb_id,
            "jobId": update.job.id,
            "status": update.job.status,
            "n": update.job.progress_current,
            "total": update.job.progress_total,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl JobProgressReporter for NoProgress {
    fn report(&self, _update: &JobUpdate) {}
}

fn human_line(job: &Job) -> String {
    let short_id: String = job.id.chars().take(8).collect();
    let mut line = format!(
        "import {}  {:<10}  {} / {} files",
        short_id,
        job.status.as_str(),
        format_number(job.progress_current.max(0) as u64),
        format_number(job.progress_total.max(0) as u64)
    );
    if job.status == JobStatus::Failed {
        if let Some(message) = &job.error_message {
            line.push_str("  ");
            line.push_str(message);
        }
    }
    line
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn JobProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
