//! Append-only log of finished workflow runs
//!
//! Runs are kept in memory and, when a path is configured, appended to a
//! JSON-lines file (one [`WorkflowRun`] per line) that is flushed after every
//! write. Reopening the file restores the log; malformed lines are skipped.
//!
//! Retention: memory holds at most `max_entries` runs. The file only grows
//! between opens and is compacted to the newest `max_entries` runs when
//! opened.

use crate::config::DEFAULT_HISTORY_MAX_ENTRIES;
use crate::error::Result;
use crate::workflow::{WorkflowKind, WorkflowRun, WorkflowStatus};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_QUERY_LIMIT: usize = 200;

/// Selects runs from the history log
#[derive(Debug, Clone)]
pub struct HistoryFilter {
    /// Case-insensitive substring over the run's searchable text
    pub text: Option<String>,
    pub kind: Option<WorkflowKind>,
    pub status: Option<WorkflowStatus>,
    /// Inclusive lower bound on `started_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            text: None,
            kind: None,
            status: None,
            since: None,
            until: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.text = if text.trim().is_empty() {
            None
        } else {
            Some(text.to_lowercase())
        };
        self
    }

    pub fn with_kind(mut self, kind: WorkflowKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_range(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, run: &WorkflowRun) -> bool {
        if self.kind.is_some_and(|k| k != run.kind) {
            return false;
        }
        if self.status.is_some_and(|s| s != run.status) {
            return false;
        }
        if self.since.is_some_and(|t| run.started_at < t) {
            return false;
        }
        if self.until.is_some_and(|t| run.started_at >= t) {
            return false;
        }
        match &self.text {
            Some(needle) => run.search_text().contains(needle.as_str()),
            None => true,
        }
    }
}

/// Append-only workflow history
pub struct HistoryLog {
    runs: RwLock<Vec<WorkflowRun>>,
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
    max_entries: usize,
}

impl HistoryLog {
    /// History that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            runs: RwLock::new(Vec::new()),
            file: None,
            path: None,
            max_entries: DEFAULT_HISTORY_MAX_ENTRIES,
        }
    }

    /// Keep at most `max_entries` runs in memory (at least one)
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        let runs = self.runs.get_mut();
        let excess = runs.len().saturating_sub(self.max_entries);
        runs.drain(..excess);
        self
    }

    /// Open (or create) a JSON-lines history file and load its newest
    /// `max_entries` runs, rewriting the file if it held more
    pub async fn open(path: impl AsRef<Path>, max_entries: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let max_entries = max_entries.max(1);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut runs = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_lines(&content, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if runs.len() > max_entries {
            let dropped = runs.len() - max_entries;
            runs.drain(..dropped);
            compact(&path, &runs).await?;
            info!(path = %path.display(), dropped, kept = runs.len(), "History log compacted");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), runs = runs.len(), "History log opened");

        Ok(Self {
            runs: RwLock::new(runs),
            file: Some(Mutex::new(file)),
            path: Some(path),
            max_entries,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a finished run
    ///
    /// The in-memory log is updated even if the file write fails.
    pub async fn append(&self, run: WorkflowRun) -> Result<()> {
        let line = serde_json::to_string(&run)?;
        let run_id = run.id;
        {
            let mut runs = self.runs.write().await;
            runs.push(run);
            let excess = runs.len().saturating_sub(self.max_entries);
            runs.drain(..excess);
        }

        if let Some(file) = &self.file {
            let mut file = file.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }

        debug!(run_id = %run_id, "Run appended to history");
        Ok(())
    }

    /// Matching runs, newest first
    pub async fn query(&self, filter: &HistoryFilter) -> Vec<WorkflowRun> {
        let runs = self.runs.read().await;
        let mut matched: Vec<WorkflowRun> = runs
            .iter()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matched.truncate(filter.limit);
        matched
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

/// Replace the file with `runs`, one per line
async fn compact(path: &Path, runs: &[WorkflowRun]) -> Result<()> {
    let mut content = String::new();
    for run in runs {
        content.push_str(&serde_json::to_string(run)?);
        content.push('\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn parse_lines(content: &str, path: &Path) -> Vec<WorkflowRun> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| match serde_json::from_str::<WorkflowRun>(line) {
            Ok(run) => Some(run),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = n + 1,
                    error = %e,
                    "Skipping malformed history line"
                );
                None
            }
        })
        .collect()
}
