use anyhow::{Context, Result};
use serde::Deserialize;
use std::{future::Future, path::{Path, PathBuf}, pin::Pin, sync::Arc};
use tokio::{fs::{self, OpenOptions}, io::{AsyncBufReadExt, AsyncWriteExt}, sync::Mutex};

use crate::events::{Event, EventLogEntry};

/// Append-only JSONL writer, one `EventLogEntry` per line.
#[derive(Clone)]
pub struct EventLogWriter {
    file: Arc<Mutex<tokio::fs::File>>,
    path: PathBuf,
}

impl EventLogWriter {
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() { fs::create_dir_all(parent).await?; }
        let file = OpenOptions::new().create(true).append(true).open(&path).await
            .with_context(|| format!("Failed to open event log: {}", path.display()))?;
        Ok(Self { file: Arc::new(Mutex::new(file)), path })
    }

    pub async fn append(&self, entry: &EventLogEntry) -> Result<()> {
        let mut f = self.file.lock().await;
        let line = serde_json::to_vec(entry)?;
        f.write_all(&line).await?;
        f.write_all(b"\n").await?;
        f.flush().await?;
        Ok(())
    }

    /// Stamp `event` with the current time and append it.
    pub async fn record(&self, event: &Event) -> Result<()> {
        let ts = event.timestamp().map(str::to_string).unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        self.append(&EventLogEntry::from_event(event, ts)?).await
    }

    pub fn path(&self) -> &Path { &self.path }
}

/// Read a JSONL event log. A missing file is an empty log; unreadable lines are skipped.
pub async fn read_event_log(path: &Path) -> Result<Vec<EventLogEntry>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to open event log: {}", path.display())),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut entries = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() { continue; }
        match serde_json::from_str::<EventLogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(path = %path.display(), line = line_no, error = %e, "skipping malformed log line"),
        }
    }
    Ok(entries)
}

/// Where a job's persisted event log comes from.
pub trait EventLogSource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventLogEntry>>> + Send + 'a>>;
}

/// Logs stored as `<dir>/<job_id>.jsonl`.
pub struct JsonlLogSource { dir: PathBuf }

impl JsonlLogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

    /// Ids that could leave `dir` are rejected.
    pub fn path_for(&self, job_id: &str) -> Result<PathBuf> {
        if job_id.is_empty() || job_id == "." || job_id == ".." || job_id.contains(['/', '\\', '\0']) {
            anyhow::bail!("job id {job_id:?} cannot be used as a log file name");
        }
        Ok(self.dir.join(format!("{job_id}.jsonl")))
    }
}

impl EventLogSource for JsonlLogSource {
    fn fetch<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventLogEntry>>> + Send + 'a>> {
        Box::pin(async move { read_event_log(&self.path_for(job_id)?).await })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogBody {
    Bare(Vec<EventLogEntry>),
    Wrapped { events: Vec<EventLogEntry> },
}

/// Fetches the log from the sync API.
pub struct HttpLogSource {
    client: reqwest::Client,
    server: crate::config::ServerCfg,
}

impl HttpLogSource {
    pub fn new(client: reqwest::Client, server: crate::config::ServerCfg) -> Self { Self { client, server } }
}

impl EventLogSource for HttpLogSource {
    fn fetch<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventLogEntry>>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.server.log_url(job_id)?;
            let resp = self.client.get(url.clone()).send().await
                .with_context(|| format!("Failed to fetch event log from {url}"))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let body = resp.error_for_status()?.json::<LogBody>().await
                .context("Failed to decode event log")?;
            Ok(match body {
                LogBody::Bare(entries) | LogBody::Wrapped { events: entries } => entries,
            })
        })
    }
}
