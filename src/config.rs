use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub base_url: String,
    /// Path of the push stream; `{job_id}` is substituted.
    pub stream_path: String,
    /// Path of the persisted event log; `{job_id}` is substituted.
    pub log_path: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            stream_path: "/api/data-sync/jobs/{job_id}/stream".into(),
            log_path: "/api/data-sync/jobs/{job_id}/events".into(),
        }
    }
}

impl ServerCfg {
    pub fn stream_url(&self, job_id: &str) -> Result<Url> {
        job_url(&self.base_url, &self.stream_path, job_id)
    }

    pub fn log_url(&self, job_id: &str) -> Result<Url> {
        job_url(&self.base_url, &self.log_path, job_id)
    }
}

/// Append `template` to `base` one segment at a time, percent-encoding the job id.
fn job_url(base: &str, template: &str, job_id: &str) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid base_url: {base}"))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("base_url cannot take a path: {base}"))?;
        segments.pop_if_empty();
        for part in template.split('/').filter(|p| !p.is_empty()) {
            let segment = part.replace("{job_id}", job_id);
            if segment == "." || segment == ".." {
                anyhow::bail!("job id {job_id:?} is not a valid path segment");
            }
            segments.push(&segment);
        }
    }
    Ok(url)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectCfg {
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_jitter_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self { backoff_base_ms: 500, backoff_factor: 2.0, backoff_jitter_ms: 250, max_backoff_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryCfg {
    pub enabled: bool,
    /// Read logs from `<log_dir>/<job_id>.jsonl` instead of the server.
    pub log_dir: Option<PathBuf>,
}

impl Default for RecoveryCfg {
    fn default() -> Self {
        Self { enabled: true, log_dir: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationCfg {
    pub namespace: String,
}

impl Default for InvalidationCfg {
    fn default() -> Self {
        Self { namespace: "data-sync".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingCfg {
    pub level: String,
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerCfg {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub reconnect: ReconnectCfg,
    #[serde(default)]
    pub recovery: RecoveryCfg,
    #[serde(default)]
    pub invalidation: InvalidationCfg,
    #[serde(default)]
    pub logging: LoggingCfg,
}

impl TrackerCfg {
    pub async fn load(path: &Path) -> Result<Self> {
        let txt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&txt)
    }

    pub fn from_yaml(txt: &str) -> Result<Self> {
        serde_yaml::from_str(txt).context("Failed to parse config YAML")
    }

    /// Apply environment overrides (`SYNCTRACK_BASE_URL`).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("SYNCTRACK_BASE_URL") {
            self.server.base_url = url;
        }
        self
    }
}
