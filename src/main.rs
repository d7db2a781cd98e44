use std::{path::PathBuf, sync::Arc};
use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use synctrack::{
    config::TrackerCfg,
    event_log::read_event_log,
    logging,
    ChannelManager, Event, EventApplier, EventLogSource, EventLogWriter, HttpLogSource, JobHooks,
    JobSnapshot, JsonlLogSource, Origin, RecoveryReplayer, SseTransport, StepStatus,
};

#[derive(Parser)]
#[command(name = "synctrack", about = "Follow data-sync jobs and rebuild their progress from event logs")]
struct Cli {
    /// YAML config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Follow a job's live progress until it finishes.
    Watch {
        #[arg(long)]
        job: String,
        /// Append every live event to this JSONL file.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Skip fetching the persisted event log.
        #[arg(long)]
        no_recover: bool,
    },
    /// Rebuild a job's state from a JSONL event log and print it as JSON.
    Replay {
        #[arg(long)]
        log: PathBuf,
        /// Only apply events for this job.
        #[arg(long)]
        job: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => TrackerCfg::load(path).await?,
        None => TrackerCfg::default(),
    }
    .with_env_overrides();
    logging::init(&cfg.logging)?;

    match cli.cmd {
        Cmd::Watch { job, record, no_recover } => watch(cfg, job, record, !no_recover).await,
        Cmd::Replay { log, job } => replay(cfg, log, job).await,
    }
}

async fn watch(cfg: TrackerCfg, job: String, record: Option<PathBuf>, recover: bool) -> Result<()> {
    let client = reqwest::Client::new();
    let transport = Arc::new(SseTransport::new(client.clone(), cfg.server.clone(), cfg.reconnect.clone()));

    let mut hooks = JobHooks::new()
        .on_job_complete(|ev| {
            tracing::info!(
                status = ?ev.status,
                records_imported = ?ev.records_imported,
                records_classified = ?ev.records_classified,
                "job complete"
            )
        })
        .on_error(|ev| tracing::error!(message = %ev.message, "job failed"));

    let mut recorder = None;
    if let Some(path) = record {
        let writer = EventLogWriter::open(path).await?;
        println!("Recording events to {}", writer.path().display());
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        hooks = hooks.on_event(move |ev, origin| {
            if origin == Origin::Live {
                let _ = tx.send(ev.clone());
            }
        });
        recorder = Some(tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Err(e) = writer.record(&ev).await {
                    tracing::warn!(error = %e, "failed to record event");
                }
            }
        }));
    }

    let mut mgr = ChannelManager::new(transport, hooks).with_namespace(cfg.invalidation.namespace.clone());
    if recover && cfg.recovery.enabled {
        let source: Arc<dyn EventLogSource> = match &cfg.recovery.log_dir {
            Some(dir) => Arc::new(JsonlLogSource::new(dir.clone())),
            None => Arc::new(HttpLogSource::new(client, cfg.server.clone())),
        };
        mgr = mgr.with_log_source(source);
    }
    let mut rx = mgr.subscribe();
    mgr.set_job(Some(job.clone()));

    let bar = ProgressBar::new(100);
    bar.set_style(ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {msg}")?.progress_chars("=> "));
    bar.enable_steady_tick(std::time::Duration::from_millis(120));

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() { break; }
                let snap = rx.borrow_and_update().clone();
                render(&bar, &snap);
                if snap.finished { break; }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    let snap = mgr.snapshot();
    bar.finish_and_clear();
    // Dropping the manager drops the hooks, which ends the recorder.
    drop(mgr);
    if let Some(handle) = recorder {
        let _ = handle.await;
    }

    print_summary(&job, &snap);
    match &snap.error {
        Some(msg) => anyhow::bail!("job {job} failed: {msg}"),
        None => Ok(()),
    }
}

async fn replay(cfg: TrackerCfg, log: PathBuf, job: Option<String>) -> Result<()> {
    let entries = read_event_log(&log).await?;
    if entries.is_empty() {
        anyhow::bail!("no events found in {}", log.display());
    }
    let mut applier = EventApplier::new(job, cfg.invalidation.namespace);
    let outcome = RecoveryReplayer::new().replay(&mut applier, &entries);
    tracing::info!(?outcome, "replayed event log");
    println!("{}", serde_json::to_string_pretty(&applier.snapshot())?);
    Ok(())
}

fn render(bar: &ProgressBar, snap: &JobSnapshot) {
    bar.set_position(snap.progress.round() as u64);
    let running = snap.steps.iter().find(|s| s.status == StepStatus::Running).map(|s| format!("[{}] ", s.name));
    let conn = if snap.connected || snap.finished { "" } else { " (reconnecting)" };
    bar.set_message(format!("{}{}{}", running.unwrap_or_default(), snap.message, conn));
}

fn print_summary(job: &str, snap: &JobSnapshot) {
    println!("Job {job}: {:.0}% {}", snap.progress, snap.message);
    for step in &snap.steps {
        let status = match step.status {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Complete => "complete",
            StepStatus::Partial => "partial",
            StepStatus::Error => "error",
        };
        let mut line = format!("  {status:<9} {}", if step.name.is_empty() { &step.id } else { &step.name });
        if let Some(n) = step.records_count { line.push_str(&format!("  records={n}")); }
        if let Some(d) = step.duration_seconds { line.push_str(&format!("  {d:.1}s")); }
        println!("{line}");
        for asset in &step.failed_assets {
            println!("      failed {} ({}) after {} retries: {}", asset.code, asset.name, asset.retries, asset.error);
        }
    }
}
