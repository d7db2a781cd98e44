//! Owns the live push channel for the current job and the state behind it.
//!
//! At most one channel is open at a time. Changing the job id, disabling the
//! manager, or dropping it closes the channel, aborts its tasks, and resets
//! the snapshot, so nothing from one job leaks into the next.

use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};

use crate::applier::{Effect, EventApplier, JobSnapshot, Origin};
use crate::event_log::EventLogSource;
use crate::events::{Event, EventLogEntry};
use crate::hooks::JobHooks;
use crate::recovery::{RecoveryReplayer, ReplayOutcome};
use crate::transport::{Transport, TransportEvent};

pub const DEFAULT_NAMESPACE: &str = "data-sync";

struct Session {
    /// Bumped on every reset; tasks holding an older value must not touch state.
    generation: u64,
    applier: EventApplier,
    replayer: RecoveryReplayer,
}

impl Session {
    /// Replay `entries`. A log that already ends the job also ends the live side.
    fn recover(&mut self, entries: &[EventLogEntry]) -> ReplayOutcome {
        let outcome = self.replayer.replay(&mut self.applier, entries);
        if self.applier.is_finished() {
            self.applier.set_connected(false);
        }
        outcome
    }
}

#[derive(Clone)]
struct Shared {
    session: Arc<Mutex<Session>>,
    snapshot_tx: Arc<watch::Sender<JobSnapshot>>,
}

impl Shared {
    /// Run `f` if the session is still at `generation`, then publish the snapshot.
    fn with_session<R>(&self, generation: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut session = self.session.lock();
        if session.generation != generation {
            return None;
        }
        let out = f(&mut session);
        self.snapshot_tx.send_replace(session.applier.snapshot());
        Some(out)
    }

    /// Like `with_session` but leaves publishing to the caller.
    fn mutate<R>(&self, generation: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut session = self.session.lock();
        if session.generation != generation {
            return None;
        }
        Some(f(&mut session))
    }

    fn publish(&self, generation: u64) {
        let session = self.session.lock();
        if session.generation == generation {
            self.snapshot_tx.send_replace(session.applier.snapshot());
        }
    }

    fn generation(&self) -> u64 {
        self.session.lock().generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.lock().generation == generation
    }
}

pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    log_source: Option<Arc<dyn EventLogSource>>,
    hooks: JobHooks,
    namespace: String,
    shared: Shared,
    job_id: Option<String>,
    enabled: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>, hooks: JobHooks) -> Self {
        let namespace = DEFAULT_NAMESPACE.to_string();
        let (snapshot_tx, _) = watch::channel(JobSnapshot::default());
        let session = Session {
            generation: 0,
            applier: EventApplier::new(None, namespace.clone()),
            replayer: RecoveryReplayer::new(),
        };
        Self {
            transport,
            log_source: None,
            hooks,
            namespace,
            shared: Shared { session: Arc::new(Mutex::new(session)), snapshot_tx: Arc::new(snapshot_tx) },
            job_id: None,
            enabled: true,
            tasks: Vec::new(),
        }
    }

    /// Fetch each new job's persisted log from `source` and replay it.
    pub fn with_log_source(mut self, source: Arc<dyn EventLogSource>) -> Self {
        self.log_source = Some(source);
        self
    }

    /// Namespace passed to the cache invalidator.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switch to `job_id`. `None` or an empty id turns tracking off.
    /// Must be called from within a tokio runtime.
    pub fn set_job(&mut self, job_id: Option<String>) {
        let job_id = job_id.filter(|id| !id.is_empty());
        if job_id == self.job_id {
            return;
        }
        self.job_id = job_id;
        self.reconcile();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        self.reconcile();
    }

    /// Replay a log handed over by the caller. Only the first log per job is used.
    /// If the log ends the job, the live channel is closed.
    pub fn recover(&self, entries: &[EventLogEntry]) -> ReplayOutcome {
        let Some(job_id) = self.active_job() else {
            tracing::debug!("no active job, ignoring event log");
            return ReplayOutcome::Empty;
        };
        let generation = self.shared.generation();
        let outcome = self
            .shared
            .with_session(generation, |s| s.recover(entries))
            .unwrap_or(ReplayOutcome::AlreadyReplayed);
        if matches!(outcome, ReplayOutcome::Replayed { .. }) {
            emit_replayed(&self.hooks, job_id, entries);
        }
        outcome
    }

    /// Close the channel and clear all state.
    pub fn close(&mut self) {
        self.job_id = None;
        self.reconcile();
    }

    fn active_job(&self) -> Option<&str> {
        self.job_id.as_deref().filter(|_| self.enabled)
    }

    fn reconcile(&mut self) {
        let generation = self.teardown();
        let Some(job_id) = self.active_job().map(str::to_string) else {
            return;
        };

        tracing::info!(%job_id, "opening job channel");
        let stream = self.transport.open(&job_id);
        self.tasks.push(tokio::spawn(run_channel(
            stream,
            self.shared.clone(),
            generation,
            job_id.clone(),
            self.hooks.clone(),
        )));

        if let Some(source) = self.log_source.clone() {
            let shared = self.shared.clone();
            let hooks = self.hooks.clone();
            self.tasks.push(tokio::spawn(async move {
                match source.fetch(&job_id).await {
                    Ok(entries) => {
                        let outcome = shared.with_session(generation, |s| s.recover(&entries));
                        if matches!(outcome, Some(ReplayOutcome::Replayed { .. })) && shared.is_current(generation) {
                            emit_replayed(&hooks, &job_id, &entries);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%job_id, error = %format!("{e:#}"), "event log unavailable, tracking live events only");
                    }
                }
            }));
        }
    }

    /// Abort running tasks and reset state for the current job id. Returns the new generation.
    fn teardown(&mut self) -> u64 {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let job = self.active_job().map(str::to_string);
        let mut session = self.shared.session.lock();
        session.generation += 1;
        session.applier = EventApplier::new(job, self.namespace.clone());
        session.replayer = RecoveryReplayer::new();
        self.shared.snapshot_tx.send_replace(session.applier.snapshot());
        session.generation
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.session.lock().generation += 1;
    }
}

fn emit_replayed(hooks: &JobHooks, job_id: &str, entries: &[EventLogEntry]) {
    for event in entries.iter().filter_map(|entry| entry.to_event().ok()) {
        if event.belongs_to(job_id) {
            hooks.emit_event(&event, Origin::Replay);
        }
    }
}

/// Hand an applied frame to the hooks unless the manager moved on in the
/// meantime. A callback already running when the manager is torn down on
/// another thread still completes.
fn deliver(
    shared: &Shared,
    generation: u64,
    hooks: &JobHooks,
    observed: Option<&Event>,
    effects: Vec<Effect>,
) -> bool {
    if !shared.is_current(generation) {
        return false;
    }
    if let Some(ev) = observed {
        hooks.emit_event(ev, Origin::Live);
    }
    hooks.dispatch(effects);
    true
}

async fn run_channel(
    mut stream: BoxStream<'static, TransportEvent>,
    shared: Shared,
    generation: u64,
    job_id: String,
    hooks: JobHooks,
) {
    // A replayed log can end the job too; dropping the stream closes the channel.
    let mut snapshots = shared.snapshot_tx.subscribe();
    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = async { let _ = snapshots.wait_for(|s| s.finished).await; } => {
                tracing::info!(%job_id, "job finished, closing channel");
                return;
            }
        };
        let Some(msg) = msg else { break };
        match msg {
            TransportEvent::Opened => {
                let current = shared.with_session(generation, |s| {
                    if !s.applier.is_finished() {
                        s.applier.set_connected(true);
                        s.applier.clear_error();
                    }
                });
                if current.is_none() {
                    return;
                }
                tracing::info!(%job_id, "job channel connected");
            }
            TransportEvent::Fault(reason) => {
                tracing::warn!(%job_id, %reason, "job channel dropped, waiting for reconnect");
                if shared.with_session(generation, |s| s.applier.set_connected(false)).is_none() {
                    return;
                }
            }
            TransportEvent::Frame(payload) => {
                let event = match Event::from_frame(&payload) {
                    Ok(ev) => ev,
                    Err(e) => {
                        tracing::warn!(%job_id, error = %e, "discarding malformed frame");
                        continue;
                    }
                };
                // Hooks run before the snapshot is published, so anyone who sees
                // `finished` can rely on the callbacks having fired.
                let applied = shared.mutate(generation, |s| {
                    let observed = s.applier.will_accept(&event).then(|| event.clone());
                    let effects = s.applier.apply(event, Origin::Live);
                    let finished = s.applier.is_finished();
                    if finished {
                        s.applier.set_connected(false);
                    }
                    (observed, effects, finished)
                });
                let Some((observed, effects, finished)) = applied else {
                    return;
                };
                if !deliver(&shared, generation, &hooks, observed.as_ref(), effects) {
                    return;
                }
                shared.publish(generation);
                if finished {
                    tracing::info!(%job_id, "job finished, closing channel");
                    return;
                }
            }
        }
    }
    shared.with_session(generation, |s| s.applier.set_connected(false));
}
