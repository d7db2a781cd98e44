//! Consumer callbacks and the downstream cache-invalidation capability.
//!
//! All hooks are optional and `Send + Sync` so they can be invoked from the
//! channel reader task. They are always called outside the tracker lock.

use std::sync::Arc;

use crate::applier::{Effect, Origin};
use crate::events::{ErrorEvent, Event, JobCompleteEvent};

/// Receives "this namespace changed, refetch it" signals.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, namespace: &str);
}

/// Invalidator that only logs; the default when nothing else is wired up.
pub struct LogInvalidator;

impl CacheInvalidator for LogInvalidator {
    fn invalidate(&self, namespace: &str) {
        tracing::info!(namespace, "cache invalidated");
    }
}

pub type OnJobCompleteCallback = Arc<dyn Fn(&JobCompleteEvent) + Send + Sync>;
pub type OnErrorCallback = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;
pub type OnEventCallback = Arc<dyn Fn(&Event, Origin) + Send + Sync>;

#[derive(Clone, Default)]
pub struct JobHooks {
    on_job_complete: Option<OnJobCompleteCallback>,
    on_error: Option<OnErrorCallback>,
    on_event: Option<OnEventCallback>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
}

impl JobHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_job_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobCompleteEvent) + Send + Sync + 'static,
    {
        self.on_job_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Observe live frames the tracker accepts (duplicates after a terminal
    /// event are not passed on) and, with `Origin::Replay`, the entries of a
    /// replayed event log.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event, Origin) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    pub fn invalidator(mut self, inv: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(inv);
        self
    }

    pub(crate) fn emit_event(&self, event: &Event, origin: Origin) {
        if let Some(cb) = &self.on_event {
            cb(event, origin);
        }
    }

    /// Run the effects returned by the applier, in order.
    pub fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::JobCompleted(ev) => {
                    if let Some(cb) = &self.on_job_complete {
                        cb(&ev);
                    }
                }
                Effect::JobFailed(ev) => {
                    if let Some(cb) = &self.on_error {
                        cb(&ev);
                    }
                }
                Effect::InvalidateCache(namespace) => match &self.invalidator {
                    Some(inv) => inv.invalidate(&namespace),
                    None => LogInvalidator.invalidate(&namespace),
                },
            }
        }
    }
}
