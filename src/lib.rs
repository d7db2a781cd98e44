//! Streaming progress tracker for multi-step data-sync jobs.
//!
//! Live frames arrive over a push channel ([`ChannelManager`]), a persisted
//! event log can rebuild the same view after a reload ([`RecoveryReplayer`]),
//! and one-time effects such as completion callbacks fire at most once per job.

pub mod applier;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod event_log;
pub mod events;
pub mod hooks;
pub mod logging;
pub mod recovery;
pub mod reducer;
pub mod sse;
pub mod transport;

pub use applier::{Effect, EventApplier, JobSnapshot, Origin};
pub use channel::ChannelManager;
pub use config::TrackerCfg;
pub use event_log::{EventLogSource, EventLogWriter, HttpLogSource, JsonlLogSource};
pub use events::{Event, EventLogEntry, FailedAsset};
pub use hooks::{CacheInvalidator, JobHooks};
pub use recovery::{RecoveryReplayer, ReplayOutcome};
pub use reducer::{reduce, Step, StepStatus};
pub use sse::SseTransport;
pub use transport::{Transport, TransportEvent};
