//! Rebuilds tracker state from a persisted event log after a reload.

use crate::applier::EventApplier;
use crate::events::{Event, EventLogEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The log was applied; `skipped` entries could not be unpacked.
    Replayed { applied: usize, skipped: usize },
    /// Nothing to recover.
    Empty,
    /// A log was already replayed for this job.
    AlreadyReplayed,
}

/// Replays at most one log per job id. Create a new one whenever the job changes.
#[derive(Debug, Default)]
pub struct RecoveryReplayer {
    done: bool,
}

impl RecoveryReplayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_replayed(&self) -> bool {
        self.done
    }

    /// Feed `entries` through `applier` in replay mode. If live events were
    /// already applied for this job they are folded back on top of the log,
    /// so the result does not depend on whether the log or the channel won
    /// the race.
    pub fn replay(&mut self, applier: &mut EventApplier, entries: &[EventLogEntry]) -> ReplayOutcome {
        if self.done {
            tracing::debug!(job_id = ?applier.job_id(), "event log already replayed, ignoring");
            return ReplayOutcome::AlreadyReplayed;
        }
        self.done = true;
        if entries.is_empty() {
            return ReplayOutcome::Empty;
        }

        let mut events: Vec<Event> = Vec::with_capacity(entries.len());
        let mut skipped = 0;
        for (idx, entry) in entries.iter().enumerate() {
            match entry.to_event() {
                Ok(ev) => events.push(ev),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(index = idx, kind = %entry.kind, error = %e, "skipping unreadable log entry");
                }
            }
        }
        let applied = events.len();
        applier.rebuild(events);
        applier.mark_recovered();
        tracing::info!(job_id = ?applier.job_id(), applied, skipped, "recovered job state from event log");
        ReplayOutcome::Replayed { applied, skipped }
    }
}
