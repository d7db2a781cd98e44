//! Sequences events into the reducer and decides which one-time effects fire.
//!
//! Live events may update the display fields and trigger the completion/error
//! callbacks and cache invalidation. Replayed events only rebuild state; the
//! effects they describe already happened in an earlier page lifetime.

use serde::Serialize;
use std::collections::VecDeque;

use crate::events::{ErrorEvent, Event, JobCompleteEvent};
use crate::reducer::{reduce, Step};

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Live,
    Replay,
}

/// One-time side effect requested by an applied event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    JobCompleted(JobCompleteEvent),
    JobFailed(ErrorEvent),
    InvalidateCache(String),
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: Option<String>,
    pub steps: Vec<Step>,
    pub message: String,
    pub progress: f64,
    pub connected: bool,
    pub error: Option<String>,
    pub recovered: bool,
    /// A terminal event has been applied.
    pub finished: bool,
}

#[derive(Debug, Clone, Copy)]
struct Gate {
    display: bool,
    effects: bool,
}

impl Gate {
    const LIVE: Gate = Gate { display: true, effects: true };
    const REPLAY: Gate = Gate { display: false, effects: false };
    /// Live events re-folded on top of a recovered log: their effects already ran.
    const REFOLD: Gate = Gate { display: true, effects: false };

    fn for_origin(origin: Origin) -> Gate {
        match origin {
            Origin::Live => Gate::LIVE,
            Origin::Replay => Gate::REPLAY,
        }
    }
}

const MAX_PENDING: usize = 256;

pub struct EventApplier {
    job_id: Option<String>,
    namespace: String,
    steps: Vec<Step>,
    message: String,
    progress: f64,
    error: Option<String>,
    connected: bool,
    recovered: bool,
    planned: bool,
    finished: bool,
    completion_fired: bool,
    error_fired: bool,
    /// Step events that arrived before the plan.
    pending: VecDeque<(Event, Gate)>,
    /// Live events accepted for this job, in arrival order.
    live_history: Vec<Event>,
}

impl EventApplier {
    /// Fresh state for `job_id`. Cache invalidations are signalled under `namespace`.
    pub fn new(job_id: Option<String>, namespace: impl Into<String>) -> Self {
        Self {
            job_id,
            namespace: namespace.into(),
            steps: Vec::new(),
            message: String::new(),
            progress: 0.0,
            error: None,
            connected: false,
            recovered: false,
            planned: false,
            finished: false,
            completion_fired: false,
            error_fired: false,
            pending: VecDeque::new(),
            live_history: Vec::new(),
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether `apply` would act on `event`: it belongs to this job and the
    /// job has not finished yet.
    pub fn will_accept(&self, event: &Event) -> bool {
        !self.finished && self.job_id.as_deref().map_or(true, |id| event.belongs_to(id))
    }

    pub fn has_live_events(&self) -> bool {
        !self.live_history.is_empty()
    }

    /// Apply one event and return the effects the caller must perform.
    pub fn apply(&mut self, event: Event, origin: Origin) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.accepts(&event) {
            return effects;
        }
        if origin == Origin::Live && !self.finished {
            self.live_history.push(event.clone());
        }
        self.fold(event, Gate::for_origin(origin), &mut effects);
        effects
    }

    /// Reset derived state and rebuild it from `log`, then re-fold any live
    /// events already seen for this job. Never produces effects.
    pub(crate) fn rebuild(&mut self, log: Vec<Event>) {
        let history = std::mem::take(&mut self.live_history);
        self.steps.clear();
        self.message.clear();
        self.progress = 0.0;
        self.error = None;
        self.planned = false;
        self.finished = false;
        self.pending.clear();

        let mut effects = Vec::new();
        for event in log {
            if self.accepts(&event) {
                self.fold(event, Gate::REPLAY, &mut effects);
            }
        }
        for event in &history {
            self.fold(event.clone(), Gate::REFOLD, &mut effects);
        }
        self.live_history = history;
        debug_assert!(effects.is_empty(), "rebuild must not produce effects");
    }

    pub(crate) fn mark_recovered(&mut self) {
        self.recovered = true;
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub(crate) fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            steps: self.steps.clone(),
            message: self.message.clone(),
            progress: self.progress,
            connected: self.connected,
            error: self.error.clone(),
            recovered: self.recovered,
            finished: self.finished,
        }
    }

    fn accepts(&self, event: &Event) -> bool {
        match &self.job_id {
            Some(id) if !event.belongs_to(id) => {
                tracing::debug!(
                    job_id = %id,
                    event_job_id = event.job_id(),
                    kind = event.kind(),
                    "ignoring event for another job"
                );
                false
            }
            _ => true,
        }
    }

    fn fold(&mut self, event: Event, gate: Gate, effects: &mut Vec<Effect>) {
        if self.finished {
            tracing::debug!(kind = event.kind(), "job already finished, ignoring event");
            return;
        }
        if !self.planned && matches!(event, Event::Progress(_) | Event::StepComplete(_)) {
            if self.pending.len() == MAX_PENDING {
                tracing::warn!("too many events before plan, dropping oldest");
                self.pending.pop_front();
            }
            self.pending.push_back((event, gate));
            return;
        }

        self.steps = reduce(&self.steps, &event);
        match &event {
            Event::Plan(plan) => {
                self.planned = true;
                self.message = plan.message.clone().unwrap_or_default();
                self.progress = 0.0;
                let buffered: Vec<_> = self.pending.drain(..).collect();
                for (ev, g) in buffered {
                    self.fold(ev, g, effects);
                }
            }
            Event::Progress(p) => {
                if gate.display {
                    if let Some(msg) = &p.message {
                        self.message = msg.clone();
                    }
                    if let Some(pct) = p.progress {
                        self.advance_progress(pct);
                    }
                }
            }
            Event::StepComplete(sc) => {
                if gate.display {
                    if let Some(msg) = &sc.message {
                        self.message = msg.clone();
                    }
                }
            }
            Event::JobComplete(done) => {
                self.progress = 100.0;
                self.finished = true;
                if gate.display {
                    if let Some(msg) = &done.message {
                        self.message = msg.clone();
                    }
                }
                if gate.effects && !self.completion_fired {
                    self.completion_fired = true;
                    effects.push(Effect::JobCompleted(done.clone()));
                    effects.push(Effect::InvalidateCache(self.namespace.clone()));
                }
            }
            Event::Error(err) => {
                self.error = Some(err.message.clone());
                self.finished = true;
                if gate.effects && !self.error_fired {
                    self.error_fired = true;
                    effects.push(Effect::JobFailed(err.clone()));
                    effects.push(Effect::InvalidateCache(self.namespace.clone()));
                }
            }
        }
    }

    fn advance_progress(&mut self, pct: f64) {
        if pct.is_nan() {
            return;
        }
        let pct = pct.clamp(0.0, 100.0);
        if pct >= self.progress {
            self.progress = pct;
        } else {
            tracing::debug!(current = self.progress, reported = pct, "ignoring regressing progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        FailedAsset, JobOutcome, PlanEvent, PlannedStep, ProgressEvent, StepCompleteEvent,
    };
    use crate::reducer::StepStatus;

    fn plan(ids: &[&str]) -> Event {
        Event::Plan(PlanEvent {
            job_id: "j1".into(),
            steps: ids
                .iter()
                .map(|id| PlannedStep { id: id.to_string(), name: id.to_string(), progress: 50.0 })
                .collect(),
            message: Some("planned".into()),
            timestamp: None,
        })
    }

    fn progress(step: &str, pct: f64, msg: &str) -> Event {
        Event::Progress(ProgressEvent {
            job_id: "j1".into(),
            step: step.into(),
            progress: Some(pct),
            message: Some(msg.into()),
            timestamp: None,
        })
    }

    fn job_complete() -> Event {
        Event::JobComplete(JobCompleteEvent {
            job_id: "j1".into(),
            status: JobOutcome::Success,
            progress: Some(100.0),
            ..Default::default()
        })
    }

    fn error(msg: &str) -> Event {
        Event::Error(ErrorEvent { job_id: "j1".into(), message: msg.into(), timestamp: None })
    }

    fn count_completions(effects: &[Effect]) -> usize {
        effects.iter().filter(|e| matches!(e, Effect::JobCompleted(_))).count()
    }

    #[test]
    fn scenario_full_job_with_partial_step() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        let mut effects = Vec::new();

        effects.extend(app.apply(plan(&["fetch", "classify"]), Origin::Live));
        let snap = app.snapshot();
        assert_eq!(snap.steps.len(), 2);
        assert!(snap.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(snap.progress, 0.0);

        effects.extend(app.apply(progress("fetch", 40.0, "m1"), Origin::Live));
        let snap = app.snapshot();
        assert_eq!(snap.steps[0].status, StepStatus::Running);
        assert_eq!(snap.steps[0].running_message.as_deref(), Some("m1"));
        assert_eq!(snap.progress, 40.0);
        assert_eq!(snap.message, "m1");

        effects.extend(app.apply(
            Event::StepComplete(StepCompleteEvent {
                job_id: "j1".into(),
                step: "fetch".into(),
                records_count: Some(120),
                ..Default::default()
            }),
            Origin::Live,
        ));
        assert_eq!(app.steps()[0].status, StepStatus::Complete);
        assert_eq!(app.steps()[0].records_count, Some(120));

        effects.extend(app.apply(
            Event::StepComplete(StepCompleteEvent {
                job_id: "j1".into(),
                step: "classify".into(),
                failed_assets: Some(vec![FailedAsset {
                    code: "X".into(),
                    name: "x".into(),
                    retries: 1,
                    error: "timeout".into(),
                }]),
                ..Default::default()
            }),
            Origin::Live,
        ));
        assert_eq!(app.steps()[1].status, StepStatus::Partial);
        assert_eq!(app.steps()[1].failed_assets.len(), 1);
        assert!(effects.is_empty());

        effects.extend(app.apply(job_complete(), Origin::Live));
        let snap = app.snapshot();
        assert!(snap.steps.iter().all(|s| s.status == StepStatus::Complete));
        assert_eq!(snap.progress, 100.0);
        assert!(snap.finished);
        assert_eq!(count_completions(&effects), 1);
        assert!(effects.contains(&Effect::InvalidateCache("data-sync".into())));
    }

    #[test]
    fn error_marks_running_step_and_fires_once() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(plan(&["fetch", "classify"]), Origin::Live);
        app.apply(progress("fetch", 10.0, "working"), Origin::Live);
        let effects = app.apply(error("boom"), Origin::Live);
        let again = app.apply(error("boom"), Origin::Live);

        let snap = app.snapshot();
        assert_eq!(snap.steps[0].status, StepStatus::Error);
        assert_eq!(snap.steps[1].status, StepStatus::Pending);
        assert_eq!(snap.error.as_deref(), Some("boom"));
        assert!(matches!(&effects[0], Effect::JobFailed(e) if e.message == "boom"));
        assert_eq!(effects.len(), 2);
        assert!(again.is_empty());
    }

    #[test]
    fn duplicate_job_complete_fires_once() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(plan(&["fetch"]), Origin::Live);
        let first = app.apply(job_complete(), Origin::Live);
        let second = app.apply(job_complete(), Origin::Live);
        assert_eq!(count_completions(&first), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn replay_produces_no_effects() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        let mut effects = Vec::new();
        for ev in [plan(&["fetch"]), progress("fetch", 50.0, "half"), job_complete()] {
            effects.extend(app.apply(ev, Origin::Replay));
        }
        assert!(effects.is_empty());
        let snap = app.snapshot();
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.steps[0].status, StepStatus::Complete);
    }

    #[test]
    fn replayed_progress_leaves_display_fields_alone() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(plan(&["fetch"]), Origin::Replay);
        app.apply(progress("fetch", 50.0, "half"), Origin::Replay);
        let snap = app.snapshot();
        assert_eq!(snap.steps[0].status, StepStatus::Running);
        assert_eq!(snap.message, "planned");
        assert_eq!(snap.progress, 0.0);
    }

    #[test]
    fn progress_never_regresses() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(plan(&["fetch"]), Origin::Live);
        let mut seen = Vec::new();
        for pct in [10.0, 35.0, 20.0, 80.0, 150.0] {
            app.apply(progress("fetch", pct, "m"), Origin::Live);
            seen.push(app.snapshot().progress);
        }
        assert_eq!(seen, [10.0, 35.0, 35.0, 80.0, 100.0]);
    }

    #[test]
    fn events_for_other_jobs_are_ignored() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(plan(&["fetch"]), Origin::Live);
        let effects = app.apply(
            Event::JobComplete(JobCompleteEvent { job_id: "j2".into(), ..Default::default() }),
            Origin::Live,
        );
        assert!(effects.is_empty());
        assert!(!app.is_finished());
    }

    #[test]
    fn step_events_before_plan_are_buffered() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(progress("fetch", 30.0, "early"), Origin::Live);
        assert!(app.steps().is_empty());
        assert_eq!(app.snapshot().progress, 0.0);

        app.apply(plan(&["fetch"]), Origin::Live);
        let snap = app.snapshot();
        assert_eq!(snap.steps[0].status, StepStatus::Running);
        assert_eq!(snap.progress, 30.0);
        assert_eq!(snap.message, "early");
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(plan(&["fetch"]), Origin::Live);
        app.apply(error("boom"), Origin::Live);
        let effects = app.apply(job_complete(), Origin::Live);
        assert!(effects.is_empty());
        assert_eq!(app.snapshot().progress, 0.0);
        assert_eq!(app.snapshot().error.as_deref(), Some("boom"));
    }

    #[test]
    fn will_accept_rejects_foreign_and_post_terminal_events() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        let foreign = Event::Error(ErrorEvent { job_id: "j2".into(), ..Default::default() });
        assert!(app.will_accept(&plan(&["fetch"])));
        assert!(!app.will_accept(&foreign));

        app.apply(plan(&["fetch"]), Origin::Live);
        app.apply(job_complete(), Origin::Live);
        assert!(!app.will_accept(&job_complete()));
        assert!(!app.will_accept(&progress("fetch", 10.0, "late")));
    }

    #[test]
    fn rebuild_keeps_fired_flags() {
        let mut app = EventApplier::new(Some("j1".into()), "data-sync");
        app.apply(plan(&["fetch"]), Origin::Live);
        app.apply(job_complete(), Origin::Live);
        app.rebuild(vec![plan(&["fetch"])]);
        // The live job_complete is re-folded, so the job stays finished.
        assert!(app.is_finished());
        assert_eq!(app.snapshot().progress, 100.0);
        assert!(app.apply(job_complete(), Origin::Live).is_empty());
    }
}
