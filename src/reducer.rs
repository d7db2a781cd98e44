//! Pure step-list reducer.
//!
//! `reduce` never performs I/O and never accumulates: every field it touches
//! is overwritten with the latest value, so re-applying an identical event
//! yields the same list.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::events::{Event, FailedAsset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Partial,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub progress_weight: f64,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub failed_assets: Vec<FailedAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_count: Option<u64>,
}

impl Step {
    pub fn pending(id: impl Into<String>, name: impl Into<String>, progress_weight: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            progress_weight,
            status: StepStatus::Pending,
            running_message: None,
            records_count: None,
            duration_seconds: None,
            detail: None,
            failed_assets: Vec::new(),
            success_count: None,
            fail_count: None,
        }
    }
}

/// Apply one event to the step list and return the new list.
pub fn reduce(steps: &[Step], event: &Event) -> Vec<Step> {
    match event {
        Event::Plan(plan) => {
            let mut seen = HashSet::new();
            plan.steps
                .iter()
                .filter(|s| seen.insert(s.id.as_str()))
                .map(|s| Step::pending(s.id.clone(), s.name.clone(), s.progress))
                .collect()
        }
        Event::Progress(p) => update_step(steps, &p.step, |s| {
            s.status = StepStatus::Running;
            if let Some(msg) = &p.message {
                s.running_message = Some(msg.clone());
            }
        }),
        Event::StepComplete(sc) => update_step(steps, &sc.step, |s| {
            let failed = sc.failed_assets.clone().unwrap_or_default();
            s.status = if failed.is_empty() { StepStatus::Complete } else { StepStatus::Partial };
            s.records_count = sc.records_count;
            s.duration_seconds = sc.duration_seconds;
            s.detail = sc.detail.clone();
            s.failed_assets = failed;
            s.success_count = sc.success_count;
            s.fail_count = sc.fail_count;
        }),
        // Partial and errored steps are overwritten too; the job-level outcome wins.
        Event::JobComplete(_) => steps
            .iter()
            .cloned()
            .map(|mut s| {
                s.status = StepStatus::Complete;
                s
            })
            .collect(),
        Event::Error(_) => steps
            .iter()
            .cloned()
            .map(|mut s| {
                if s.status == StepStatus::Running {
                    s.status = StepStatus::Error;
                }
                s
            })
            .collect(),
    }
}

fn update_step(steps: &[Step], id: &str, f: impl FnOnce(&mut Step)) -> Vec<Step> {
    let mut next = steps.to_vec();
    match next.iter_mut().find(|s| s.id == id) {
        Some(step) => f(step),
        None => tracing::debug!(step = id, "event names a step that is not in the plan"),
    }
    next
}
