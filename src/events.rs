use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One event frame pushed by the server for a sync job.
///
/// Every field except the `type` tag is optional on the wire; unknown fields
/// are ignored so the server can add fields without breaking older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Plan(PlanEvent),
    Progress(ProgressEvent),
    StepComplete(StepCompleteEvent),
    JobComplete(JobCompleteEvent),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Advisory weight; plans are not required to sum to 100.
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub steps: Vec<PlannedStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub step: String,
    /// Job-overall progress, 0..=100. Not step-local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedAsset {
    #[serde(default, deserialize_with = "null_as_default")]
    pub code: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub retries: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCompleteEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub step: String,
    /// Informational only; the step's terminal status is derived from `failed_assets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_assets: Option<Vec<FailedAsset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    #[default]
    Success,
    Failed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCompleteEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: JobOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_imported: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_classified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

impl Event {
    /// Parse one inbound frame payload.
    pub fn from_frame(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    pub fn job_id(&self) -> &str {
        match self {
            Event::Plan(e) => &e.job_id,
            Event::Progress(e) => &e.job_id,
            Event::StepComplete(e) => &e.job_id,
            Event::JobComplete(e) => &e.job_id,
            Event::Error(e) => &e.job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Plan(_) => "plan",
            Event::Progress(_) => "progress",
            Event::StepComplete(_) => "step_complete",
            Event::JobComplete(_) => "job_complete",
            Event::Error(_) => "error",
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match self {
            Event::Plan(e) => e.timestamp.as_deref(),
            Event::Progress(e) => e.timestamp.as_deref(),
            Event::StepComplete(e) => e.timestamp.as_deref(),
            Event::JobComplete(e) => e.timestamp.as_deref(),
            Event::Error(e) => e.timestamp.as_deref(),
        }
    }

    /// `job_complete` and `error` end a job's live phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::JobComplete(_) | Event::Error(_))
    }

    /// True when this event belongs to `job_id`. Frames without a job id are
    /// accepted for whichever job the channel is scoped to.
    pub fn belongs_to(&self, job_id: &str) -> bool {
        let own = self.job_id();
        own.is_empty() || own == job_id
    }
}

/// Persisted historical record of one event, as handed out by the event log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl EventLogEntry {
    /// Build a log entry from a live event, stamping it with `timestamp`.
    pub fn from_event(event: &Event, timestamp: String) -> serde_json::Result<Self> {
        let mut data = serde_json::to_value(event)?;
        if let Value::Object(map) = &mut data {
            map.remove("type");
            map.remove("timestamp");
        }
        Ok(Self { kind: event.kind().to_string(), timestamp: Some(timestamp), data })
    }

    /// Unpack into the live event shape, re-attaching the entry's timestamp.
    pub fn to_event(&self) -> serde_json::Result<Event> {
        let mut map = match &self.data {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "log entry data must be an object, got {other}"
                )))
            }
        };
        map.insert("type".into(), Value::String(self.kind.clone()));
        if let Some(ts) = &self.timestamp {
            map.insert("timestamp".into(), Value::String(ts.clone()));
        }
        serde_json::from_value(Value::Object(map))
    }
}
