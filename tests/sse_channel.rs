//! Drives `SseTransport` + `ChannelManager` against a local axum SSE server.

use std::{
    collections::VecDeque,
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    response::sse::{Event as SseEvent, Sse},
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use synctrack::{
    config::{ReconnectCfg, ServerCfg},
    ChannelManager, HttpLogSource, JobHooks, JobSnapshot, SseTransport, StepStatus,
};

#[derive(Clone)]
struct AppState {
    /// Frames for successive connections; each scripted connection closes after its frames.
    scripts: Arc<Mutex<VecDeque<Vec<String>>>>,
    /// Frames for connections once the scripts run out.
    live: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    log: Arc<Value>,
}

impl AppState {
    fn new(scripts: Vec<Vec<Value>>, log: Value) -> Self {
        let (live, _) = broadcast::channel(64);
        let scripts = scripts
            .into_iter()
            .map(|frames| frames.iter().map(Value::to_string).collect())
            .collect();
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            live,
            connections: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(log),
        }
    }
}

async fn job_stream(
    State(st): State<AppState>,
    Path(_job_id): Path<String>,
) -> Sse<BoxStream<'static, Result<SseEvent, Infallible>>> {
    let script = st.scripts.lock().pop_front();
    let stream = match script {
        Some(frames) => stream::iter(frames)
            .map(|data| Ok(SseEvent::default().event("message").data(data)))
            .boxed(),
        None => BroadcastStream::new(st.live.subscribe())
            .filter_map(|msg| async move { msg.ok() })
            .map(|data| Ok(SseEvent::default().event("message").data(data)))
            .boxed(),
    };
    st.connections.fetch_add(1, Ordering::SeqCst);
    Sse::new(stream)
}

async fn job_log(State(st): State<AppState>, Path(_job_id): Path<String>) -> Json<Value> {
    Json((*st.log).clone())
}

async fn serve(state: AppState) -> ServerCfg {
    let app = Router::new()
        .route("/api/data-sync/jobs/{job_id}/stream", get(job_stream))
        .route("/api/data-sync/jobs/{job_id}/events", get(job_log))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    ServerCfg { base_url: format!("http://{addr}"), ..ServerCfg::default() }
}

fn fast_reconnect() -> ReconnectCfg {
    ReconnectCfg { backoff_base_ms: 10, backoff_factor: 2.0, backoff_jitter_ms: 0, max_backoff_ms: 50 }
}

fn plan() -> Value {
    json!({
        "type": "plan",
        "job_id": "job-1",
        "steps": [
            {"id": "fetch", "name": "Fetch", "progress": 40},
            {"id": "classify", "name": "Classify", "progress": 60}
        ]
    })
}

async fn wait_until(rx: &mut watch::Receiver<JobSnapshot>, f: impl FnMut(&JobSnapshot) -> bool) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(f))
        .await
        .expect("timed out waiting for snapshot")
        .expect("manager dropped")
        .clone()
}

fn counting_hooks(completed: &Arc<AtomicUsize>) -> JobHooks {
    let c = completed.clone();
    JobHooks::new().on_job_complete(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn stream_reconnects_and_completes_once() {
    let state = AppState::new(
        vec![
            vec![
                plan(),
                json!({"type": "progress", "job_id": "job-1", "step": "fetch", "message": "Fetching", "progress": 20}),
            ],
            vec![
                json!({"type": "step_complete", "job_id": "job-1", "step": "fetch", "records_count": 12}),
                json!({"type": "progress", "job_id": "job-1", "step": "classify", "message": "Classifying", "progress": 70}),
            ],
        ],
        json!([]),
    );
    let server = serve(state.clone()).await;
    let completed = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(SseTransport::new(reqwest::Client::new(), server, fast_reconnect()));
    let mut mgr = ChannelManager::new(transport, counting_hooks(&completed));
    let mut rx = mgr.subscribe();
    mgr.set_job(Some("job-1".into()));

    // Both scripted connections have run and the third one is following the live feed.
    let snap = wait_until(&mut rx, |s| {
        s.connected && s.steps.get(1).is_some_and(|st| st.status == StepStatus::Running)
    })
    .await;
    assert_eq!(snap.steps[0].status, StepStatus::Complete);
    assert_eq!(snap.steps[0].records_count, Some(12));
    assert_eq!(snap.message, "Classifying");
    assert_eq!(snap.progress, 70.0);
    tokio::time::timeout(Duration::from_secs(10), async {
        while state.connections.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("third connection");

    let done = json!({"type": "job_complete", "job_id": "job-1", "status": "success", "progress": 100}).to_string();
    state.live.send(done.clone()).unwrap();
    // A redelivered terminal frame is a no-op.
    state.live.send(done).unwrap();

    let snap = wait_until(&mut rx, |s| s.finished).await;
    assert_eq!(snap.progress, 100.0);
    assert!(!snap.connected);
    assert!(snap.steps.iter().all(|s| s.status == StepStatus::Complete));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persisted_log_is_replayed_before_live_events() {
    let log = json!({
        "events": [
            {"type": "plan", "timestamp": "2024-05-01T10:00:00Z", "data": {
                "job_id": "job-1",
                "steps": [
                    {"id": "fetch", "name": "Fetch", "progress": 40},
                    {"id": "classify", "name": "Classify", "progress": 60}
                ]
            }},
            {"type": "step_complete", "timestamp": "2024-05-01T10:00:05Z", "data": {
                "job_id": "job-1", "step": "fetch", "records_count": 30,
                "failed_assets": [{"code": "ABC", "name": "Widget", "retries": 3, "error": "timeout"}]
            }}
        ]
    });
    let state = AppState::new(Vec::new(), log);
    let server = serve(state.clone()).await;
    let client = reqwest::Client::new();
    let completed = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(SseTransport::new(client.clone(), server.clone(), fast_reconnect()));
    let mut mgr = ChannelManager::new(transport, counting_hooks(&completed))
        .with_log_source(Arc::new(HttpLogSource::new(client, server)));
    let mut rx = mgr.subscribe();
    mgr.set_job(Some("job-1".into()));

    let snap = wait_until(&mut rx, |s| s.recovered && s.connected).await;
    assert_eq!(snap.steps.len(), 2);
    assert_eq!(snap.steps[0].status, StepStatus::Partial);
    assert_eq!(snap.steps[0].failed_assets.len(), 1);
    assert!(!snap.finished);
    assert_eq!(completed.load(Ordering::SeqCst), 0);

    state
        .live
        .send(json!({"type": "progress", "job_id": "job-1", "step": "classify", "message": "Classifying", "progress": 55}).to_string())
        .unwrap();
    let snap = wait_until(&mut rx, |s| s.message == "Classifying").await;
    assert_eq!(snap.steps[1].status, StepStatus::Running);
    assert_eq!(snap.progress, 55.0);

    state.live.send(json!({"type": "error", "job_id": "job-1", "message": "warehouse offline"}).to_string()).unwrap();
    let snap = wait_until(&mut rx, |s| s.finished).await;
    assert_eq!(snap.error.as_deref(), Some("warehouse offline"));
    assert_eq!(snap.steps[1].status, StepStatus::Error);
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_log_still_tracks_live_events() {
    let state = AppState::new(Vec::new(), json!([]));
    let server = serve(state.clone()).await;
    let client = reqwest::Client::new();
    let completed = Arc::new(AtomicUsize::new(0));
    let transport = Arc::new(SseTransport::new(client.clone(), server.clone(), fast_reconnect()));
    let mut mgr = ChannelManager::new(transport, counting_hooks(&completed))
        .with_log_source(Arc::new(HttpLogSource::new(client, server)));
    let mut rx = mgr.subscribe();
    mgr.set_job(Some("job-1".into()));

    wait_until(&mut rx, |s| s.connected).await;
    state.live.send(plan().to_string()).unwrap();
    state
        .live
        .send(json!({"type": "job_complete", "job_id": "job-1", "status": "success"}).to_string())
        .unwrap();

    let snap = wait_until(&mut rx, |s| s.finished).await;
    assert!(!snap.recovered);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}
