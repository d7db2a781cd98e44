//! Server-Sent Events transport with automatic reconnect.

use futures_util::stream::{BoxStream, StreamExt};
use reqwest::{header::ACCEPT, Url};
use tokio::{sync::mpsc, time::{sleep, Duration}};
use tokio_stream::wrappers::ReceiverStream;

use crate::backoff::backoff_ms;
use crate::config::{ReconnectCfg, ServerCfg};
use crate::transport::{Transport, TransportEvent};

pub struct SseTransport {
    client: reqwest::Client,
    server: ServerCfg,
    reconnect: ReconnectCfg,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, server: ServerCfg, reconnect: ReconnectCfg) -> Self {
        Self { client, server, reconnect }
    }
}

impl Transport for SseTransport {
    fn open(&self, job_id: &str) -> BoxStream<'static, TransportEvent> {
        let (tx, rx) = mpsc::channel(64);
        match self.server.stream_url(job_id) {
            Ok(url) => {
                tokio::spawn(pump(self.client.clone(), url, self.reconnect.clone(), tx));
            }
            Err(e) => {
                // Nothing to connect to; the stream ends right after the fault.
                let _ = tx.try_send(TransportEvent::Fault(format!("{e:#}")));
            }
        }
        ReceiverStream::new(rx).boxed()
    }
}

/// Keep the stream connected until the receiving side goes away.
async fn pump(client: reqwest::Client, url: Url, reconnect: ReconnectCfg, tx: mpsc::Sender<TransportEvent>) {
    let mut attempt: u32 = 0;
    loop {
        let result = tokio::select! {
            _ = tx.closed() => return,
            r = read_stream(&client, &url, &tx, &mut attempt) => r,
        };
        if tx.is_closed() {
            return;
        }
        let reason = match result {
            Ok(()) => "stream ended by server".to_string(),
            Err(e) => format!("{e:#}"),
        };
        if tx.send(TransportEvent::Fault(reason)).await.is_err() {
            return;
        }

        attempt += 1;
        let delay = backoff_ms(attempt, &reconnect);
        tracing::debug!(%url, attempt, delay_ms = delay, "reconnecting event stream");
        tokio::select! {
            _ = tx.closed() => return,
            _ = sleep(Duration::from_millis(delay)) => {}
        }
    }
}

async fn read_stream(
    client: &reqwest::Client,
    url: &Url,
    tx: &mpsc::Sender<TransportEvent>,
    attempt: &mut u32,
) -> anyhow::Result<()> {
    let resp = client.get(url.clone()).header(ACCEPT, "text/event-stream").send().await?.error_for_status()?;
    *attempt = 0;
    if tx.send(TransportEvent::Opened).await.is_err() {
        return Ok(());
    }
    let mut decoder = SseDecoder::default();
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for data in decoder.push(&chunk) {
            if tx.send(TransportEvent::Frame(data)).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Incremental `text/event-stream` decoder yielding each event's `data` payload.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(data) = parse_block(&block) {
                out.push(data);
            }
        }
        out
    }
}

fn parse_block(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    // Comments, `event:`, `id:` and `retry:` lines carry nothing the tracker needs.
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data.is_empty() { None } else { Some(data.join("\n")) }
}
