use futures_util::stream::BoxStream;

/// What a push channel reports to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is (re)established.
    Opened,
    /// One raw frame payload, not yet parsed.
    Frame(String),
    /// The connection dropped. The transport keeps reconnecting on its own.
    Fault(String),
}

/// A push channel scoped to one job.
///
/// Dropping the returned stream closes the channel and cancels any pending
/// reconnect timer the transport was running.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, job_id: &str) -> BoxStream<'static, TransportEvent>;
}
