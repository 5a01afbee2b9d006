use crate::cluster::WorkerId;

/// One completed packet, for performance monitoring.
#[derive(Debug, Clone)]
pub struct PacketEvent<'a> {
    pub worker: &'a WorkerId,
    pub worker_host: &'a str,
    pub file_url: &'a str,
    pub entries: i64,
    pub latency: f64,
    pub proc_time: f64,
    pub proc_cpu: f64,
    pub bytes_read: i64,
}

/// A worker opening or closing a file.
#[derive(Debug, Clone)]
pub struct FileEvent<'a> {
    pub worker: &'a WorkerId,
    pub worker_host: &'a str,
    pub node: &'a str,
    pub file_url: &'a str,
    pub opened: bool,
}

/// Sink for scheduling performance events, injected at construction.
///
/// `None` at construction disables the events entirely; implementations must
/// be cheap, they run inline with dispatch.
pub trait PerfSink: Send + Sync {
    fn packet_event(&self, ev: &PacketEvent<'_>);
    fn file_event(&self, ev: &FileEvent<'_>);
}
