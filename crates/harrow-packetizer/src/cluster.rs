use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use harrow_core::Element;

/// Stable identity of a worker process, unique within one query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static worker description from the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    /// FQDN of the machine the worker runs on, for locality matching.
    pub host: String,
    /// Relative processing power; only used to size a worker's first packet.
    pub perf_index: i64,
}

/// Timing a worker reports when it finishes a packet, piggy-backed on its
/// next packet request.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PacketReport {
    /// Seconds between dispatch and the worker starting to process.
    pub latency: f64,
    /// Wall-clock processing seconds; drives the rate estimate.
    pub proc_time: f64,
    /// CPU seconds, reported for diagnostics only.
    pub proc_cpu: f64,
    pub bytes_read: Option<i64>,
    /// Re-confirmed total entry count of the current file.
    pub total_entries: Option<i64>,
    /// Running total of records this worker has seen; overrides the packet's
    /// nominal size in the accounting when present.
    pub events_seen: Option<i64>,
}

/// Messages the master sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MasterMsg {
    /// Pre-flight: open the file and report its true entry count.
    GetEntries {
        records: bool,
        url: String,
        dir: String,
        obj: String,
    },
    /// A work unit: the element sub-range to process.
    Packet(Element),
}

/// Messages a worker sends back to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMsg {
    /// Reply to [`MasterMsg::GetEntries`]; `obj` carries a corrected object
    /// name when the worker had to follow a redirect.
    Entries { entries: i64, obj: Option<String> },
    PacketDone(PacketReport),
    /// Log stream chunk, passed through to the client untouched.
    LogFile { bytes: Vec<u8> },
    LogDone,
    /// Terminal worker failure.
    Fatal,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("send to worker {worker} failed: {reason}")]
    Send { worker: WorkerId, reason: String },
    #[error("receive from worker {worker} failed: {reason}")]
    Recv { worker: WorkerId, reason: String },
    #[error("receive with no worker awaited")]
    NoneAwaited,
}

/// Typed message channel to the worker pool.
///
/// The packetizer never touches sockets; the session that owns it injects an
/// implementation at construction. `recv_any` blocks until one of the listed
/// workers has a message (the validator's select loop); a failed receive
/// names the worker it lost.
pub trait Cluster: Send + Sync {
    fn send(&self, to: &WorkerId, msg: MasterMsg) -> Result<(), ClusterError>;
    fn recv_any(&self, from: &[WorkerId]) -> Result<(WorkerId, WorkerMsg), ClusterError>;
    /// Declare a worker unusable for the rest of the session.
    fn mark_bad(&self, worker: &WorkerId);
    /// Pass a log message through to the owning worker's log stream.
    fn forward_log(&self, from: &WorkerId, msg: &WorkerMsg);
    /// Out-of-band text for the client (skipped files and the like).
    fn message_client(&self, text: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_report_json_roundtrip() {
        let rep = PacketReport {
            latency: 0.004,
            proc_time: 1.5,
            proc_cpu: 1.2,
            bytes_read: Some(4096),
            total_entries: None,
            events_seen: Some(777),
        };
        let json = serde_json::to_string(&rep).unwrap();
        let back: PacketReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rep);
    }

    #[test]
    fn worker_msg_json_roundtrip() {
        let msg = WorkerMsg::Entries {
            entries: 12_345,
            obj: Some("events_v2".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: WorkerMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
