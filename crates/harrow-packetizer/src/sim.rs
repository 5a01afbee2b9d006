//! Deterministic in-process cluster: scripted workers answering the master
//! synchronously, with failure knobs for exercising the unhappy paths.
//!
//! This is not a mock bolted onto the tests; the `harrow-sim` binary drives
//! the same harness to demonstrate a full validate-then-schedule run without
//! a single real socket.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use tracing::info;

use harrow_core::Element;

use crate::cluster::{Cluster, ClusterError, MasterMsg, PacketReport, WorkerId, WorkerInfo, WorkerMsg};
use crate::Packetizer;

#[derive(Debug, Default)]
struct SimState {
    /// True entry count per file URL; unknown URLs report 0 entries.
    entries_by_url: BTreeMap<String, i64>,
    /// Corrected object names, as if the worker followed a redirect.
    obj_by_url: BTreeMap<String, String>,
    /// Simulated records per wall-clock second, per worker.
    rate_by_worker: BTreeMap<WorkerId, f64>,
    inboxes: BTreeMap<WorkerId, VecDeque<WorkerMsg>>,
    /// Workers that answer the validation request with `Fatal`.
    fatal_on_validation: BTreeSet<WorkerId>,
    /// Workers whose next receive fails at the transport level.
    drop_next_recv: BTreeSet<WorkerId>,
    /// Workers that push a log chunk before their validation reply.
    log_before_reply: BTreeSet<WorkerId>,
    bad: BTreeSet<WorkerId>,
    client_messages: Vec<String>,
    forwarded_logs: usize,
}

/// Scripted, threadless [`Cluster`]. Every `send` computes the worker's
/// reply immediately and queues it; `recv_any` drains the queues in the
/// caller's order.
#[derive(Debug, Default)]
pub struct SimCluster {
    state: Mutex<SimState>,
}

const DEFAULT_RATE: f64 = 100.0;
const SIM_LATENCY: f64 = 0.001;
const SIM_BYTES_PER_ENTRY: i64 = 64;

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, url: impl Into<String>, entries: i64) -> Self {
        self.lock().entries_by_url.insert(url.into(), entries);
        self
    }

    pub fn with_object_alias(self, url: impl Into<String>, obj: impl Into<String>) -> Self {
        self.lock().obj_by_url.insert(url.into(), obj.into());
        self
    }

    pub fn with_worker_rate(self, worker: &WorkerId, rate: f64) -> Self {
        self.lock().rate_by_worker.insert(worker.clone(), rate);
        self
    }

    pub fn with_fatal_on_validation(self, worker: &WorkerId) -> Self {
        self.lock().fatal_on_validation.insert(worker.clone());
        self
    }

    pub fn with_dropped_recv(self, worker: &WorkerId) -> Self {
        self.lock().drop_next_recv.insert(worker.clone());
        self
    }

    pub fn with_log_before_reply(self, worker: &WorkerId) -> Self {
        self.lock().log_before_reply.insert(worker.clone());
        self
    }

    pub fn client_messages(&self) -> Vec<String> {
        self.lock().client_messages.clone()
    }

    pub fn forwarded_logs(&self) -> usize {
        self.lock().forwarded_logs
    }

    pub fn is_bad(&self, worker: &WorkerId) -> bool {
        self.lock().bad.contains(worker)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Cluster for SimCluster {
    fn send(&self, to: &WorkerId, msg: MasterMsg) -> Result<(), ClusterError> {
        let mut st = self.lock();
        if st.bad.contains(to) {
            return Err(ClusterError::Send {
                worker: to.clone(),
                reason: "worker is bad".into(),
            });
        }
        let reply = match msg {
            MasterMsg::GetEntries { url, .. } => {
                if st.fatal_on_validation.contains(to) {
                    WorkerMsg::Fatal
                } else {
                    if st.log_before_reply.remove(to) {
                        let chunk = WorkerMsg::LogFile {
                            bytes: b"opening file".to_vec(),
                        };
                        st.inboxes.entry(to.clone()).or_default().push_back(chunk);
                        st.inboxes
                            .entry(to.clone())
                            .or_default()
                            .push_back(WorkerMsg::LogDone);
                    }
                    let entries = st.entries_by_url.get(&url).copied().unwrap_or(0);
                    let obj = st.obj_by_url.get(&url).cloned();
                    WorkerMsg::Entries { entries, obj }
                }
            }
            MasterMsg::Packet(elem) => {
                let rate = st
                    .rate_by_worker
                    .get(to)
                    .copied()
                    .unwrap_or(DEFAULT_RATE);
                let proc_time = elem.num as f64 / rate;
                WorkerMsg::PacketDone(PacketReport {
                    latency: SIM_LATENCY,
                    proc_time,
                    proc_cpu: proc_time * 0.9,
                    bytes_read: Some(elem.num * SIM_BYTES_PER_ENTRY),
                    total_entries: None,
                    events_seen: None,
                })
            }
        };
        st.inboxes.entry(to.clone()).or_default().push_back(reply);
        Ok(())
    }

    fn recv_any(&self, from: &[WorkerId]) -> Result<(WorkerId, WorkerMsg), ClusterError> {
        if from.is_empty() {
            return Err(ClusterError::NoneAwaited);
        }
        let mut st = self.lock();
        for w in from {
            if st.drop_next_recv.remove(w) {
                return Err(ClusterError::Recv {
                    worker: w.clone(),
                    reason: "connection reset (scripted)".into(),
                });
            }
            if let Some(msg) = st.inboxes.get_mut(w).and_then(VecDeque::pop_front) {
                return Ok((w.clone(), msg));
            }
        }
        // A real transport would block here; in the simulation an empty
        // select means the driver lost track of a reply.
        Err(ClusterError::Recv {
            worker: from[0].clone(),
            reason: "no pending message for any awaited worker".into(),
        })
    }

    fn mark_bad(&self, worker: &WorkerId) {
        self.lock().bad.insert(worker.clone());
    }

    fn forward_log(&self, _from: &WorkerId, _msg: &WorkerMsg) {
        self.lock().forwarded_logs += 1;
    }

    fn message_client(&self, text: &str) {
        self.lock().client_messages.push(text.to_string());
    }
}

/// One dispatched packet, as seen by the driver.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub worker: WorkerId,
    pub packet: Element,
}

/// Drives a packetizer to completion against a [`SimCluster`]: round-robin
/// over the workers, each one requesting, "processing", and reporting until
/// everyone is told there is no more work.
pub fn drive(
    pkt: &mut Packetizer,
    cluster: &SimCluster,
    workers: &[WorkerInfo],
) -> Vec<Dispatch> {
    let mut dispatches = Vec::new();
    let mut pending: BTreeMap<WorkerId, Option<PacketReport>> =
        workers.iter().map(|w| (w.id.clone(), None)).collect();
    let mut live: VecDeque<WorkerId> = workers.iter().map(|w| w.id.clone()).collect();

    // Generous backstop so a scheduling bug fails tests instead of hanging.
    let mut budget = 1_000_000usize;
    while let Some(w) = live.pop_front() {
        budget -= 1;
        if budget == 0 {
            tracing::warn!(target: "harrow_sched", "simulation budget exhausted, aborting drive");
            break;
        }
        let report = pending.get(&w).cloned().flatten();
        match pkt.next_packet(&w, report.as_ref()) {
            None => {
                // No more work for this worker; it leaves the rotation.
                pending.insert(w, None);
            }
            Some(packet) => {
                if cluster.send(&w, MasterMsg::Packet(packet.clone())).is_err() {
                    pending.insert(w.clone(), None);
                    live.push_back(w);
                    continue;
                }
                let next_report = match cluster.recv_any(std::slice::from_ref(&w)) {
                    Ok((_, WorkerMsg::PacketDone(rep))) => Some(rep),
                    _ => None,
                };
                dispatches.push(Dispatch {
                    worker: w.clone(),
                    packet,
                });
                pending.insert(w.clone(), next_report);
                live.push_back(w);
            }
        }
    }

    info!(
        target: "harrow_sched",
        packets = dispatches.len(),
        processed = pkt.processed(),
        total = pkt.total_entries(),
        "simulation drive finished"
    );
    dispatches
}
