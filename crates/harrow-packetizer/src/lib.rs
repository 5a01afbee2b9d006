#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! The adaptive packetizer: the master-side scheduler of a harrow query.
//!
//! Given a validated dataset and the worker pool, it hands out time-sized
//! record ranges ("packets") on demand, preferring data-local work, capping
//! per-host reader counts, and spreading remote reads across the query
//! instead of letting them pile up at the end.

pub mod cluster;
mod node;
mod order;
pub mod params;
pub mod perf;
mod schedule;
pub mod sim;
mod validate;
mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use harrow_core::{apply_window, Dataset, DatasetKind, Element, Selection};
use harrow_observe::metrics::{Counter, Gauge, SecondsAgg};

use crate::cluster::{Cluster, WorkerId, WorkerInfo};
use crate::node::{FileNode, FileRef};
use crate::order::{NetworkFaster, NodePolicy, StorageFaster};
use crate::params::{ParamBag, Params};
use crate::perf::PerfSink;
use crate::worker::WorkerStat;

pub use crate::cluster::PacketReport;

/// Scheduling counters, dumped via [`Packetizer::log_metrics`].
#[derive(Debug, Default)]
pub struct PacketizerMetrics {
    pub packets_dispatched_total: Counter,
    pub packets_done_total: Counter,
    pub entries_processed_total: Counter,
    pub bytes_read_total: Counter,
    pub files_finished_total: Counter,
    pub elements_dropped_total: Counter,
    pub inflight_packets: Gauge,
    pub proc_time: SecondsAgg,
}

/// One query's packet scheduler. Built once per query, discarded with it.
///
/// Construction runs the validation exchange against the live workers and
/// applies the query's global record window; an instance that comes out of
/// construction invalid (empty dataset, transport failure) answers every
/// [`next_packet`](Self::next_packet) with `None`.
pub struct Packetizer {
    cluster: Arc<dyn Cluster>,
    perf: Option<Arc<dyn PerfSink>>,
    params: Params,
    policy: Box<dyn NodePolicy>,
    kind: DatasetKind,
    dataset_selection: Option<Selection>,

    /// Element arena; `FileStat`s and packets refer into it by index.
    elements: Vec<Element>,
    /// Tombstones for elements discarded during validation.
    dropped: Vec<bool>,
    nodes: Vec<FileNode>,
    /// Node indices with never-visited files, policy-sorted on demand.
    unalloc: Vec<usize>,
    /// Node indices with files in progress.
    active: Vec<usize>,
    workers: BTreeMap<WorkerId, WorkerStat>,

    /// Ledger of every packet handed out and completed.
    packets: Vec<Element>,
    total_entries: i64,
    processed: i64,
    bytes_read: i64,
    cum_proc_time: f64,
    max_perf_index: i64,
    /// Records living on hosts without a local worker; shrinks as remote
    /// files get picked up.
    events_on_remote: i64,
    remote_file_fraction: f64,
    valid: bool,
    stop: bool,
    metrics: PacketizerMetrics,
}

impl Packetizer {
    /// Builds the scheduler for one query.
    ///
    /// `first`/`num` is the query's global record window, `num == -1`
    /// meaning "to the end". Check [`is_valid`](Self::is_valid) afterwards;
    /// an invalid instance is inert rather than an error, matching the
    /// session layer's "report, don't retry" contract.
    pub fn new(
        dataset: Dataset,
        workers: Vec<WorkerInfo>,
        first: i64,
        num: i64,
        bag: &ParamBag,
        cluster: Arc<dyn Cluster>,
        perf: Option<Arc<dyn PerfSink>>,
    ) -> Self {
        let params = Params::from_bag(bag);
        let policy: Box<dyn NodePolicy> = if params.network_faster_than_hd {
            Box::new(NetworkFaster)
        } else {
            Box::new(StorageFaster {
                max_ext_workers: params.max_workers_per_node,
            })
        };
        if !params.network_faster_than_hd {
            info!(target: "harrow_sched", "storage-faster-than-network ordering selected");
        }

        let dropped = vec![false; dataset.elements.len()];
        let mut this = Self {
            cluster,
            perf,
            params,
            policy,
            kind: dataset.kind,
            dataset_selection: dataset.selection,
            elements: dataset.elements,
            dropped,
            nodes: Vec::new(),
            unalloc: Vec::new(),
            active: Vec::new(),
            workers: BTreeMap::new(),
            packets: Vec::new(),
            total_entries: 0,
            processed: 0,
            bytes_read: 0,
            cum_proc_time: 0.0,
            max_perf_index: 1,
            events_on_remote: 0,
            remote_file_fraction: 0.0,
            valid: true,
            stop: false,
            metrics: PacketizerMetrics::default(),
        };

        if workers.is_empty() {
            warn!(target: "harrow_sched", "no workers: packetizer invalid");
            this.valid = false;
            return this;
        }
        for info in workers {
            this.max_perf_index = this.max_perf_index.max(info.perf_index);
            this.workers.insert(info.id.clone(), WorkerStat::new(info));
        }

        // First pass: group files by host so validation can be data-local.
        this.build_nodes(true);
        this.reset();
        this.validate_files();
        if !this.valid {
            return this;
        }

        this.apply_window_and_rebuild(first, num);
        this
    }

    /// Drops out-of-window elements, rebuilds the node structure from the
    /// survivors, and takes the opening census the locality decision needs.
    fn apply_window_and_rebuild(&mut self, first: i64, num: i64) {
        let mut survivors = Vec::with_capacity(self.elements.len());
        for (i, e) in self.elements.drain(..).enumerate() {
            if self.dropped[i] {
                continue;
            }
            let mut e = e;
            // A pre-validated element may still carry the "to end" marker.
            if e.num == -1 && e.entries >= 0 {
                e.num = e.entries - e.first;
            }
            // A selected element's logical records are the selection itself;
            // the scheduler walks it by position.
            if let Some(sel) = &e.selection {
                e.first = 0;
                e.num = sel.len();
            }
            survivors.push(e);
        }
        self.elements = apply_window(survivors, first, num);
        self.dropped = vec![false; self.elements.len()];

        self.build_nodes(false);
        self.total_entries = self
            .elements
            .iter()
            .map(Element::entry_contribution)
            .sum();
        if let Some(sel) = &self.dataset_selection {
            self.total_entries = sel.len();
        }
        self.reset();

        let mut total_files = 0usize;
        let mut remote_files = 0usize;
        self.events_on_remote = 0;
        for n in &self.nodes {
            total_files += n.files.len();
            if n.worker_cnt() == 0 {
                remote_files += n.files.len();
                self.events_on_remote += n.events_left();
            }
        }
        if total_files == 0 {
            info!(target: "harrow_sched", "no valid or non-empty file found: packetizer invalid");
            self.valid = false;
            return;
        }
        self.remote_file_fraction = remote_files as f64 / total_files as f64;

        info!(
            target: "harrow_sched",
            total_entries = self.total_entries,
            files = total_files,
            hosts = self.nodes.len(),
            events_on_remote = self.events_on_remote,
            remote_file_fraction = self.remote_file_fraction,
            "packetizer ready"
        );
    }

    /// Groups elements by host. During validation only files with unknown
    /// entry counts take part; afterwards everything does, and node record
    /// totals are filled in.
    fn build_nodes(&mut self, for_validation: bool) {
        self.nodes.clear();
        for (i, e) in self.elements.iter().enumerate() {
            if self.dropped[i] {
                continue;
            }
            if for_validation && e.is_validated() {
                continue;
            }
            let host = e.host();
            let ni = match self.nodes.iter().position(|n| n.name == host) {
                Some(ni) => ni,
                None => {
                    self.nodes.push(FileNode::new(host));
                    self.nodes.len() - 1
                }
            };
            self.nodes[ni].add_file(i, e.first);
            if !for_validation {
                self.nodes[ni].events += e.entry_contribution();
            }
        }
    }

    /// Rewinds all scheduling cursors and re-links workers to their home
    /// nodes. Record totals and worker rates survive.
    pub fn reset(&mut self) {
        self.unalloc = (0..self.nodes.len()).collect();
        self.active.clear();
        for n in &mut self.nodes {
            n.reset();
        }
        let Self { workers, nodes, .. } = self;
        for ws in workers.values_mut() {
            ws.cur_file = None;
            ws.node = nodes.iter().position(|n| n.name == ws.info.host);
            if let Some(ni) = ws.node {
                nodes[ni].local_workers += 1;
            }
        }
    }

    /// Asks the scheduler to wind down: every subsequent `next_packet`
    /// returns `None`. Packets already in flight are not recalled.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Abandons a worker the session has declared bad. Its in-flight packet
    /// is forgotten (those records are simply never counted as processed).
    pub fn mark_worker_bad(&mut self, worker: &WorkerId) {
        let Some(ws) = self.workers.remove(worker) else {
            return;
        };
        if let Some(f) = ws.cur_file {
            self.nodes[f.node].dec_ext(&ws.info.host);
            self.nodes[f.node].dec_run();
        }
        if let Some(ni) = ws.node {
            self.nodes[ni].local_workers -= 1;
        }
        if ws.cur_elem.is_some() {
            self.metrics.inflight_packets.sub(1);
        }
        warn!(
            target: "harrow_sched",
            worker = %worker,
            abandoned_packet = ws.cur_elem.is_some(),
            "worker marked bad"
        );
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn total_entries(&self) -> i64 {
        self.total_entries
    }

    pub fn processed(&self) -> i64 {
        self.processed
    }

    pub fn bytes_read(&self) -> i64 {
        self.bytes_read
    }

    /// Records still sitting on hosts with no local worker.
    pub fn events_on_remote(&self) -> i64 {
        self.events_on_remote
    }

    pub fn remote_file_fraction(&self) -> f64 {
        self.remote_file_fraction
    }

    /// Records a given worker has processed so far, 0 for unknown workers.
    pub fn entries_processed(&self, worker: &WorkerId) -> i64 {
        self.workers.get(worker).map_or(0, |ws| ws.processed)
    }

    /// Every packet completed so far, in completion order.
    pub fn packets_done(&self) -> &[Element] {
        &self.packets
    }

    pub fn progress(&self) -> (i64, i64) {
        (self.processed, self.total_entries)
    }

    pub fn metrics(&self) -> &PacketizerMetrics {
        &self.metrics
    }

    /// Dumps the scheduling counters as one structured log event.
    pub fn log_metrics(&self) {
        let proc = self.metrics.proc_time.snapshot();
        info!(
            target: "harrow_metrics",
            packets_dispatched_total = self.metrics.packets_dispatched_total.get(),
            packets_done_total = self.metrics.packets_done_total.get(),
            entries_processed_total = self.metrics.entries_processed_total.get(),
            bytes_read_total = self.metrics.bytes_read_total.get(),
            files_finished_total = self.metrics.files_finished_total.get(),
            elements_dropped_total = self.metrics.elements_dropped_total.get(),
            inflight_packets = self.metrics.inflight_packets.get(),
            proc_time_total = proc.total,
            proc_time_max = proc.max,
            "packetizer metrics"
        );
    }

    // ---- node selection shared by the validator and the scheduler ----

    fn sort_unalloc(&mut self) {
        let Self {
            unalloc,
            nodes,
            policy,
            ..
        } = self;
        unalloc.sort_by(|&a, &b| policy.cmp(&nodes[a], &nodes[b]));
    }

    fn sort_active(&mut self) {
        let Self {
            active,
            nodes,
            policy,
            ..
        } = self;
        active.sort_by(|&a, &b| policy.cmp(&nodes[a], &nodes[b]));
    }

    /// Best node that still has unallocated files, or `None` when the best
    /// one has hit the external-worker cap.
    fn next_node(&mut self) -> Option<usize> {
        self.sort_unalloc();
        let head = *self.unalloc.first()?;
        if self.nodes[head].ext_workers >= self.params.max_workers_per_node {
            tracing::debug!(
                target: "harrow_sched",
                node = %self.nodes[head].name,
                cap = self.params.max_workers_per_node,
                "workers-per-node limit reached"
            );
            return None;
        }
        Some(head)
    }

    fn next_active_node(&mut self) -> Option<usize> {
        self.sort_active();
        let head = *self.active.first()?;
        if self.nodes[head].ext_workers >= self.params.max_workers_per_node {
            return None;
        }
        Some(head)
    }

    /// Next unallocated file on a specific node. Starting a file makes its
    /// node active; draining the last unallocated file retires the node from
    /// the unallocated list.
    fn next_unalloc_on(&mut self, node: usize) -> Option<FileRef> {
        let file = self.nodes[node].next_unalloc()?;
        if !self.active.contains(&node) {
            self.active.push(node);
        }
        if !self.nodes[node].has_unalloc() {
            self.unalloc.retain(|&n| n != node);
        }
        Some(FileRef { node, file })
    }

    /// Next unallocated file anywhere, in policy order.
    fn next_unalloc_any(&mut self) -> Option<FileRef> {
        loop {
            let node = self.next_node()?;
            if let Some(f) = self.next_unalloc_on(node) {
                return Some(f);
            }
            // Node had nothing left; next_unalloc_on retired it.
            self.unalloc.retain(|&n| n != node);
        }
    }

    /// Next in-progress file anywhere, in policy order.
    fn next_active_any(&mut self) -> Option<FileRef> {
        loop {
            let node = self.next_active_node()?;
            match self.nodes[node].next_active() {
                Some(file) => return Some(FileRef { node, file }),
                None => self.active.retain(|&n| n != node),
            }
        }
    }

    /// Takes a finished file out of play, retiring the node from the active
    /// list when it was the node's last one.
    fn remove_active_file(&mut self, f: FileRef) {
        self.nodes[f.node].remove_active(f.file);
        if self.nodes[f.node].active_len() == 0 {
            self.active.retain(|&n| n != f.node);
        }
    }
}
