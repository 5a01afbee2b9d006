//! Per-packet dispatch: account the previous packet, pick a file with the
//! locality decision, size the next packet from observed rates, carve it.

use tracing::{debug, info, warn};

use harrow_core::Element;

use crate::cluster::{PacketReport, WorkerId};
use crate::node::FileRef;
use crate::perf::{FileEvent, PacketEvent};
use crate::Packetizer;

/// Target packet duration is this fraction of the estimated remaining wall
/// time (at the cluster's mean rate), floored at 2 seconds.
const PACKET_TIME_FRACTION: f64 = 4.0;

impl Packetizer {
    /// Hands the worker its next packet, folding in the report for the one
    /// it just finished (pass `None` for a worker's very first request).
    ///
    /// `None` means "no more work": the query is done, the caller stopped
    /// it, or the packetizer is invalid. Packets for one worker are strictly
    /// ordered; record ranges carved out of one file never overlap.
    pub fn next_packet(
        &mut self,
        worker: &WorkerId,
        report: Option<&PacketReport>,
    ) -> Option<Element> {
        if !self.valid {
            return None;
        }
        if !self.workers.contains_key(worker) {
            warn!(target: "harrow_sched", worker = %worker, "next_packet from unknown worker");
            return None;
        }

        if self.workers[worker].cur_elem.is_some() {
            if report.is_none() {
                warn!(
                    target: "harrow_sched",
                    worker = %worker,
                    "packet in flight but no report attached, assuming zero timings"
                );
            }
            let rep = report.copied().unwrap_or_default();
            self.account_packet(worker, &rep);
        }

        if self.stop {
            self.emit_progress("stopped");
            return None;
        }

        // Retire the worker's file if the last carve exhausted it.
        if let Some(f) = self.workers[worker].cur_file {
            if self.nodes[f.node].files[f.file].done {
                self.close_file(worker, f);
            }
        }

        if self.total_entries == self.processed {
            return None;
        }

        if self.workers[worker].cur_file.is_none() {
            let f = self.choose_file(worker)?;
            self.open_file(worker, f);
        }

        let f = self.workers[worker].cur_file?;
        let size = self.packet_size(worker);
        Some(self.carve(worker, f, size))
    }

    /// Folds a finished packet into the books: totals, rates, ledger,
    /// performance events.
    fn account_packet(&mut self, worker: &WorkerId, rep: &PacketReport) {
        let (cur, mut numev, cur_file, host) = {
            let Some(ws) = self.workers.get_mut(worker) else {
                return;
            };
            let Some(cur) = ws.cur_elem.take() else {
                return;
            };
            let nominal = cur.num;
            (cur, nominal, ws.cur_file, ws.info.host.clone())
        };
        // A worker that keeps its own running count is believed over the
        // packet's nominal size.
        if let Some(seen) = rep.events_seen {
            if seen > 0 {
                numev = seen - self.workers[worker].processed;
            }
        }

        let file_done = cur_file.map_or(true, |f| self.nodes[f.node].files[f.file].done);
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.update_rates(numev, rep.proc_time, file_done);
        }
        if let Some(f) = cur_file {
            self.nodes[f.node].processed += numev;
        }
        self.processed += numev.max(0);
        if let Some(bytes) = rep.bytes_read {
            if bytes > 0 {
                self.bytes_read += bytes;
                self.metrics.bytes_read_total.inc_by(bytes as u64);
            }
        }
        self.cum_proc_time += rep.proc_time;

        self.metrics.packets_done_total.inc();
        self.metrics.inflight_packets.sub(1);
        self.metrics.entries_processed_total.inc_by(numev.max(0) as u64);
        self.metrics.proc_time.record(rep.proc_time);

        debug!(
            target: "harrow_sched",
            worker = %worker,
            url = %cur.url,
            entries = numev,
            latency = rep.latency,
            proc_time = rep.proc_time,
            proc_cpu = rep.proc_cpu,
            bytes_read = rep.bytes_read.unwrap_or(-1),
            "packet done"
        );
        if let Some(reconfirmed) = rep.total_entries {
            debug!(
                target: "harrow_sched",
                worker = %worker,
                url = %cur.url,
                reconfirmed,
                "worker re-confirmed file size"
            );
        }
        if let Some(sink) = &self.perf {
            sink.packet_event(&PacketEvent {
                worker,
                worker_host: &host,
                file_url: &cur.url,
                entries: numev,
                latency: rep.latency,
                proc_time: rep.proc_time,
                proc_cpu: rep.proc_cpu,
                bytes_read: rep.bytes_read.unwrap_or(0),
            });
        }
        self.packets.push(cur);

        if self.processed == self.total_entries {
            self.emit_progress("complete");
        }
    }

    fn close_file(&mut self, worker: &WorkerId, f: FileRef) {
        let host = self.workers[worker].info.host.clone();
        self.nodes[f.node].dec_ext(&host);
        self.nodes[f.node].dec_run();
        self.metrics.files_finished_total.inc();
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.cur_file = None;
        }
        if let Some(sink) = &self.perf {
            let elem = &self.elements[self.nodes[f.node].files[f.file].elem];
            sink.file_event(&FileEvent {
                worker,
                worker_host: &host,
                node: &self.nodes[f.node].name,
                file_url: &elem.url,
                opened: false,
            });
        }
    }

    /// The locality decision. Tries to predict whether the worker will chew
    /// through its own host's files before the query ends; if so it stays
    /// local, otherwise it is lent to the neediest other host.
    fn choose_file(&mut self, worker: &WorkerId) -> Option<FileRef> {
        let avg_events_left = (self.total_entries - self.processed) / self.workers.len() as i64;
        // Drifts from the configured base toward 0 as the remote-only
        // backlog shrinks; ~1 when local and remote backlogs balance out.
        let local_pref = self.params.base_local_preference
            - self.events_on_remote as f64 / (0.4 * (self.total_entries - self.processed) as f64);

        let mut file: Option<FileRef> = None;
        if let Some(own) = self.workers[worker].node {
            self.sort_unalloc();
            let candidate = self
                .unalloc
                .first()
                .copied()
                .filter(|&q| self.nodes[q].ext_workers < self.params.max_workers_per_node);
            let open_local = match candidate {
                None => true,
                Some(q) => self.prefer_local(worker, own, q, local_pref, avg_events_left),
            };
            if open_local {
                file = self.take_local(worker, own);
            }
        }

        if file.is_none() {
            file = self.next_unalloc_any();
        }
        if file.is_none() {
            file = self.next_active_any();
        }
        file
    }

    /// Should this worker open one of its own files instead of helping the
    /// best remote candidate `q`?
    fn prefer_local(
        &self,
        worker: &WorkerId,
        own: usize,
        q: usize,
        local_pref: f64,
        avg_events_left: i64,
    ) -> bool {
        let own_node = &self.nodes[own];
        let q_node = &self.nodes[q];
        let local_left = own_node.events_left_per_worker();

        // External helpers already read here; don't also go remote
        // ourselves. The -1 accounts for this worker not running yet.
        if own_node.run_workers > own_node.local_workers - 1 {
            return true;
        }

        let rate = self.workers[worker].avg_rate();
        if rate == 0.0 {
            // First packet: no rate yet, judge by backlog sizes alone.
            local_left as f64 * local_pref > avg_events_left as f64
                || (q_node.events_left_per_worker() as f64) < local_left as f64 * local_pref
                || q_node.ext_workers > 1
                || q_node.run_workers == 0
        } else {
            let local_time = local_left as f64 / rate;
            let global_rate = self.processed as f64 / self.cum_proc_time;
            let avg_time = avg_events_left as f64 / global_rate;
            local_time * local_pref > avg_time
                || (q_node.events_left_per_worker() as f64) < local_left as f64 * local_pref
        }
    }

    /// Next file from the worker's own node; unlinks the worker from the
    /// node once it has nothing left.
    fn take_local(&mut self, worker: &WorkerId, own: usize) -> Option<FileRef> {
        let found = self
            .next_unalloc_on(own)
            .or_else(|| self.nodes[own].next_active().map(|file| FileRef { node: own, file }));
        if found.is_none() {
            if let Some(ws) = self.workers.get_mut(worker) {
                ws.node = None;
            }
        }
        found
    }

    fn open_file(&mut self, worker: &WorkerId, f: FileRef) {
        let host = self.workers[worker].info.host.clone();
        if let Some(ws) = self.workers.get_mut(worker) {
            ws.cur_file = Some(f);
        }

        let elem_idx = self.nodes[f.node].files[f.file].elem;
        let untouched =
            self.nodes[f.node].files[f.file].next_entry == self.elements[elem_idx].first;
        if self.nodes[f.node].local_workers == 0 && untouched {
            // First reader on a host without local workers: this file's
            // records leave the remote-only backlog.
            self.events_on_remote -= self.elements[elem_idx].entry_contribution();
            if self.events_on_remote < 0 {
                warn!(
                    target: "harrow_sched",
                    node = %self.nodes[f.node].name,
                    "remote-backlog counter underflow, clamping"
                );
                self.events_on_remote = 0;
            }
        }
        self.nodes[f.node].inc_ext(&host);
        self.nodes[f.node].inc_run();

        debug!(
            target: "harrow_sched",
            worker = %worker,
            node = %self.nodes[f.node].name,
            url = %self.elements[elem_idx].url,
            "file opened"
        );
        if let Some(sink) = &self.perf {
            sink.file_event(&FileEvent {
                worker,
                worker_host: &host,
                node: &self.nodes[f.node].name,
                file_url: &self.elements[elem_idx].url,
                opened: true,
            });
        }
    }

    /// Sizes the next packet so it takes roughly a fixed slice of the
    /// estimated remaining wall time at this worker's observed rate. First
    /// packets fall back to an even share scaled by the static performance
    /// index.
    fn packet_size(&self, worker: &WorkerId) -> i64 {
        let ws = &self.workers[worker];
        let mut rate = ws.cur_rate();
        if rate == 0.0 {
            rate = ws.avg_rate();
        }
        let num = if rate > 0.0 {
            let avg_rate = self.processed as f64 / (self.cum_proc_time / self.workers.len() as f64);
            let mut packet_time = if avg_rate > 0.0 {
                ((self.total_entries - self.processed) as f64 / avg_rate) / PACKET_TIME_FRACTION
            } else {
                0.0
            };
            if packet_time < 2.0 {
                packet_time = 2.0;
            }
            (rate * packet_time) as i64
        } else {
            let share = (self.total_entries - self.processed)
                / (8 * PACKET_TIME_FRACTION as i64 * self.workers.len() as i64);
            (share as f64 * (ws.info.perf_index as f64 / self.max_perf_index as f64)) as i64
        };
        num.max(1)
    }

    /// Carves `[next_entry, next_entry + size)` out of the worker's current
    /// file, clamped to the file's end (a short remainder is folded into
    /// this last packet rather than left behind).
    fn carve(&mut self, worker: &WorkerId, f: FileRef, size: i64) -> Element {
        let elem_idx = self.nodes[f.node].files[f.file].elem;
        let first = self.nodes[f.node].files[f.file].next_entry;

        let mut packet = self.elements[elem_idx].clone();
        let last = packet.first + packet.num;
        let num = if first + size >= last {
            self.nodes[f.node].files[f.file].done = true;
            self.remove_active_file(f);
            last - first
        } else {
            self.nodes[f.node].files[f.file].next_entry = first + size;
            size
        };

        packet.first = first;
        packet.num = num;
        packet.selection = packet.selection.take().map(|s| s.restrict(first, num));

        debug!(
            target: "harrow_sched",
            worker = %worker,
            url = %packet.url,
            first,
            num,
            "packet dispatched"
        );
        self.metrics.packets_dispatched_total.inc();
        self.metrics.inflight_packets.add(1);

        if let Some(ws) = self.workers.get_mut(worker) {
            ws.cur_elem = Some(packet.clone());
        }
        packet
    }

    fn emit_progress(&self, reason: &str) {
        info!(
            target: "harrow_sched",
            processed = self.processed,
            total = self.total_entries,
            reason,
            "progress"
        );
    }
}
