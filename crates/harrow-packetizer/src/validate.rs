//! Pre-flight validation: every file must open somewhere, and the master
//! needs true entry counts before it can window, order, or size anything.

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};

use harrow_core::DatasetKind;

use crate::cluster::{ClusterError, MasterMsg, WorkerId, WorkerMsg};
use crate::Packetizer;

impl Packetizer {
    /// Runs the validation exchange against the whole worker pool.
    ///
    /// Workers are kept busy one file at a time, own-host files first. Any
    /// transport failure, `Fatal`, or off-protocol reply invalidates the
    /// packetizer as a whole; files that merely fail to open are dropped
    /// with a client notification and the query goes on without them.
    pub(crate) fn validate_files(&mut self) {
        let mut ready: VecDeque<WorkerId> = self.workers.keys().cloned().collect();
        let mut inflight: Vec<WorkerId> = Vec::new();
        let total_files: usize = self.nodes.iter().map(|n| n.files.len()).sum();
        let mut validated = 0usize;

        loop {
            while let Some(w) = ready.pop_front() {
                let Some(fref) = self.pick_validation_file(&w) else {
                    // Nothing left to hand this worker; it sits out the rest
                    // of the exchange.
                    continue;
                };
                // Validation visits each file exactly once.
                self.remove_active_file(fref);

                let host = self.workers[&w].info.host.clone();
                self.nodes[fref.node].inc_ext(&host);
                if let Some(ws) = self.workers.get_mut(&w) {
                    ws.cur_file = Some(fref);
                }

                let elem = &self.elements[self.nodes[fref.node].files[fref.file].elem];
                let msg = MasterMsg::GetEntries {
                    records: self.kind == DatasetKind::Records,
                    url: elem.url.clone(),
                    dir: elem.dir.clone(),
                    obj: elem.obj.clone(),
                };
                debug!(
                    target: "harrow_sched",
                    worker = %w,
                    url = %elem.url,
                    obj = %elem.obj,
                    "validation request"
                );
                if let Err(err) = self.cluster.send(&w, msg) {
                    error!(target: "harrow_sched", worker = %w, %err, "validation send failed");
                    self.cluster.mark_bad(&w);
                    self.valid = false;
                    continue;
                }
                inflight.push(w);
            }

            if inflight.is_empty() {
                break;
            }

            match self.cluster.recv_any(&inflight) {
                Err(ClusterError::Recv { worker, reason }) => {
                    error!(
                        target: "harrow_sched",
                        worker = %worker,
                        reason,
                        "lost worker during validation"
                    );
                    self.cluster.mark_bad(&worker);
                    self.valid = false;
                    inflight.retain(|w| w != &worker);
                }
                Err(err) => {
                    error!(target: "harrow_sched", %err, "validation receive failed");
                    self.valid = false;
                    break;
                }
                Ok((w, msg)) => match msg {
                    WorkerMsg::LogFile { .. } | WorkerMsg::LogDone => {
                        // Pass-through; the worker still owes its reply.
                        self.cluster.forward_log(&w, &msg);
                    }
                    WorkerMsg::Fatal => {
                        error!(target: "harrow_sched", worker = %w, "worker fatal during validation");
                        self.cluster.mark_bad(&w);
                        self.valid = false;
                        inflight.retain(|x| x != &w);
                    }
                    WorkerMsg::Entries { entries, obj } => {
                        inflight.retain(|x| x != &w);
                        if self.apply_entries_reply(&w, entries, obj) {
                            validated += 1;
                            info!(
                                target: "harrow_sched",
                                worker = %w,
                                validated,
                                total = total_files,
                                "validated file"
                            );
                        }
                        ready.push_back(w);
                    }
                    other => {
                        error!(
                            target: "harrow_sched",
                            worker = %w,
                            kind = ?other,
                            "unexpected message during validation"
                        );
                        self.cluster.mark_bad(&w);
                        self.valid = false;
                        inflight.retain(|x| x != &w);
                    }
                },
            }
        }

        if !self.valid {
            return;
        }

        // Cumulative offset of each surviving element in the dataset's
        // logical record stream: prefix sum of the true entry counts.
        let mut offset: i64 = 0;
        for (i, e) in self.elements.iter_mut().enumerate() {
            if self.dropped[i] {
                continue;
            }
            let entries = e.entries.max(0);
            e.offset = offset;
            offset += entries;
        }
    }

    /// Chooses the next file for a ready validation worker: its own host's
    /// next unallocated file if possible, else anyone's.
    fn pick_validation_file(&mut self, w: &WorkerId) -> Option<crate::node::FileRef> {
        if let Some(own) = self.workers.get(w).and_then(|ws| ws.node) {
            if let Some(fref) = self.next_unalloc_on(own) {
                return Some(fref);
            }
            if let Some(ws) = self.workers.get_mut(w) {
                ws.node = None;
            }
        }
        self.next_unalloc_any()
    }

    /// Folds one `Entries` reply into the element. Returns whether the
    /// element survived.
    fn apply_entries_reply(&mut self, w: &WorkerId, entries: i64, obj: Option<String>) -> bool {
        let Some(fref) = self.workers.get_mut(w).and_then(|ws| ws.cur_file.take()) else {
            warn!(target: "harrow_sched", worker = %w, "entries reply without an assignment");
            return false;
        };
        let host = self.workers[w].info.host.clone();
        self.nodes[fref.node].dec_ext(&host);

        let elem_idx = self.nodes[fref.node].files[fref.file].elem;
        let e = &mut self.elements[elem_idx];
        if let Some(obj) = obj {
            // The worker followed a redirect and learned the real name.
            e.obj = obj;
        }
        e.entries = entries;

        if entries <= 0 {
            let text = format!("cannot get entries for file: {} - skipping", e.url);
            warn!(target: "harrow_sched", url = %e.url, entries, "dropping file");
            self.cluster.message_client(&text);
            self.dropped[elem_idx] = true;
            self.metrics.elements_dropped_total.inc();
            return false;
        }

        if e.selection.is_none() {
            if e.first > entries {
                let text = format!(
                    "first ({}) beyond the number of entries ({}) in {} - skipping",
                    e.first, entries, e.url
                );
                warn!(target: "harrow_sched", url = %e.url, first = e.first, entries, "dropping file");
                self.cluster.message_client(&text);
                self.dropped[elem_idx] = true;
                self.metrics.elements_dropped_total.inc();
                return false;
            }
            if e.num == -1 {
                e.num = entries - e.first;
            } else if e.first + e.num > entries {
                warn!(
                    target: "harrow_sched",
                    url = %e.url,
                    first = e.first,
                    num = e.num,
                    entries,
                    "range past end of file, clamping"
                );
                e.num = entries - e.first;
            }
        }
        true
    }
}
