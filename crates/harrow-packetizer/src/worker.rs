use harrow_core::Element;

use crate::cluster::WorkerInfo;
use crate::node::FileRef;

/// Master-side record of one worker: where it is assigned, what it is
/// chewing on, and how fast it has been going.
///
/// Two rate windows are kept: cumulative over the whole query, and scoped to
/// the current file (reset when that file finishes). The current-file rate
/// reacts faster to a file that happens to be slow to read.
#[derive(Debug)]
pub(crate) struct WorkerStat {
    pub info: WorkerInfo,
    /// Index of the node matching this worker's own host, if any.
    pub node: Option<usize>,
    pub cur_file: Option<FileRef>,
    /// Packet currently in flight, if any.
    pub cur_elem: Option<Element>,
    pub processed: i64,
    pub proc_time: f64,
    cur_processed: i64,
    cur_proc_time: f64,
}

impl WorkerStat {
    pub fn new(info: WorkerInfo) -> Self {
        Self {
            info,
            node: None,
            cur_file: None,
            cur_elem: None,
            processed: 0,
            proc_time: 0.0,
            cur_processed: 0,
            cur_proc_time: 0.0,
        }
    }

    /// Records per wall-clock second over the whole query, 0 when unknown.
    pub fn avg_rate(&self) -> f64 {
        if self.proc_time > 0.0 {
            self.processed as f64 / self.proc_time
        } else {
            0.0
        }
    }

    /// Records per wall-clock second over the current file, 0 when unknown.
    pub fn cur_rate(&self) -> f64 {
        if self.cur_proc_time > 0.0 {
            self.cur_processed as f64 / self.cur_proc_time
        } else {
            0.0
        }
    }

    /// Folds one finished packet into the rates. Wall-clock time, not CPU
    /// time: a worker starved by a slow file host must look slow.
    pub fn update_rates(&mut self, entries: i64, time: f64, cur_file_done: bool) {
        if cur_file_done {
            self.cur_proc_time = 0.0;
            self.cur_processed = 0;
        } else {
            self.cur_proc_time += time;
            self.cur_processed += entries;
        }
        self.proc_time += time;
        self.processed += entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WorkerId;

    fn stat() -> WorkerStat {
        WorkerStat::new(WorkerInfo {
            id: WorkerId("w1".into()),
            host: "h1.example.org".into(),
            perf_index: 100,
        })
    }

    #[test]
    fn rates_start_unknown() {
        let w = stat();
        assert_eq!(w.avg_rate(), 0.0);
        assert_eq!(w.cur_rate(), 0.0);
    }

    #[test]
    fn update_rates_accumulates_both_windows() {
        let mut w = stat();
        w.update_rates(100, 2.0, false);
        w.update_rates(300, 2.0, false);
        assert_eq!(w.processed, 400);
        assert!((w.avg_rate() - 100.0).abs() < 1e-9);
        assert!((w.cur_rate() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn finishing_a_file_resets_the_current_window_only() {
        let mut w = stat();
        w.update_rates(100, 1.0, false);
        w.update_rates(50, 1.0, true);
        assert_eq!(w.cur_rate(), 0.0);
        assert_eq!(w.processed, 150);
        assert!((w.avg_rate() - 75.0).abs() < 1e-9);
    }
}
