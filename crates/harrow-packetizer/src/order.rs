//! Host ordering: which file node most deserves the next free worker.
//!
//! "Smaller" means "serve me first". Two policies exist, chosen once at
//! construction from the `NetworkFasterThanHD` parameter; the scheduler only
//! ever talks to the trait.

use std::cmp::Ordering;

use crate::node::FileNode;

pub(crate) trait NodePolicy: Send + Sync {
    fn cmp(&self, a: &FileNode, b: &FileNode) -> Ordering;
}

/// Network pipes outrun the disks (the common cluster): starve hosts that
/// already have many readers, feed hosts with few. Ties go to the host with
/// more records left.
pub(crate) struct NetworkFaster;

impl NodePolicy for NetworkFaster {
    fn cmp(&self, a: &FileNode, b: &FileNode) -> Ordering {
        a.run_workers
            .cmp(&b.run_workers)
            .then_with(|| b.events_left().cmp(&a.events_left()))
    }
}

/// Local disks outrun the network: keep external readers rare, and only
/// flip a tier's verdict when the gap in remaining-records-per-worker is
/// large enough to matter.
///
/// Tier order: workers assigned here but reading elsewhere, then external
/// readers, then local assignees, then remaining records. A flip is only
/// allowed when the node it would favor still has external capacity.
pub(crate) struct StorageFaster {
    pub max_ext_workers: i64,
}

impl NodePolicy for StorageFaster {
    fn cmp(&self, a: &FileNode, b: &FileNode) -> Ordering {
        let cap = self.max_ext_workers;
        let diff = a.events_left_per_worker() - b.events_left_per_worker();
        let avg = (a.events_left_per_worker() + b.events_left_per_worker()) / 2;

        // Assigned-but-reading-remote counts: these workers will come home
        // eventually, so their node needs external help the least.
        let a_away = a.worker_cnt() - a.run_workers;
        let b_away = b.worker_cnt() - b.run_workers;

        if a_away != b_away {
            return if a_away < b_away {
                flip_if(diff < -(avg / 2) && b.ext_workers < cap)
            } else {
                unflip_if(diff > avg / 2 && a.ext_workers < cap)
            };
        }
        if a.ext_workers != b.ext_workers {
            return if a.ext_workers < b.ext_workers {
                flip_if(diff < -(avg / 3) && b.ext_workers < cap)
            } else {
                unflip_if(diff > avg / 3 && a.ext_workers < cap)
            };
        }
        if a.local_workers != b.local_workers {
            return if a.local_workers < b.local_workers {
                flip_if(diff < -(avg / 3) && b.ext_workers < cap)
            } else {
                unflip_if(diff > avg / 3 && a.ext_workers < cap)
            };
        }
        // All counters equal: more remaining per worker goes first.
        diff.cmp(&0).reverse()
    }
}

/// `a` wins the tier; `flip` hands the win to `b` instead.
fn flip_if(flip: bool) -> Ordering {
    if flip {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// `b` wins the tier; `flip` hands the win to `a` instead.
fn unflip_if(flip: bool) -> Ordering {
    if flip {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}
