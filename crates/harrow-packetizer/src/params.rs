use std::collections::BTreeMap;

use tracing::warn;

/// String parameter bag handed in by the session layer.
///
/// Unknown keys are ignored; unparsable values fall back to the default with
/// a warning. Never fatal.
#[derive(Debug, Clone, Default)]
pub struct ParamBag {
    entries: BTreeMap<String, String>,
}

impl ParamBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

pub(crate) const PARAM_MAX_WORKERS_PER_NODE: &str = "MaxWorkersPerNode";
pub(crate) const PARAM_NETWORK_FASTER_THAN_HD: &str = "NetworkFasterThanHD";
pub(crate) const PARAM_BASE_LOCAL_PREFERENCE: &str = "BaseLocalPreference";

/// Typed view of the packetizer's tunables.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Params {
    /// Cap on external workers reading from one host at a time.
    pub max_workers_per_node: i64,
    /// Selects the node ordering policy (see `order`).
    pub network_faster_than_hd: bool,
    /// Starting bias toward a worker's own files; drifts toward 0 as the
    /// remote-only backlog shrinks.
    pub base_local_preference: f64,
}

impl Params {
    pub fn from_bag(bag: &ParamBag) -> Self {
        let default_workers = default_max_workers_per_node();
        Self {
            max_workers_per_node: parse_or(
                bag,
                PARAM_MAX_WORKERS_PER_NODE,
                default_workers,
            ),
            network_faster_than_hd: parse_bool_or(bag, PARAM_NETWORK_FASTER_THAN_HD, true),
            base_local_preference: parse_or(bag, PARAM_BASE_LOCAL_PREFERENCE, 1.2),
        }
    }
}

/// CPU count of the master host, floored at 2: even a small file server can
/// feed two external readers.
fn default_max_workers_per_node() -> i64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(2)
        .max(2)
}

fn parse_or<T: std::str::FromStr>(bag: &ParamBag, key: &str, default: T) -> T {
    match bag.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = raw, "unparsable parameter, using default");
                default
            }
        },
    }
}

fn parse_bool_or(bag: &ParamBag, key: &str, default: bool) -> bool {
    match bag.get(key) {
        None => default,
        Some(raw) => match raw.trim() {
            "1" | "true" | "on" => true,
            "0" | "false" | "off" => false,
            other => {
                warn!(key, value = other, "unparsable boolean parameter, using default");
                default
            }
        },
    }
}
