use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `HARROW_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for harrow:
/// - Always include `worker` on any dispatch/validation event.
/// - Include `node` (the file host) on any assignment-related event.
/// - Scheduling decisions log under `target: "harrow_sched"` so they can be
///   filtered without drowning out the rest of the process.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("HARROW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
