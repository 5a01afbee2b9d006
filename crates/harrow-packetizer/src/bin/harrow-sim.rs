#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Runs a full validate-then-schedule query against the in-process
//! simulation cluster and prints what the scheduler did with it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use harrow_core::{Dataset, DatasetKind, Element};
use harrow_packetizer::cluster::{WorkerId, WorkerInfo};
use harrow_packetizer::params::ParamBag;
use harrow_packetizer::sim::{drive, SimCluster};
use harrow_packetizer::Packetizer;

#[derive(Debug, Parser)]
#[command(name = "harrow-sim")]
struct Args {
    /// Number of file-holding hosts.
    #[arg(long, env = "HARROW_SIM_HOSTS", default_value_t = 4)]
    hosts: u32,

    /// Of those, hosts that get no local worker (their files are remote-only).
    #[arg(long, env = "HARROW_SIM_REMOTE_HOSTS", default_value_t = 1)]
    remote_hosts: u32,

    #[arg(long, env = "HARROW_SIM_FILES_PER_HOST", default_value_t = 3)]
    files_per_host: u32,

    #[arg(long, env = "HARROW_SIM_RECORDS_PER_FILE", default_value_t = 10_000)]
    records_per_file: i64,

    /// Workers per worker-carrying host.
    #[arg(long, env = "HARROW_SIM_WORKERS_PER_HOST", default_value_t = 2)]
    workers_per_host: u32,

    /// Base simulated processing rate, records per second.
    #[arg(long, env = "HARROW_SIM_RATE", default_value_t = 1000.0)]
    rate: f64,

    /// Every n-th worker runs at a quarter of the base rate.
    #[arg(long, env = "HARROW_SIM_SLOW_EVERY", default_value_t = 0)]
    slow_every: u32,

    /// Global record window start.
    #[arg(long, env = "HARROW_SIM_FIRST", default_value_t = 0)]
    first: i64,

    /// Global record window size, -1 for everything.
    #[arg(long, env = "HARROW_SIM_NUM", default_value_t = -1)]
    num: i64,

    #[arg(long, env = "HARROW_SIM_MAX_WORKERS_PER_NODE")]
    max_workers_per_node: Option<i64>,

    /// Use the storage-faster-than-network ordering instead of the default.
    #[arg(long, env = "HARROW_SIM_STORAGE_FASTER", default_value_t = false)]
    storage_faster: bool,
}

fn host_name(i: u32) -> String {
    format!("h{i}.sim")
}

fn main() -> Result<()> {
    harrow_observe::logging::init_tracing();
    let args = Args::parse();

    anyhow::ensure!(args.hosts >= 1, "need at least one host");
    anyhow::ensure!(
        args.remote_hosts < args.hosts,
        "remote_hosts must leave at least one host with workers"
    );
    anyhow::ensure!(args.rate > 0.0, "rate must be positive");

    // Dataset: files_per_host files on every host, in host order.
    let mut dataset = Dataset::new(DatasetKind::Records);
    let mut cluster = SimCluster::new();
    for h in 0..args.hosts {
        for f in 0..args.files_per_host {
            let url = format!("hrw://{}/data/f{f}.dat", host_name(h));
            dataset.push(Element::new(&url, "/data", format!("f{f}"), 0, -1, ""));
            cluster = cluster.with_file(&url, args.records_per_file);
        }
    }
    dataset.validate()?;

    // Workers live on the first (hosts - remote_hosts) hosts.
    let mut workers = Vec::new();
    let mut idx = 0u32;
    for h in 0..(args.hosts - args.remote_hosts) {
        for w in 0..args.workers_per_host {
            let id = WorkerId(format!("w{h}-{w}"));
            let slow = args.slow_every != 0 && idx % args.slow_every == args.slow_every - 1;
            let rate = if slow { args.rate / 4.0 } else { args.rate };
            cluster = cluster.with_worker_rate(&id, rate);
            workers.push(WorkerInfo {
                id,
                host: host_name(h),
                perf_index: if slow { 25 } else { 100 },
            });
            idx += 1;
        }
    }

    let mut bag = ParamBag::new();
    if let Some(cap) = args.max_workers_per_node {
        bag.set("MaxWorkersPerNode", cap.to_string());
    }
    if args.storage_faster {
        bag.set("NetworkFasterThanHD", "0");
    }

    let cluster = Arc::new(cluster);
    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        args.first,
        args.num,
        &bag,
        cluster.clone(),
        None,
    );
    anyhow::ensure!(pkt.is_valid(), "packetizer came out of construction invalid");

    println!(
        "[harrow-sim] {} hosts ({} remote-only), {} workers, {} entries to process",
        args.hosts,
        args.remote_hosts,
        workers.len(),
        pkt.total_entries()
    );

    let dispatches = drive(&mut pkt, &cluster, &workers);

    let mut per_worker: BTreeMap<String, (usize, i64)> = BTreeMap::new();
    let mut local_packets = 0usize;
    let by_host: BTreeMap<&str, &str> = workers
        .iter()
        .map(|w| (w.id.0.as_str(), w.host.as_str()))
        .collect();
    for d in &dispatches {
        let entry = per_worker.entry(d.worker.0.clone()).or_default();
        entry.0 += 1;
        entry.1 += d.packet.num;
        if let Some(host) = by_host.get(d.worker.0.as_str()) {
            if d.packet.url.contains(host) {
                local_packets += 1;
            }
        }
    }

    println!("[harrow-sim] {} packets dispatched", dispatches.len());
    for (worker, (packets, entries)) in &per_worker {
        println!("[harrow-sim]   {worker}: {packets} packets, {entries} records");
    }
    if !dispatches.is_empty() {
        println!(
            "[harrow-sim] locality: {:.1}% of packets were data-local",
            100.0 * local_packets as f64 / dispatches.len() as f64
        );
    }
    let (processed, total) = pkt.progress();
    pkt.log_metrics();
    anyhow::ensure!(
        processed == total,
        "simulation finished early: {processed}/{total}"
    );
    println!("[harrow-sim] done: {processed}/{total} records processed");
    Ok(())
}
