use std::collections::BTreeMap;
use std::sync::Arc;

use harrow_core::{Dataset, DatasetKind, Element, Selection};
use harrow_packetizer::cluster::{WorkerId, WorkerInfo};
use harrow_packetizer::params::ParamBag;
use harrow_packetizer::sim::{drive, SimCluster};
use harrow_packetizer::Packetizer;

fn worker(id: &str, host: &str) -> WorkerInfo {
    WorkerInfo {
        id: WorkerId(id.to_string()),
        host: host.to_string(),
        perf_index: 100,
    }
}

fn url(host: &str, file: usize) -> String {
    format!("hrw://{host}/data/f{file}.dat")
}

fn five_file_dataset(host: &str) -> (Dataset, SimCluster) {
    let mut dataset = Dataset::new(DatasetKind::Records);
    let mut cluster = SimCluster::new();
    for f in 0..5 {
        let u = url(host, f);
        dataset.push(Element::new(&u, "/data", format!("f{f}"), 0, -1, ""));
        cluster = cluster.with_file(&u, 1000);
    }
    (dataset, cluster)
}

#[test]
fn window_trims_and_drops_boundary_files() {
    let (dataset, cluster) = five_file_dataset("h1.sim");
    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(cluster.with_worker_rate(&workers[0].id, 128.0));

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        1500,
        2000,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    assert!(pkt.is_valid());
    assert_eq!(pkt.total_entries(), 2000);

    let dispatches = drive(&mut pkt, &cluster, &workers);
    assert_eq!(pkt.processed(), 2000);

    // Per-file record ranges actually dispatched: file 0 and 4 dropped,
    // file 1 trimmed to its back half, file 3 to its front half.
    let mut span: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for d in &dispatches {
        let e = span
            .entry(d.packet.url.clone())
            .or_insert((i64::MAX, i64::MIN));
        e.0 = e.0.min(d.packet.first);
        e.1 = e.1.max(d.packet.first + d.packet.num);
    }
    assert_eq!(span.len(), 3);
    assert_eq!(span[&url("h1.sim", 1)], (500, 1000));
    assert_eq!(span[&url("h1.sim", 2)], (0, 1000));
    assert_eq!(span[&url("h1.sim", 3)], (0, 500));

    // Offsets were prefix-summed over the validated counts before
    // windowing, so the survivors keep their absolute positions.
    let mut offsets: BTreeMap<String, i64> = BTreeMap::new();
    for d in &dispatches {
        offsets.insert(d.packet.url.clone(), d.packet.offset);
    }
    assert_eq!(offsets[&url("h1.sim", 1)], 1000);
    assert_eq!(offsets[&url("h1.sim", 2)], 2000);
    assert_eq!(offsets[&url("h1.sim", 3)], 3000);
}

#[test]
fn full_window_matches_validated_total() {
    let (dataset, cluster) = five_file_dataset("h1.sim");
    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(cluster);

    let pkt = Packetizer::new(
        dataset,
        workers,
        0,
        -1,
        &ParamBag::new(),
        cluster,
        None,
    );
    assert!(pkt.is_valid());
    assert_eq!(pkt.total_entries(), 5000);
}

#[test]
fn empty_file_is_dropped_with_a_client_message() {
    let good = url("h1.sim", 0);
    let empty = url("h1.sim", 1);
    let mut dataset = Dataset::new(DatasetKind::Records);
    dataset.push(Element::new(&good, "/data", "f0", 0, -1, ""));
    dataset.push(Element::new(&empty, "/data", "f1", 0, -1, ""));

    let workers = vec![worker("w1", "h1.sim")];
    // Only the good file is configured; the other reports 0 entries.
    let cluster = Arc::new(SimCluster::new().with_file(&good, 1000));

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        0,
        -1,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    assert!(pkt.is_valid(), "one bad file must not kill the query");
    assert_eq!(pkt.total_entries(), 1000);

    let messages = cluster.client_messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains(&empty));

    let dispatches = drive(&mut pkt, &cluster, &workers);
    assert!(dispatches.iter().all(|d| d.packet.url == good));
    assert_eq!(pkt.processed(), 1000);
}

#[test]
fn first_past_entries_drops_the_file() {
    let good = url("h1.sim", 0);
    let bogus = url("h1.sim", 1);
    let mut dataset = Dataset::new(DatasetKind::Records);
    dataset.push(Element::new(&good, "/data", "f0", 0, -1, ""));
    // Claims to start at record 5000 of a 1000-record file.
    dataset.push(Element::new(&bogus, "/data", "f1", 5000, -1, ""));

    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(
        SimCluster::new()
            .with_file(&good, 1000)
            .with_file(&bogus, 1000),
    );

    let pkt = Packetizer::new(
        dataset,
        workers,
        0,
        -1,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    assert!(pkt.is_valid());
    assert_eq!(pkt.total_entries(), 1000);
    assert_eq!(cluster.client_messages().len(), 1);
}

#[test]
fn range_past_the_end_is_clamped_not_dropped() {
    let u = url("h1.sim", 0);
    let mut dataset = Dataset::new(DatasetKind::Records);
    dataset.push(Element::new(&u, "/data", "f0", 600, 900, ""));

    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(SimCluster::new().with_file(&u, 1000));

    let pkt = Packetizer::new(
        dataset,
        workers,
        0,
        -1,
        &ParamBag::new(),
        cluster,
        None,
    );
    assert!(pkt.is_valid());
    // 600 + 900 > 1000: num clamped to entries - first.
    assert_eq!(pkt.total_entries(), 400);
}

#[test]
fn worker_fatal_invalidates_the_whole_packetizer() {
    let (dataset, cluster) = five_file_dataset("h1.sim");
    let workers = vec![worker("w1", "h1.sim"), worker("w2", "h1.sim")];
    let cluster = Arc::new(cluster.with_fatal_on_validation(&workers[1].id));

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        0,
        -1,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    assert!(!pkt.is_valid());
    assert!(cluster.is_bad(&workers[1].id));
    // Even the healthy worker gets nothing.
    assert_eq!(pkt.next_packet(&workers[0].id, None), None);
    assert_eq!(pkt.processed(), 0);
}

#[test]
fn transport_failure_invalidates_the_whole_packetizer() {
    let (dataset, cluster) = five_file_dataset("h1.sim");
    let workers = vec![worker("w1", "h1.sim"), worker("w2", "h1.sim")];
    let cluster = Arc::new(cluster.with_dropped_recv(&workers[0].id));

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        0,
        -1,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    assert!(!pkt.is_valid());
    assert!(cluster.is_bad(&workers[0].id));
    assert_eq!(pkt.next_packet(&workers[1].id, None), None);
}

#[test]
fn corrected_object_name_sticks_to_dispatched_packets() {
    let u = url("h1.sim", 0);
    let mut dataset = Dataset::new(DatasetKind::Records);
    dataset.push(Element::new(&u, "/data", "f0", 0, -1, ""));

    let workers = vec![worker("w1", "h1.sim")];
    // The worker follows a redirect and reports the endpoint's real name.
    let cluster = Arc::new(
        SimCluster::new()
            .with_file(&u, 500)
            .with_object_alias(&u, "f0_cycle2"),
    );

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        0,
        -1,
        &ParamBag::new(),
        cluster,
        None,
    );
    assert!(pkt.is_valid());
    let packet = pkt.next_packet(&workers[0].id, None).unwrap();
    assert_eq!(packet.obj, "f0_cycle2");
}

#[test]
fn validation_forwards_worker_logs() {
    let u = url("h1.sim", 0);
    let mut dataset = Dataset::new(DatasetKind::Records);
    dataset.push(Element::new(&u, "/data", "f0", 0, -1, ""));

    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(
        SimCluster::new()
            .with_file(&u, 1000)
            .with_log_before_reply(&workers[0].id),
    );

    let pkt = Packetizer::new(
        dataset,
        workers,
        0,
        -1,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    assert!(pkt.is_valid());
    // One LogFile chunk and one LogDone, both passed through.
    assert_eq!(cluster.forwarded_logs(), 2);
}

#[test]
fn empty_dataset_constructs_an_invalid_instance() {
    let dataset = Dataset::new(DatasetKind::Records);
    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(SimCluster::new());

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        0,
        -1,
        &ParamBag::new(),
        cluster,
        None,
    );
    assert!(!pkt.is_valid());
    assert_eq!(pkt.next_packet(&workers[0].id, None), None);
}

#[test]
fn selection_elements_survive_windowing_and_carve_restricted() {
    let plain = url("h1.sim", 0);
    let selected = url("h1.sim", 1);
    let mut dataset = Dataset::new(DatasetKind::Records);
    dataset.push(Element::new(&plain, "/data", "f0", 0, -1, ""));
    dataset.push(
        Element::new(&selected, "/data", "f1", 0, -1, "")
            .with_selection(Selection::Entries(vec![10, 20, 900])),
    );

    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(
        SimCluster::new()
            .with_file(&plain, 1000)
            .with_file(&selected, 1000)
            .with_worker_rate(&workers[0].id, 128.0),
    );

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        0,
        -1,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    assert!(pkt.is_valid());
    // 1000 plain records plus a 3-entry selection.
    assert_eq!(pkt.total_entries(), 1003);

    let dispatches = drive(&mut pkt, &cluster, &workers);
    assert_eq!(pkt.processed(), 1003);

    // Packets of the selected file carry contiguous slices of the list,
    // sized like the packet, and together they rebuild the whole list.
    let mut rebuilt = Vec::new();
    for d in dispatches.iter().filter(|d| d.packet.url == selected) {
        match &d.packet.selection {
            Some(Selection::Entries(list)) => {
                assert_eq!(list.len() as i64, d.packet.num);
                rebuilt.push((d.packet.first, list.clone()));
            }
            other => panic!("expected a restricted entry list, got {other:?}"),
        }
    }
    rebuilt.sort_unstable();
    let flat: Vec<i64> = rebuilt.into_iter().flat_map(|(_, l)| l).collect();
    assert_eq!(flat, vec![10, 20, 900]);
}

#[test]
fn dataset_wide_selection_overrides_the_total() {
    let (mut dataset, cluster) = five_file_dataset("h1.sim");
    dataset.selection = Some(Selection::Entries(vec![3, 99, 2048, 4999]));

    let workers = vec![worker("w1", "h1.sim")];
    let pkt = Packetizer::new(
        dataset,
        workers,
        0,
        -1,
        &ParamBag::new(),
        Arc::new(cluster),
        None,
    );
    assert!(pkt.is_valid());
    assert_eq!(pkt.total_entries(), 4);
}

#[test]
fn reset_before_scheduling_is_harmless() {
    let (dataset, cluster) = five_file_dataset("h1.sim");
    let workers = vec![worker("w1", "h1.sim")];
    let cluster = Arc::new(cluster.with_worker_rate(&workers[0].id, 128.0));

    let mut pkt = Packetizer::new(
        dataset,
        workers.clone(),
        0,
        -1,
        &ParamBag::new(),
        cluster.clone(),
        None,
    );
    pkt.reset();
    let dispatches = drive(&mut pkt, &cluster, &workers);
    assert_eq!(pkt.processed(), 5000);
    assert!(!dispatches.is_empty());
}
