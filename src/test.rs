// end-to-end runs across whole clusters of processes.

use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use crate::codec::{pack_results_map, unpack_results_map_into};
use crate::distribute::{run_local_cluster, run_process, RunSpec};
use crate::manager::MpiManager;
use crate::partition::{
    collect_results_from_mpi_processes, send_results_to_supervisor, shots_for_mpi_process,
    ProcessResults,
};
use crate::results::{total_shots, ResultsMap};
use crate::transport::{local_cluster, TcpTransport};

// --- common test helpers ---

const TOLERANCE: f64 = 1e-6;

fn spec(total_shots: usize, with_gradients: bool) -> RunSpec {
    RunSpec {
        num_qubits: 3,
        total_shots,
        params: vec![0.4, -0.9, 0.15],
        seed: 2024,
        with_gradients,
    }
}

fn key(bits: &str) -> Vec<bool> {
    bits.chars().map(|c| c == '1').collect()
}

fn assert_sums_to(values: &[f64], expected: f64) {
    let sum: f64 = values.iter().sum();
    assert!(
        (sum - expected).abs() < TOLERANCE,
        "values sum to {}, expected {}",
        sum,
        expected
    );
}

// --- local cluster runs ---

#[test]
fn test_uneven_split_keeps_every_shot() {
    // 1003 over 4 processes: 250, 251, 251, 251
    let summary = run_local_cluster(4, &spec(1003, true), Duration::from_secs(10)).unwrap();

    assert_eq!(summary.total_processes, 4);
    assert_eq!(summary.shots_per_process, vec![250, 251, 251, 251]);
    assert_eq!(summary.total_shots, 1003);
    assert_eq!(summary.results.values().map(|&v| v as u64).sum::<u64>(), 1003);
    assert_eq!(
        summary.native_results.values().map(|&v| v as u64).sum::<u64>(),
        1003
    );
    assert_eq!(summary.counts.iter().map(|&c| c as u64).sum::<u64>(), 1003);
    assert!(summary.results.keys().all(|k| k.len() == 3));
}

#[test]
fn test_aggregated_probabilities_and_gradients_stay_normalised() {
    let summary = run_local_cluster(5, &spec(2000, true), Duration::from_secs(10)).unwrap();

    assert_eq!(summary.probabilities.len(), 8);
    assert_sums_to(&summary.probabilities, 1.0);

    assert_eq!(summary.gradients.len(), 3);
    for row in &summary.gradients {
        assert_eq!(row.len(), 8);
        assert_sums_to(row, 0.0);
    }
}

#[test]
fn test_more_processes_than_shots() {
    let summary = run_local_cluster(6, &spec(3, false), Duration::from_secs(10)).unwrap();
    assert_eq!(summary.shots_per_process, vec![0, 1, 1, 1, 0, 0]);
    assert_eq!(summary.total_shots, 3);
    assert!(summary.gradients.is_empty());
}

#[test]
fn test_runs_are_reproducible_for_a_seed() {
    let a = run_local_cluster(3, &spec(600, false), Duration::from_secs(10)).unwrap();
    let b = run_local_cluster(3, &spec(600, false), Duration::from_secs(10)).unwrap();
    assert_eq!(a.results, b.results);
    assert_eq!(a.counts, b.counts);
}

#[test]
fn test_partition_matches_reported_shots() {
    let processes = 7;
    let total = 1_000_003;
    let quotas: Vec<usize> = (0..processes)
        .map(|p| shots_for_mpi_process(processes, total, p))
        .collect();
    assert_eq!(quotas.iter().sum::<usize>(), total);
    assert_eq!(quotas[0], total / processes);
}

// --- hand-built payloads ---

#[test]
fn test_wire_example_aggregates_with_supervisor_results() {
    let mut managers: Vec<_> = local_cluster(2)
        .into_iter()
        .map(|t| MpiManager::new(t, Duration::from_secs(5)))
        .collect();

    let mut worker_results = ResultsMap::new();
    worker_results.insert(key("1010"), 2456);
    worker_results.insert(key("0101"), 76);
    assert_eq!(
        pack_results_map(&worker_results).unwrap(),
        vec![4, 1, 0b0101, 76, 1, 0b1010, 2456]
    );

    let worker = ProcessResults::new(worker_results);
    send_results_to_supervisor(&mut managers[1], &worker).unwrap();

    let mut own = ResultsMap::new();
    own.insert(key("1010"), 4);
    own.insert(key("1111"), 10);
    let mut aggregate = ProcessResults::new(own);

    let shots = collect_results_from_mpi_processes(&mut managers[0], 2546, &mut aggregate).unwrap();
    assert_eq!(shots, vec![14, 2532]);
    assert_eq!(aggregate.results[&key("1010")], 2460);
    assert_eq!(aggregate.results[&key("0101")], 76);
    assert_eq!(aggregate.results[&key("1111")], 10);
    assert_eq!(total_shots(&aggregate.results), 2546);
}

#[test]
fn test_decoding_into_existing_map_sums_counts() {
    let mut map = ResultsMap::new();
    map.insert(key("01"), 5);
    unpack_results_map_into(&[2, 1, 0b10, 7, 1, 0b01, 1], &mut map).unwrap();
    assert_eq!(map[&key("01")], 6);
    assert_eq!(map[&key("10")], 7);
}

// --- tcp runs ---

#[test]
fn test_tcp_cluster_end_to_end() {
    let size = 3;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let run = spec(901, true);

    let summary = thread::scope(|scope| {
        for rank in 1..size {
            let addr = addr.clone();
            let run = &run;
            scope.spawn(move || {
                let transport = TcpTransport::worker(
                    &addr,
                    rank,
                    size,
                    5,
                    Duration::from_millis(50),
                    Duration::from_secs(10),
                )
                .unwrap();
                let mut manager = MpiManager::new(transport, Duration::from_secs(10));
                assert!(run_process(&mut manager, run).unwrap().is_none());
            });
        }

        let transport = TcpTransport::supervisor(listener, size, Duration::from_secs(10)).unwrap();
        let mut manager = MpiManager::new(transport, Duration::from_secs(10));
        run_process(&mut manager, &run).unwrap().unwrap()
    });

    assert_eq!(summary.shots_per_process, vec![300, 301, 300]);
    assert_eq!(summary.total_shots, 901);
    assert_sums_to(&summary.probabilities, 1.0);
    for row in &summary.gradients {
        assert_sums_to(row, 0.0);
    }
}
