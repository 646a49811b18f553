// end-to-end driver for one distributed shot run.
//
// every process samples its own shot quota, workers report to the supervisor
// and the supervisor folds everything into a single summary.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manager::MpiManager;
use crate::partition::{
    collect_results_from_mpi_processes, send_results_to_supervisor, shots_for_mpi_process,
};
use crate::results::bitstring_to_string;
use crate::sampler::SyntheticCircuit;
use crate::transport::{local_cluster, Transport};

/// what a run should measure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub num_qubits: usize,
    pub total_shots: usize,
    pub params: Vec<f64>,
    pub seed: u64,
    pub with_gradients: bool,
}

/// aggregated outcome, produced on the supervisor only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_processes: usize,
    pub total_shots: u64,
    pub shots_per_process: Vec<u64>,
    pub results: BTreeMap<String, u32>,
    pub native_results: BTreeMap<String, u32>,
    pub counts: Vec<u32>,
    pub probabilities: Vec<f64>,
    pub gradients: Vec<Vec<f64>>,
}

/// runs this process's share of `spec` and takes part in the aggregation.
///
/// returns the summary on the supervisor and `None` on workers.
pub fn run_process<T: Transport>(
    manager: &mut MpiManager<T>,
    spec: &RunSpec,
) -> Result<Option<RunSummary>> {
    let process_id = manager.get_process_id();
    let total_processes = manager.get_total_processes();
    let shots = shots_for_mpi_process(total_processes, spec.total_shots, process_id);

    // distinct, reproducible stream per process
    let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);
    rng.set_stream(process_id as u64);

    let circuit = SyntheticCircuit::new(spec.num_qubits, spec.params.clone());
    let mut local = circuit.run(shots, spec.with_gradients, &mut rng)?;
    log::info!(
        "process {} of {} ran {} shots",
        process_id,
        total_processes,
        local.shots()
    );

    if !manager.is_supervisor() {
        send_results_to_supervisor(manager, &local)?;
        return Ok(None);
    }

    let shots_per_process =
        collect_results_from_mpi_processes(manager, spec.total_shots, &mut local)?;

    let to_strings = |map: &crate::results::ResultsMap| {
        map.iter()
            .map(|(k, &v)| (bitstring_to_string(k), v))
            .collect::<BTreeMap<_, _>>()
    };

    Ok(Some(RunSummary {
        total_processes,
        total_shots: local.shots(),
        shots_per_process,
        results: to_strings(&local.results),
        native_results: local.native_results.as_ref().map(to_strings).unwrap_or_default(),
        counts: local.counts.unwrap_or_default(),
        probabilities: local.probabilities.unwrap_or_default(),
        gradients: local.gradients.unwrap_or_default(),
    }))
}

/// runs `spec` over `processes` in-process ranks, one thread each.
pub fn run_local_cluster(
    processes: usize,
    spec: &RunSpec,
    receive_timeout: Duration,
) -> Result<RunSummary> {
    if processes == 0 {
        return Err(Error::Config("at least one process is required".into()));
    }

    let outcomes: Vec<Result<Option<RunSummary>>> = thread::scope(|scope| {
        let handles: Vec<_> = local_cluster(processes)
            .into_iter()
            .map(|transport| {
                scope.spawn(move || {
                    let mut manager = MpiManager::new(transport, receive_timeout);
                    run_process(&mut manager, spec)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::Transport("a process thread panicked".into())))
            })
            .collect()
    });

    let mut summary = None;
    for outcome in outcomes {
        if let Some(s) = outcome? {
            summary = Some(s);
        }
    }
    summary.ok_or_else(|| Error::Aggregation("the supervisor produced no summary".into()))
}
