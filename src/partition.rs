//! shot quotas per process and recombination of per-process results on the supervisor.
//!
//! workers report, in this order and each under its own tag: shot count,
//! results map, native results map, raw counts, probabilities, probability
//! gradients. the last four are optional and only travel when the run asked
//! for them. the supervisor issues its receives in the same order.
//!
//! raw counts are absolute tallies and are summed as they are. probabilities
//! and gradients are estimates over each process's own shots, so every
//! contribution (the supervisor's own included) is weighted by
//! `process_shots / total_shots_requested` before summing.

use itertools::Itertools;

use crate::codec::{pack_gradients, pack_results_map, unpack_gradients, unpack_results_map_into};
use crate::error::{Error, Result};
use crate::manager::MpiManager;
use crate::results::{total_shots, OutProbabilityGradients, ResultsMap};
use crate::transport::{MessageTag, Transport};

/// shots assigned to `process_id` out of `total_shots`.
///
/// every process gets `total_shots / total_processes`; the remainder goes one
/// shot each to processes `1..=remainder`, never to the supervisor. returns 0
/// when `total_processes` is 0.
pub fn shots_for_mpi_process(total_processes: usize, total_shots: usize, process_id: usize) -> usize {
    if total_processes == 0 {
        return 0;
    }
    let base = total_shots / total_processes;
    let remainder = total_shots % total_processes;
    if process_id != 0 && process_id <= remainder {
        base + 1
    } else {
        base
    }
}

/// everything one process measured in one run.
///
/// `None` in an optional field means the payload was not requested; all
/// processes of a run must agree on which payloads are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessResults {
    pub results: ResultsMap,
    pub native_results: Option<ResultsMap>,
    pub counts: Option<Vec<u32>>,
    pub probabilities: Option<Vec<f64>>,
    pub gradients: Option<OutProbabilityGradients>,
}

impl ProcessResults {
    pub fn new(results: ResultsMap) -> Self {
        Self {
            results,
            ..Default::default()
        }
    }

    /// shots actually taken, derived from the results map.
    pub fn shots(&self) -> u64 {
        total_shots(&self.results)
    }
}

/// worker side: sends this process's results to the supervisor.
pub fn send_results_to_supervisor<T: Transport>(
    manager: &mut MpiManager<T>,
    local: &ProcessResults,
) -> Result<()> {
    if manager.is_supervisor() {
        return Err(Error::Aggregation(
            "the supervisor collects results, it does not send them".into(),
        ));
    }

    let shots = u32::try_from(local.shots()).map_err(|_| {
        Error::Encode(format!(
            "shot count {} of process {} does not fit the wire type",
            local.shots(),
            manager.get_process_id()
        ))
    })?;

    manager.send_to_supervisor(&[shots], MessageTag::ShotCount)?;
    manager.send_to_supervisor(&pack_results_map(&local.results)?, MessageTag::ResultsMap)?;

    if let Some(native) = &local.native_results {
        manager.send_to_supervisor(&pack_results_map(native)?, MessageTag::NativeResultsMap)?;
    }
    if let Some(counts) = &local.counts {
        manager.send_to_supervisor(counts, MessageTag::Counts)?;
    }
    if let Some(probabilities) = &local.probabilities {
        manager.send_to_supervisor(probabilities, MessageTag::Probabilities)?;
    }
    if let Some(gradients) = &local.gradients {
        manager.send_to_supervisor(&pack_gradients(gradients)?, MessageTag::ProbabilityGradients)?;
    }

    log::debug!(
        "process {} reported {} shots to the supervisor",
        manager.get_process_id(),
        shots
    );
    Ok(())
}

fn shape_mismatch(what: &str, source: usize, expected: usize, actual: usize) -> Error {
    Error::Aggregation(format!(
        "{} from process {} has {} entries, expected {}",
        what, source, actual, expected
    ))
}

/// supervisor side: receives every worker's results and folds them into `aggregate`.
///
/// `aggregate` holds the supervisor's own results on entry and the combined
/// results on return. returns the shot count reported by each process,
/// indexed by process id.
pub fn collect_results_from_mpi_processes<T: Transport>(
    manager: &mut MpiManager<T>,
    total_shots_requested: usize,
    aggregate: &mut ProcessResults,
) -> Result<Vec<u64>> {
    if !manager.is_supervisor() {
        return Err(Error::Aggregation(format!(
            "process {} is not the supervisor and cannot collect results",
            manager.get_process_id()
        )));
    }

    // local shape is checked before any worker message is consumed
    if let Some(gradients) = &aggregate.gradients {
        let row_len = gradients.first().map_or(0, |row| row.len());
        if let Some((idx, row)) = gradients.iter().enumerate().find(|(_, r)| r.len() != row_len) {
            return Err(Error::Aggregation(format!(
                "ragged local gradients: row {} has {} entries, row 0 has {}",
                idx,
                row.len(),
                row_len
            )));
        }
    }

    let own_shots = aggregate.shots();
    let mut shots_per_process = vec![own_shots; manager.get_total_processes()];

    log::info!(
        "collecting results from {} processes, {} shots requested",
        manager.get_total_processes(),
        total_shots_requested
    );

    manager.receive_from_others::<u32, _>(MessageTag::ShotCount, |source, data| {
        match data {
            [shots] => {
                shots_per_process[source] = *shots as u64;
                Ok(())
            }
            _ => Err(Error::Decode(format!(
                "shot count message from process {} has {} elements, expected 1",
                source,
                data.len()
            ))),
        }
    })?;

    let results = &mut aggregate.results;
    manager.receive_from_others::<u32, _>(MessageTag::ResultsMap, |_, data| {
        unpack_results_map_into(data, results)
    })?;

    if let Some(native) = aggregate.native_results.as_mut() {
        manager.receive_from_others::<u32, _>(MessageTag::NativeResultsMap, |_, data| {
            unpack_results_map_into(data, native)
        })?;
    }

    if let Some(counts) = aggregate.counts.as_mut() {
        manager.receive_from_others::<u32, _>(MessageTag::Counts, |source, data| {
            if data.len() != counts.len() {
                return Err(shape_mismatch("counts", source, counts.len(), data.len()));
            }
            for (total, &v) in counts.iter_mut().zip(data) {
                *total = total.checked_add(v).ok_or_else(|| {
                    Error::Aggregation(format!("count overflow adding counts of process {}", source))
                })?;
            }
            Ok(())
        })?;
    }

    let needs_weights = aggregate.probabilities.is_some() || aggregate.gradients.is_some();
    if needs_weights && total_shots_requested == 0 {
        return Err(Error::Aggregation(
            "cannot weight probabilities by a total of 0 requested shots".into(),
        ));
    }
    let weight = |shots: u64| shots as f64 / total_shots_requested as f64;

    if let Some(probabilities) = aggregate.probabilities.as_mut() {
        let own_weight = weight(own_shots);
        probabilities.iter_mut().for_each(|p| *p *= own_weight);

        manager.receive_from_others::<f64, _>(MessageTag::Probabilities, |source, data| {
            if data.len() != probabilities.len() {
                return Err(shape_mismatch(
                    "probabilities",
                    source,
                    probabilities.len(),
                    data.len(),
                ));
            }
            let w = weight(shots_per_process[source]);
            for (total, &p) in probabilities.iter_mut().zip(data) {
                *total += p * w;
            }
            Ok(())
        })?;
    }

    if let Some(gradients) = aggregate.gradients.as_mut() {
        let own_weight = weight(own_shots);
        gradients
            .iter_mut()
            .flat_map(|row| row.iter_mut())
            .for_each(|g| *g *= own_weight);

        let row_len = gradients.first().map_or(0, |row| row.len());
        manager.receive_from_others::<f64, _>(MessageTag::ProbabilityGradients, |source, data| {
            let rows = unpack_gradients(data)?;
            if rows.len() != gradients.len() {
                return Err(shape_mismatch(
                    "gradient rows",
                    source,
                    gradients.len(),
                    rows.len(),
                ));
            }
            if !rows.is_empty() && rows.row_len() != row_len {
                return Err(shape_mismatch(
                    "gradient row",
                    source,
                    row_len,
                    rows.row_len(),
                ));
            }
            let w = weight(shots_per_process[source]);
            for (total_row, row) in gradients.iter_mut().zip(rows.iter()) {
                for (total, &g) in total_row.iter_mut().zip(row) {
                    *total += g * w;
                }
            }
            Ok(())
        })?;
    }

    log::info!(
        "collected {} shots across processes [{}]",
        shots_per_process.iter().sum::<u64>(),
        shots_per_process.iter().join(", ")
    );
    Ok(shots_per_process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{local_cluster, LocalTransport};
    use proptest::prelude::*;
    use std::time::Duration;

    fn managers(size: usize) -> Vec<MpiManager<LocalTransport>> {
        local_cluster(size)
            .into_iter()
            .map(|t| MpiManager::new(t, Duration::from_secs(5)))
            .collect()
    }

    fn map_of(entries: &[(&str, u32)]) -> ResultsMap {
        entries
            .iter()
            .map(|(k, v)| (k.chars().map(|c| c == '1').collect(), *v))
            .collect()
    }

    #[test]
    fn test_shot_quota_examples() {
        // 10 shots over 4 processes: base 2, remainder 2 to processes 1 and 2
        let quotas: Vec<_> = (0..4).map(|p| shots_for_mpi_process(4, 10, p)).collect();
        assert_eq!(quotas, vec![2, 3, 3, 2]);

        assert_eq!(shots_for_mpi_process(1, 1000, 0), 1000);
        assert_eq!(shots_for_mpi_process(3, 2, 0), 0);
        assert_eq!(shots_for_mpi_process(3, 2, 1), 1);
        assert_eq!(shots_for_mpi_process(3, 2, 2), 1);
        assert_eq!(shots_for_mpi_process(0, 10, 0), 0);
    }

    proptest! {
        #[test]
        fn shot_quotas_sum_to_total(processes in 1usize..=64, shots in 0usize..=10_000_000) {
            let sum: usize = (0..processes)
                .map(|p| shots_for_mpi_process(processes, shots, p))
                .sum();
            prop_assert_eq!(sum, shots);
            // the supervisor never carries the remainder
            prop_assert_eq!(shots_for_mpi_process(processes, shots, 0), shots / processes);
        }
    }

    #[test]
    fn test_results_maps_and_counts_are_summed() {
        let mut ms = managers(3);

        let worker1 = ProcessResults {
            results: map_of(&[("00", 3), ("11", 2)]),
            native_results: Some(map_of(&[("00", 3), ("11", 2)])),
            counts: Some(vec![3, 0, 0, 2]),
            ..Default::default()
        };
        let worker2 = ProcessResults {
            results: map_of(&[("11", 4)]),
            native_results: Some(map_of(&[("11", 4)])),
            counts: Some(vec![0, 0, 0, 4]),
            ..Default::default()
        };
        send_results_to_supervisor(&mut ms[1], &worker1).unwrap();
        send_results_to_supervisor(&mut ms[2], &worker2).unwrap();

        let mut aggregate = ProcessResults {
            results: map_of(&[("01", 1)]),
            native_results: Some(map_of(&[("01", 1)])),
            counts: Some(vec![0, 1, 0, 0]),
            ..Default::default()
        };
        let shots = collect_results_from_mpi_processes(&mut ms[0], 10, &mut aggregate).unwrap();

        assert_eq!(shots, vec![1, 5, 4]);
        let expected = map_of(&[("00", 3), ("01", 1), ("11", 6)]);
        assert_eq!(aggregate.results, expected);
        assert_eq!(aggregate.native_results, Some(expected));
        assert_eq!(aggregate.counts, Some(vec![3, 1, 0, 6]));
    }

    #[test]
    fn test_probabilities_are_shot_weighted() {
        let mut ms = managers(3);
        // uneven split 700/200/100 of 1000
        let per_process = [
            (700u32, vec![0.5, 0.5, 0.0, 0.0]),
            (200u32, vec![0.25, 0.25, 0.25, 0.25]),
            (100u32, vec![0.0, 0.0, 0.0, 1.0]),
        ];

        for (rank, (shots, probs)) in per_process.iter().enumerate().skip(1) {
            let local = ProcessResults {
                results: map_of(&[("0", *shots)]),
                probabilities: Some(probs.clone()),
                ..Default::default()
            };
            send_results_to_supervisor(&mut ms[rank], &local).unwrap();
        }

        let mut aggregate = ProcessResults {
            results: map_of(&[("0", per_process[0].0)]),
            probabilities: Some(per_process[0].1.clone()),
            ..Default::default()
        };
        collect_results_from_mpi_processes(&mut ms[0], 1000, &mut aggregate).unwrap();

        let probs = aggregate.probabilities.unwrap();
        let expected = [0.35 + 0.05, 0.35 + 0.05, 0.05, 0.05 + 0.1];
        for (p, e) in probs.iter().zip(expected) {
            assert!((p - e).abs() < 1e-12, "{} vs {}", p, e);
        }
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gradient_rows_stay_zero_sum() {
        let mut ms = managers(3);
        let splits = [500u32, 300, 200];
        let rows = [
            vec![vec![0.2, -0.2, 0.0], vec![0.1, 0.1, -0.2]],
            vec![vec![-0.4, 0.1, 0.3], vec![0.0, 0.0, 0.0]],
            vec![vec![1.0, -0.5, -0.5], vec![0.3, -0.6, 0.3]],
        ];

        for rank in 1..3 {
            let local = ProcessResults {
                results: map_of(&[("1", splits[rank])]),
                gradients: Some(rows[rank].clone()),
                ..Default::default()
            };
            send_results_to_supervisor(&mut ms[rank], &local).unwrap();
        }

        let mut aggregate = ProcessResults {
            results: map_of(&[("1", splits[0])]),
            gradients: Some(rows[0].clone()),
            ..Default::default()
        };
        collect_results_from_mpi_processes(&mut ms[0], 1000, &mut aggregate).unwrap();

        let gradients = aggregate.gradients.unwrap();
        assert_eq!(gradients.len(), 2);
        for row in &gradients {
            assert!(row.iter().sum::<f64>().abs() < 1e-6);
        }
        let expected_first = 0.5 * 0.2 + 0.3 * -0.4 + 0.2 * 1.0;
        assert!((gradients[0][0] - expected_first).abs() < 1e-12);
    }

    #[test]
    fn test_absent_payloads_are_not_exchanged() {
        let mut ms = managers(2);
        let local = ProcessResults::new(map_of(&[("10", 4)]));
        send_results_to_supervisor(&mut ms[1], &local).unwrap();

        let mut aggregate = ProcessResults::new(map_of(&[("10", 6)]));
        collect_results_from_mpi_processes(&mut ms[0], 10, &mut aggregate).unwrap();

        assert_eq!(aggregate.results[&vec![true, false]], 10);
        assert!(aggregate.native_results.is_none());
        assert!(aggregate.counts.is_none());
        assert!(aggregate.probabilities.is_none());
        assert!(aggregate.gradients.is_none());
    }

    #[test]
    fn test_mismatched_probability_lengths_fail() {
        let mut ms = managers(2);
        let local = ProcessResults {
            results: map_of(&[("1", 5)]),
            probabilities: Some(vec![0.5, 0.5]),
            ..Default::default()
        };
        send_results_to_supervisor(&mut ms[1], &local).unwrap();

        let mut aggregate = ProcessResults {
            results: map_of(&[("1", 5)]),
            probabilities: Some(vec![0.25, 0.25, 0.25, 0.25]),
            ..Default::default()
        };
        let err = collect_results_from_mpi_processes(&mut ms[0], 10, &mut aggregate).unwrap_err();
        assert!(matches!(err, Error::Aggregation(_)));
    }

    #[test]
    fn test_missing_worker_times_out() {
        let mut ms: Vec<_> = local_cluster(2)
            .into_iter()
            .map(|t| MpiManager::new(t, Duration::from_millis(20)))
            .collect();
        let mut aggregate = ProcessResults::new(map_of(&[("1", 1)]));
        let err = collect_results_from_mpi_processes(&mut ms[0], 2, &mut aggregate).unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                process_id: 1,
                tag: MessageTag::ShotCount,
                ..
            }
        ));
    }

    #[test]
    fn test_ragged_local_gradients_fail_before_receiving() {
        let mut ms = managers(2);
        let mut worker = ProcessResults::new(map_of(&[("0", 1)]));
        worker.gradients = Some(vec![vec![0.5, -0.5], vec![0.25, -0.25]]);
        send_results_to_supervisor(&mut ms[1], &worker).unwrap();

        let mut aggregate = ProcessResults::new(map_of(&[("1", 1)]));
        aggregate.gradients = Some(vec![vec![0.5, -0.5], vec![0.25]]);
        let err = collect_results_from_mpi_processes(&mut ms[0], 2, &mut aggregate).unwrap_err();
        assert!(matches!(err, Error::Aggregation(_)));
        // nothing was folded in
        assert_eq!(aggregate.results, map_of(&[("1", 1)]));
    }

    #[test]
    fn test_roles_are_enforced() {
        let mut ms = managers(2);
        let local = ProcessResults::default();
        assert!(send_results_to_supervisor(&mut ms[0], &local).is_err());
        let mut aggregate = ProcessResults::default();
        assert!(collect_results_from_mpi_processes(&mut ms[1], 1, &mut aggregate).is_err());
    }
}
