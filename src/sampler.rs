// synthetic shot workload.
//
// stands in for circuit execution so the distribution protocol can be driven
// end to end: a parameterised distribution over 2^n bitstrings, sampled
// shot by shot, with parameter-shift style finite-difference gradients.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{Error, Result};
use crate::partition::ProcessResults;
use crate::results::{add_count, bitstring_from_rank, bitstring_rank, total_shots, ResultsMap};

/// parameter shift used for finite-difference gradients.
pub const GRADIENT_SHIFT: f64 = 0.1;

/// widest bitstring the sampler builds a dense distribution for.
pub const MAX_QUBITS: usize = 24;

/// number of outcomes for `num_qubits` bits, rejecting widths outside `1..=MAX_QUBITS`.
pub fn state_count(num_qubits: usize) -> Result<usize> {
    if num_qubits == 0 || num_qubits > MAX_QUBITS {
        return Err(Error::Config(format!(
            "{} qubits is outside the supported range 1..={}",
            num_qubits, MAX_QUBITS
        )));
    }
    1usize
        .checked_shl(num_qubits as u32)
        .ok_or_else(|| Error::Config(format!("{} qubits is too many to sample", num_qubits)))
}

/// draws `shots` bitstrings of `num_qubits` bits from `distribution` (indexed by msb-first rank).
pub fn sample_shots<R: Rng + ?Sized>(
    distribution: &[f64],
    num_qubits: usize,
    shots: usize,
    rng: &mut R,
) -> Result<ResultsMap> {
    let states = state_count(num_qubits)?;
    if distribution.len() != states {
        return Err(Error::Config(format!(
            "distribution has {} entries, {} qubits need {}",
            distribution.len(),
            num_qubits,
            states
        )));
    }

    let mut map = ResultsMap::new();
    if shots == 0 {
        return Ok(map);
    }

    let sampler = WeightedIndex::new(distribution)
        .map_err(|e| Error::Config(format!("invalid distribution: {}", e)))?;
    for _ in 0..shots {
        let rank = sampler.sample(rng);
        add_count(&mut map, &bitstring_from_rank(rank, num_qubits), 1)?;
    }
    Ok(map)
}

/// per-bitstring shot counts, indexed by msb-first rank.
pub fn counts_vector(map: &ResultsMap, num_qubits: usize) -> Result<Vec<u32>> {
    let mut counts = vec![0u32; state_count(num_qubits)?];
    for (key, &count) in map {
        if let Some(slot) = counts.get_mut(bitstring_rank(key)) {
            *slot = slot.saturating_add(count);
        }
    }
    Ok(counts)
}

/// relative frequencies, indexed by msb-first rank. all zero for an empty map.
pub fn estimate_probabilities(map: &ResultsMap, num_qubits: usize) -> Result<Vec<f64>> {
    let total = total_shots(map);
    let counts = counts_vector(map, num_qubits)?;
    if total == 0 {
        return Ok(vec![0.0; counts.len()]);
    }
    Ok(counts.iter().map(|&c| c as f64 / total as f64).collect())
}

// same shots with the bit order reversed, as a backend with lsb-first qubit
// numbering would report them.
fn native_order(map: &ResultsMap) -> Result<ResultsMap> {
    let mut native = ResultsMap::new();
    for (key, &count) in map {
        let reversed: Vec<bool> = key.iter().rev().copied().collect();
        add_count(&mut native, &reversed, count)?;
    }
    Ok(native)
}

/// a distribution over `2^num_qubits` outcomes driven by real parameters.
#[derive(Debug, Clone)]
pub struct SyntheticCircuit {
    pub num_qubits: usize,
    pub params: Vec<f64>,
}

impl SyntheticCircuit {
    pub fn new(num_qubits: usize, params: Vec<f64>) -> Self {
        Self { num_qubits, params }
    }

    /// softmax of parameter-weighted cosine logits.
    pub fn distribution_at(&self, params: &[f64]) -> Result<Vec<f64>> {
        let states = state_count(self.num_qubits)?;
        let logits: Vec<f64> = (0..states)
            .map(|i| {
                params
                    .iter()
                    .enumerate()
                    .map(|(k, theta)| theta * ((k + 1) as f64 * i as f64).cos())
                    .sum::<f64>()
            })
            .collect();
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let norm: f64 = weights.iter().sum();
        Ok(weights.iter().map(|w| w / norm).collect())
    }

    pub fn distribution(&self) -> Result<Vec<f64>> {
        self.distribution_at(&self.params)
    }

    /// runs `shots` shots and fills every payload the protocol carries.
    pub fn run<R: Rng + ?Sized>(
        &self,
        shots: usize,
        with_gradients: bool,
        rng: &mut R,
    ) -> Result<ProcessResults> {
        // width is checked before any distribution is built
        state_count(self.num_qubits)?;
        let results = sample_shots(&self.distribution()?, self.num_qubits, shots, rng)?;
        let probabilities = estimate_probabilities(&results, self.num_qubits)?;
        let counts = counts_vector(&results, self.num_qubits)?;

        let gradients = if with_gradients {
            let mut rows = Vec::with_capacity(self.params.len());
            for k in 0..self.params.len() {
                let mut plus = self.params.clone();
                plus[k] += GRADIENT_SHIFT;
                let mut minus = self.params.clone();
                minus[k] -= GRADIENT_SHIFT;

                let p_plus = estimate_probabilities(
                    &sample_shots(&self.distribution_at(&plus)?, self.num_qubits, shots, rng)?,
                    self.num_qubits,
                )?;
                let p_minus = estimate_probabilities(
                    &sample_shots(&self.distribution_at(&minus)?, self.num_qubits, shots, rng)?,
                    self.num_qubits,
                )?;
                rows.push(
                    p_plus
                        .iter()
                        .zip(&p_minus)
                        .map(|(a, b)| (a - b) / (2.0 * GRADIENT_SHIFT))
                        .collect(),
                );
            }
            Some(rows)
        } else {
            None
        };

        Ok(ProcessResults {
            native_results: Some(native_order(&results)?),
            counts: Some(counts),
            probabilities: Some(probabilities),
            gradients,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_sample_shots_total_and_width() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let map = sample_shots(&[0.25, 0.25, 0.25, 0.25], 2, 500, &mut rng).unwrap();
        assert_eq!(total_shots(&map), 500);
        assert!(map.keys().all(|k| k.len() == 2));
    }

    #[test]
    fn test_sample_shots_is_deterministic_for_a_seed() {
        let dist = SyntheticCircuit::new(3, vec![0.3, -0.7]).distribution().unwrap();
        let a = sample_shots(&dist, 3, 200, &mut ChaCha8Rng::seed_from_u64(11)).unwrap();
        let b = sample_shots(&dist, 3, 200, &mut ChaCha8Rng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_shots_respects_zero_weights() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let map = sample_shots(&[0.0, 0.0, 1.0, 0.0], 2, 50, &mut rng).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&vec![true, false]], 50);
    }

    #[test]
    fn test_sample_shots_rejects_bad_distribution() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(sample_shots(&[0.5, 0.5], 2, 10, &mut rng).is_err());
        assert!(sample_shots(&[0.0, 0.0], 1, 10, &mut rng).is_err());
    }

    #[test]
    fn test_estimates_sum_to_one() {
        let mut map = ResultsMap::new();
        map.insert(vec![false, true], 3);
        map.insert(vec![true, true], 1);
        let probs = estimate_probabilities(&map, 2).unwrap();
        assert_eq!(probs, vec![0.0, 0.75, 0.0, 0.25]);
        assert_eq!(counts_vector(&map, 2).unwrap(), vec![0, 3, 0, 1]);
        assert_eq!(estimate_probabilities(&ResultsMap::new(), 2).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_distribution_is_normalised() {
        let circuit = SyntheticCircuit::new(4, vec![0.5, 1.5, -0.25]);
        let dist = circuit.distribution().unwrap();
        assert_eq!(dist.len(), 16);
        assert!((dist.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(dist.iter().all(|&p| p > 0.0));
    }

    #[test]
    fn test_run_fills_every_payload() {
        let circuit = SyntheticCircuit::new(2, vec![0.4, -0.2]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let out = circuit.run(400, true, &mut rng).unwrap();

        assert_eq!(out.shots(), 400);
        assert_eq!(total_shots(out.native_results.as_ref().unwrap()), 400);
        assert_eq!(out.counts.as_ref().unwrap().iter().sum::<u32>(), 400);
        assert!((out.probabilities.as_ref().unwrap().iter().sum::<f64>() - 1.0).abs() < 1e-9);

        let gradients = out.gradients.unwrap();
        assert_eq!(gradients.len(), 2);
        for row in &gradients {
            assert_eq!(row.len(), 4);
            assert!(row.iter().sum::<f64>().abs() < 1e-9);
        }
    }

    #[test]
    fn test_out_of_range_widths_are_config_errors() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for num_qubits in [0, MAX_QUBITS + 1, 64, 200] {
            let err = SyntheticCircuit::new(num_qubits, vec![0.1])
                .run(10, false, &mut rng)
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{} qubits: {:?}", num_qubits, err);
        }
        assert!(matches!(counts_vector(&ResultsMap::new(), 64), Err(Error::Config(_))));
        assert!(matches!(
            estimate_probabilities(&ResultsMap::new(), 64),
            Err(Error::Config(_))
        ));
        assert_eq!(state_count(MAX_QUBITS).unwrap(), 1 << MAX_QUBITS);
    }

    #[test]
    fn test_native_order_reverses_bits() {
        let mut map = ResultsMap::new();
        map.insert(vec![true, false, false], 2);
        let native = native_order(&map).unwrap();
        assert_eq!(native[&vec![false, false, true]], 2);
    }
}
