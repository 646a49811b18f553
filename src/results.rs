//! in-memory shot result structures.
//!
//! a [`ResultsMap`] maps a measured bitstring to the number of shots that
//! produced it. keys are kept in a `BTreeMap` so that the order in which
//! entries are packed for transport is deterministic for a given key set.
//! element 0 of a bitstring is the most significant bit.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// one measured bitstring, element 0 is the most significant bit.
pub type BitString = Vec<bool>;

/// shots per measured bitstring.
pub type ResultsMap = BTreeMap<BitString, u32>;

/// probability gradients, outer index = circuit parameter, inner index = bitstring rank.
pub type OutProbabilityGradients = Vec<Vec<f64>>;

// adds `count` shots for `key`, inserting the key when it is not present yet.
pub fn add_count(map: &mut ResultsMap, key: &[bool], count: u32) -> Result<()> {
    match map.get_mut(key) {
        Some(existing) => {
            let current = *existing;
            *existing = current.checked_add(count).ok_or_else(|| {
                Error::Aggregation(format!(
                    "shot count for {} overflows u32 ({} + {})",
                    bitstring_to_string(key),
                    current,
                    count
                ))
            })?;
        }
        None => {
            map.insert(key.to_vec(), count);
        }
    }
    Ok(())
}

/// total number of shots recorded in a map.
pub fn total_shots(map: &ResultsMap) -> u64 {
    map.values().map(|&v| v as u64).sum()
}

// msb-first rank of a bitstring, e.g. [1,0,1] -> 5.
pub fn bitstring_rank(key: &[bool]) -> usize {
    key.iter().fold(0usize, |acc, &bit| (acc << 1) | bit as usize)
}

// inverse of bitstring_rank for a fixed width.
pub fn bitstring_from_rank(rank: usize, num_qubits: usize) -> BitString {
    (0..num_qubits)
        .map(|i| (rank >> (num_qubits - 1 - i)) & 1 == 1)
        .collect()
}

pub fn bitstring_to_string(key: &[bool]) -> String {
    key.iter().map(|&b| if b { '1' } else { '0' }).collect()
}
