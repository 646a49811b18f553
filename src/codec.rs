//! flat wire encodings for results maps and probability gradients.
//!
//! results map buffer (u32 elements):
//!
//! ```text
//! [key_bit_length] ([array_len] [packed_key_words; array_len] [count])*
//! ```
//!
//! gradients buffer (f64 elements, header slots hold integral values):
//!
//! ```text
//! [outer_size] [inner_size] [row_0 ...] [row_1 ...] ...
//! ```
//!
//! key bits are packed from the end of the key towards the front: bit `j` of
//! word `i` holds key element `key_bit_length - 1 - i * BITS_PER_WORD - j`.
//! every process in a run relies on this layout, so it must never change.

use crate::error::{Error, Result};
use crate::results::{add_count, BitString, ResultsMap};

/// bits carried by one packed key word.
pub const BITS_PER_WORD: usize = u32::BITS as usize;

/// number of words needed to hold `bit_length` key bits.
pub fn words_for_bits(bit_length: usize) -> usize {
    (bit_length + BITS_PER_WORD - 1) / BITS_PER_WORD
}

/// appends the packed words of `key` to `out`.
pub fn pack_key_bits(key: &[bool], out: &mut Vec<u32>) {
    let bit_length = key.len();
    for word_idx in 0..words_for_bits(bit_length) {
        let mut word = 0u32;
        for bit in 0..BITS_PER_WORD {
            let offset = word_idx * BITS_PER_WORD + bit;
            if offset >= bit_length {
                break;
            }
            if key[bit_length - 1 - offset] {
                word |= 1 << bit;
            }
        }
        out.push(word);
    }
}

/// overwrites `key` with the `bit_length` bits held in `words`.
///
/// the key is resized and every element is written, so a scratch key can be
/// reused across entries without stale bits leaking through.
pub fn unpack_key_bits(words: &[u32], bit_length: usize, key: &mut BitString) -> Result<()> {
    let needed = words_for_bits(bit_length);
    if words.len() != needed {
        return Err(Error::Decode(format!(
            "key of {} bits needs {} words, got {}",
            bit_length,
            needed,
            words.len()
        )));
    }
    key.clear();
    key.resize(bit_length, false);
    for offset in 0..bit_length {
        let word = words[offset / BITS_PER_WORD];
        key[bit_length - 1 - offset] = (word >> (offset % BITS_PER_WORD)) & 1 == 1;
    }
    Ok(())
}

/// packs a results map into a flat u32 buffer. an empty map packs to an empty buffer.
pub fn pack_results_map(map: &ResultsMap) -> Result<Vec<u32>> {
    let Some(first_key) = map.keys().next() else {
        return Ok(Vec::new());
    };

    let bit_length = first_key.len();
    if bit_length == 0 {
        return Err(Error::Encode("results map keys must not be empty".into()));
    }
    let header = u32::try_from(bit_length).map_err(|_| {
        Error::Encode(format!("key length {} does not fit the wire type", bit_length))
    })?;

    let words = words_for_bits(bit_length);
    let mut buffer = Vec::with_capacity(1 + map.len() * (words + 2));
    buffer.push(header);

    for (key, &count) in map {
        if key.len() != bit_length {
            return Err(Error::Encode(format!(
                "results map keys have mixed lengths ({} and {})",
                bit_length,
                key.len()
            )));
        }
        buffer.push(words as u32);
        pack_key_bits(key, &mut buffer);
        buffer.push(count);
    }

    Ok(buffer)
}

/// decodes a packed results map, calling `on_entry` once per entry in buffer order.
///
/// an empty buffer decodes to zero entries. truncated or misaligned buffers
/// are rejected with [`Error::Decode`]; entries decoded before the fault have
/// already been handed to the callback.
pub fn unpack_results_map<F>(buffer: &[u32], mut on_entry: F) -> Result<()>
where
    F: FnMut(&[bool], u32) -> Result<()>,
{
    let Some((&header, body)) = buffer.split_first() else {
        return Ok(());
    };

    let bit_length = header as usize;
    if bit_length == 0 {
        return Err(Error::Decode("key bit length must be non-zero".into()));
    }

    let mut key = BitString::with_capacity(bit_length);
    let mut pos = 0usize;
    while pos < body.len() {
        let array_len = body[pos] as usize;
        pos += 1;

        let words_end = pos
            .checked_add(array_len)
            .filter(|&end| end < body.len())
            .ok_or_else(|| {
                Error::Decode(format!(
                    "truncated results map entry at element {}: {} key words and a count \
                     expected, {} elements left",
                    pos,
                    array_len,
                    body.len() - pos
                ))
            })?;

        unpack_key_bits(&body[pos..words_end], bit_length, &mut key)?;
        let count = body[words_end];
        pos = words_end + 1;

        on_entry(&key, count)?;
    }

    Ok(())
}

/// decodes a packed results map and folds every entry into `map`, summing
/// counts for keys that are already present.
pub fn unpack_results_map_into(buffer: &[u32], map: &mut ResultsMap) -> Result<()> {
    unpack_results_map(buffer, |key, count| add_count(map, key, count))
}

/// packs gradient rows into `[outer, inner, row_0.., row_1.., ..]`.
///
/// every row must have the same length. an empty gradient set packs to an
/// empty buffer.
pub fn pack_gradients(gradients: &[Vec<f64>]) -> Result<Vec<f64>> {
    let Some(first_row) = gradients.first() else {
        return Ok(Vec::new());
    };

    let inner = first_row.len();
    if let Some((idx, row)) = gradients.iter().enumerate().find(|(_, r)| r.len() != inner) {
        return Err(Error::Encode(format!(
            "ragged gradients: row {} has {} entries, row 0 has {}",
            idx,
            row.len(),
            inner
        )));
    }

    let mut buffer = Vec::with_capacity(2 + gradients.len() * inner);
    buffer.push(gradients.len() as f64);
    buffer.push(inner as f64);
    for row in gradients {
        buffer.extend_from_slice(row);
    }
    Ok(buffer)
}

/// borrowed row-major view over a packed gradients buffer.
#[derive(Debug, Clone, Copy)]
pub struct GradientRows<'a> {
    values: &'a [f64],
    outer: usize,
    inner: usize,
}

impl<'a> GradientRows<'a> {
    pub fn empty() -> Self {
        Self {
            values: &[],
            outer: 0,
            inner: 0,
        }
    }

    /// number of rows (circuit parameters).
    pub fn len(&self) -> usize {
        self.outer
    }

    pub fn is_empty(&self) -> bool {
        self.outer == 0
    }

    /// entries per row (output bitstrings).
    pub fn row_len(&self) -> usize {
        self.inner
    }

    pub fn row(&self, idx: usize) -> Option<&'a [f64]> {
        if idx >= self.outer {
            return None;
        }
        let values = self.values;
        Some(&values[idx * self.inner..(idx + 1) * self.inner])
    }

    // rows in order. calling this again restarts from the first row.
    pub fn iter(&self) -> impl Iterator<Item = &'a [f64]> + 'a {
        let Self {
            values,
            outer,
            inner,
        } = *self;
        (0..outer).map(move |i| &values[i * inner..(i + 1) * inner])
    }

    pub fn to_vec(&self) -> Vec<Vec<f64>> {
        self.iter().map(|row| row.to_vec()).collect()
    }
}

// reads one header slot, which must hold a non-negative integral value.
fn header_slot(value: f64, name: &str) -> Result<usize> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > usize::MAX as f64 {
        return Err(Error::Decode(format!(
            "gradient {} header slot holds {}, expected a non-negative integer",
            name, value
        )));
    }
    Ok(value as usize)
}

/// views a packed gradients buffer as rows.
///
/// buffers shorter than the two element header yield an empty view.
pub fn unpack_gradients(buffer: &[f64]) -> Result<GradientRows<'_>> {
    if buffer.len() < 2 {
        return Ok(GradientRows::empty());
    }

    let outer = header_slot(buffer[0], "outer size")?;
    let inner = header_slot(buffer[1], "inner size")?;
    let values = &buffer[2..];

    let expected = outer.checked_mul(inner).ok_or_else(|| {
        Error::Decode(format!("gradient shape {}x{} overflows", outer, inner))
    })?;
    if values.len() != expected {
        return Err(Error::Decode(format!(
            "gradient buffer holds {} values, header declares {}x{}",
            values.len(),
            outer,
            inner
        )));
    }

    Ok(GradientRows {
        values,
        outer,
        inner,
    })
}
