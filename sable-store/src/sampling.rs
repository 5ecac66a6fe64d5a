//! Optional per-database keyspace samplers.

use sable_common::containers::HotMap;

/// Frequency sampler recording keys read or written at least `min_freq` times.
#[derive(Debug)]
pub struct TopKeys {
    min_freq: u64,
    counts: HotMap<Vec<u8>, u64>,
}

impl TopKeys {
    /// Creates a sampler with the given reporting threshold.
    #[must_use]
    pub fn new(min_freq: u64) -> Self {
        Self {
            min_freq: min_freq.max(1),
            counts: HotMap::new(),
        }
    }

    /// Records one access.
    pub fn touch(&mut self, key: &[u8]) {
        match self.counts.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                let _ = self.counts.insert(key.to_vec(), 1);
            }
        }
    }

    /// Keys whose access count reached the threshold, with their counts.
    #[must_use]
    pub fn top_keys(&self) -> Vec<(Vec<u8>, u64)> {
        let mut result: Vec<(Vec<u8>, u64)> = self
            .counts
            .iter()
            .filter(|&(_, &count)| count >= self.min_freq)
            .map(|(key, &count)| (key.clone(), count))
            .collect();
        result.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));
        result
    }
}

const HLL_REGISTERS: usize = 1 << 14;
const HLL_INDEX_BITS: u32 = 14;

/// Dense HyperLogLog over key fingerprints, used for keyspace cardinality sampling.
#[derive(Debug)]
pub struct DenseHll {
    registers: Vec<u8>,
}

impl Default for DenseHll {
    fn default() -> Self {
        Self::new()
    }
}

impl DenseHll {
    /// Creates an empty sketch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registers: vec![0; HLL_REGISTERS],
        }
    }

    /// Records one fingerprint.
    pub fn add(&mut self, hash: u64) {
        let index = (hash & (HLL_REGISTERS as u64 - 1)) as usize;
        let remainder = hash >> HLL_INDEX_BITS;
        // Rank: position of the first set bit in the remaining 50 bits, 1-based.
        let rank = (remainder.trailing_zeros().min(64 - HLL_INDEX_BITS) + 1) as u8;
        if self.registers[index] < rank {
            self.registers[index] = rank;
        }
    }

    /// Bias-corrected cardinality estimate.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&rank| 2_f64.powi(-i32::from(rank)))
            .sum();
        let mut estimate = alpha * m * m / sum;

        let zeros = self.registers.iter().filter(|&&rank| rank == 0).count();
        if estimate <= 2.5 * m && zeros > 0 {
            estimate = m * (m / zeros as f64).ln();
        }
        estimate.round() as u64
    }
}
