//! Sliced bloom filter, built by `BloomCreate` and shipped once to every
//! connected `SQLTableScanBloomUse` consumer, which serializes it into a
//! SQL predicate the remote scan backend can evaluate.
//!
//! k independent bit-slices of m bits each: k = ceil(log2(1/p)), m =
//! ceil(n * |ln p| / (k * ln(2)^2)) for a target capacity n and
//! false-positive rate p. Each slice gets its own hash seed so a value's
//! k slice-indices are independent.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Fixed so that two filters built from the same (capacity, fp_rate)
/// pair are bit-for-bit identical, which `best_achievable_fp_rate`
/// relies on when it measures candidate filters.
const SEED_RNG_SEED: u64 = 0x5343_414e_464c_4f57;

#[derive(Debug, Clone)]
pub struct SlicedBloomFilter {
    capacity: usize,
    fp_rate: f64,
    num_slices: usize,
    bits_per_slice: usize,
    seeds: Vec<u64>,
    slices: Vec<Vec<u64>>,
    bits_set: usize,
}

fn bloom_params(capacity: usize, fp_rate: f64) -> (usize, usize) {
    let capacity = capacity.max(1) as f64;
    let k = (1.0 / fp_rate).log2().ceil().max(1.0) as usize;
    let ln2 = std::f64::consts::LN_2;
    let m = (capacity * fp_rate.ln().abs() / (k as f64 * ln2 * ln2)).ceil().max(1.0) as usize;
    (k, m)
}

fn words_for_bits(bits: usize) -> usize {
    (bits + 63) / 64
}

fn hash_with_seed(seed: u64, value: i64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

impl SlicedBloomFilter {
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let (k, m) = bloom_params(capacity, fp_rate);
        let mut rng = StdRng::seed_from_u64(SEED_RNG_SEED);
        let seeds = (0..k).map(|_| rng.gen::<u64>()).collect();
        Self {
            capacity,
            fp_rate,
            num_slices: k,
            bits_per_slice: m,
            seeds,
            slices: vec![vec![0u64; words_for_bits(m)]; k],
            bits_set: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fp_rate(&self) -> f64 {
        self.fp_rate
    }

    pub fn num_slices(&self) -> usize {
        self.num_slices
    }

    pub fn bits_per_slice(&self) -> usize {
        self.bits_per_slice
    }

    /// Number of bits set across all slices, i.e. how many (slice,
    /// value) insertions actually flipped a fresh bit. Recorded as the
    /// `bloom_filter_num_bits_set` metric.
    pub fn len(&self) -> usize {
        self.bits_set
    }

    pub fn is_empty(&self) -> bool {
        self.bits_set == 0
    }

    pub fn add(&mut self, value: i64) {
        for slice in 0..self.num_slices {
            let bit = (hash_with_seed(self.seeds[slice], value) as usize) % self.bits_per_slice;
            let word = bit / 64;
            let mask = 1u64 << (bit % 64);
            if self.slices[slice][word] & mask == 0 {
                self.slices[slice][word] |= mask;
                self.bits_set += 1;
            }
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        (0..self.num_slices).all(|slice| {
            let bit = (hash_with_seed(self.seeds[slice], value) as usize) % self.bits_per_slice;
            let word = bit / 64;
            let mask = 1u64 << (bit % 64);
            self.slices[slice][word] & mask != 0
        })
    }

    fn set_bit_positions(&self, slice: usize) -> Vec<usize> {
        let mut out = Vec::new();
        for (word_idx, word) in self.slices[slice].iter().enumerate() {
            let mut w = *word;
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                out.push(word_idx * 64 + bit);
                w &= w - 1;
            }
        }
        out
    }

    /// Serializes the filter as a conjunction of per-slice disjunctions:
    /// `(bloom_hash(col, seed_0) IN (b0, b1, ...)) AND (bloom_hash(col, seed_1) IN (...)) AND ...`
    /// so the remote backend can evaluate membership without ever
    /// seeing the actual filter bits, only the set positions.
    pub fn to_sql_predicate(&self, column_expr: &str) -> String {
        let clauses: Vec<String> = (0..self.num_slices)
            .map(|slice| {
                let positions = self.set_bit_positions(slice);
                let list = positions
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    "(bloom_hash({column_expr}, {seed}) IN ({list}))",
                    seed = self.seeds[slice]
                )
            })
            .collect();
        clauses.join(" AND ")
    }

    /// Conservative estimate of `to_sql_predicate`'s length for a filter
    /// that has been filled to `capacity`, without needing to actually
    /// build one. Used by `best_achievable_fp_rate`'s search. Assumes at
    /// most `min(capacity, bits_per_slice)` distinct bits set per slice
    /// and that every position takes as many digits as the largest
    /// possible index - both upper bounds, so the estimate never
    /// undershoots the real predicate length.
    fn estimate_predicate_len(capacity: usize, num_slices: usize, bits_per_slice: usize, seed_digits: usize, column_expr_len: usize) -> usize {
        let max_positions_per_slice = capacity.min(bits_per_slice).max(1);
        let digit_width = bits_per_slice.saturating_sub(1).max(1).to_string().len();
        let per_slice_overhead = "(bloom_hash(, ) IN ())".len() + column_expr_len + seed_digits;
        let per_slice_list = max_positions_per_slice * (digit_width + 1); // +1 for comma
        let per_slice = per_slice_overhead + per_slice_list;
        num_slices * per_slice + (num_slices.saturating_sub(1) * " AND ".len())
    }

    /// Binary searches for the smallest false-positive rate whose
    /// serialized predicate still fits within `budget_bytes` for a
    /// filter sized for `capacity` elements. If the configured rate a
    /// caller wants is smaller (stricter) than this, it must be raised
    /// to this value or the predicate won't fit the remote backend's
    /// expression-length limit.
    pub fn best_achievable_fp_rate(capacity: usize, budget_bytes: usize, column_expr: &str) -> f64 {
        let mut lo = 1e-6_f64;
        let mut hi = 0.99_f64;
        for _ in 0..60 {
            let mid = (lo + hi) / 2.0;
            let (k, m) = bloom_params(capacity, mid);
            let seed_digits = 20; // u64 max width, upper bound
            let len = Self::estimate_predicate_len(capacity, k, m, seed_digits, column_expr.len());
            if len <= budget_bytes {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains_is_always_true() {
        let mut f = SlicedBloomFilter::new(1000, 0.05);
        for v in 0..1000i64 {
            f.add(v);
        }
        for v in 0..1000i64 {
            assert!(f.contains(v), "value {v} should be present");
        }
    }

    #[test]
    fn sizing_matches_formula() {
        let (k, m) = bloom_params(10_000, 0.01);
        assert_eq!(k, (1.0f64 / 0.01).log2().ceil() as usize);
        assert!(m > 0);
    }

    #[test]
    fn best_fp_rate_is_monotonic_with_budget() {
        let loose = SlicedBloomFilter::best_achievable_fp_rate(10_000, 4096, "col");
        let tight = SlicedBloomFilter::best_achievable_fp_rate(10_000, 512, "col");
        assert!(tight >= loose, "a smaller budget should never demand a smaller (stricter) fp rate");
    }

    #[test]
    fn predicate_is_a_conjunction_of_one_clause_per_slice() {
        let mut f = SlicedBloomFilter::new(10, 0.1);
        f.add(1);
        f.add(2);
        let sql = f.to_sql_predicate("user_id");
        assert_eq!(sql.matches(" AND ").count() + 1, f.num_slices());
        assert!(sql.contains("bloom_hash(user_id"));
    }
}
