use bit_vec::BitVec;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// A Bloom filter over a chunk's keyset; most lookups that would miss
/// the chunk skip its btree entirely.
pub struct Bloom {
    bits: BitVec,
    n_bits: u64,
    n_hashes: u32,
}

impl Bloom {
    pub fn new(expected_items: u64, bits_per_item: u64, n_hashes: u32) -> Self {
        let n_bits = (expected_items.max(1) * bits_per_item.max(2)).max(64);
        Self {
            bits: BitVec::from_elem(n_bits as usize, false),
            n_bits,
            n_hashes: n_hashes.max(1),
        }
    }

    fn bit_for(&self, key: &[u8], seed: u32) -> usize {
        (xxh3_64_with_seed(key, seed as u64) % self.n_bits) as usize
    }

    pub fn insert(&mut self, key: &[u8]) {
        for seed in 0..self.n_hashes {
            let bit = self.bit_for(key, seed);
            self.bits.set(bit, true);
        }
    }

    /// False means definitely absent; true means possibly present.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        (0..self.n_hashes).all(|seed| self.bits.get(self.bit_for(key, seed)).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = Bloom::new(1000, 10, 4);
        for i in 0..1000u32 {
            bloom.insert(format!("key{}", i).as_bytes());
        }
        for i in 0..1000u32 {
            assert!(bloom.maybe_contains(format!("key{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_mostly_true_negatives() {
        let mut bloom = Bloom::new(1000, 10, 4);
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let key: u64 = rng.gen_range(0, 1_000_000);
            bloom.insert(&key.to_be_bytes());
        }

        let mut false_positives = 0;
        for probe in 2_000_000u64..2_010_000 {
            if bloom.maybe_contains(&probe.to_be_bytes()) {
                false_positives += 1;
            }
        }
        // with 10 bits/key and 4 hashes the false positive rate is
        // around 1%; 5% gives plenty of slack
        assert!(false_positives < 500, "{} false positives", false_positives);
    }
}
