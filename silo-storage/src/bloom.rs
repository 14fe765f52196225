//! Bloom filter for file chunk key membership.
//!
//! Sized for roughly 10% false positives: `0.599066 × numKeys` bytes,
//! rounded up to the next power-of-two KiB and capped at 256 KiB. Uses
//! keyed SipHash double hashing, so no per-key allocations.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Bytes-per-key factor for ~10% false positive probability.
const BYTES_PER_KEY: f64 = 0.599066;

const MAX_BLOOM_BYTES: usize = 256 * 1024;

const NUM_HASHES: u32 = 3;

#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
}

/// Recommended filter size in bytes for `num_keys` keys.
pub fn recommend_num_bytes(num_keys: usize) -> usize {
    let m = (num_keys as f64 * BYTES_PER_KEY).ceil() as usize;
    let m = m.max(1);

    // smallest 2^i KiB that holds m, capped
    let mut k = 1024;
    while k < m && k < MAX_BLOOM_BYTES {
        k *= 2;
    }
    k.min(MAX_BLOOM_BYTES)
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let mut h1 = SipHasher13::new_with_keys(0x5173_0db5_170d_b517, 0);
    h1.write(key);
    let mut h2 = SipHasher13::new_with_keys(0x9e37_79b9_7f4a_7c15, 1);
    h2.write(key);
    (h1.finish(), h2.finish())
}

impl BloomFilter {
    /// Create an empty filter sized for `num_keys` keys.
    pub fn with_num_keys(num_keys: usize) -> Self {
        Self {
            bits: vec![0u8; recommend_num_bytes(num_keys)],
        }
    }

    /// Reconstruct a filter from its bit array (page load path).
    pub fn from_bytes(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn num_bytes(&self) -> usize {
        self.bits.len()
    }

    pub fn add(&mut self, key: &[u8]) {
        let num_bits = (self.bits.len() * 8) as u64;
        let (h1, h2) = hash_pair(key);
        for i in 0..NUM_HASHES as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Membership test; false positives possible, false negatives not.
    pub fn check(&self, key: &[u8]) -> bool {
        let num_bits = (self.bits.len() * 8) as u64;
        let (h1, h2) = hash_pair(key);
        for i in 0..NUM_HASHES as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing() {
        assert_eq!(recommend_num_bytes(1), 1024);
        assert_eq!(recommend_num_bytes(1000), 1024);
        // 10_000 keys -> 5_991 bytes -> 8 KiB
        assert_eq!(recommend_num_bytes(10_000), 8 * 1024);
        // cap
        assert_eq!(recommend_num_bytes(100_000_000), MAX_BLOOM_BYTES);
    }

    #[test]
    fn no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..5_000u32)
            .map(|i| format!("key-{:08}", i).into_bytes())
            .collect();

        let mut bloom = BloomFilter::with_num_keys(keys.len());
        for key in &keys {
            bloom.add(key);
        }
        for key in &keys {
            assert!(bloom.check(key));
        }
    }

    #[test]
    fn false_positive_rate_within_bound() {
        let mut bloom = BloomFilter::with_num_keys(10_000);
        for i in 0..10_000u32 {
            bloom.add(format!("present-{:08}", i).as_bytes());
        }

        let mut false_positives = 0;
        let probes = 20_000u32;
        for i in 0..probes {
            if bloom.check(format!("absent-{:08}", i).as_bytes()) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / probes as f64;
        assert!(rate <= 0.12, "false positive rate {} too high", rate);
    }

    #[test]
    fn roundtrip_bytes() {
        let mut bloom = BloomFilter::with_num_keys(100);
        bloom.add(b"alpha");
        bloom.add(b"beta");

        let restored = BloomFilter::from_bytes(bloom.as_bytes().to_vec());
        assert!(restored.check(b"alpha"));
        assert!(restored.check(b"beta"));
    }
}
