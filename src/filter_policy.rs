/*!
Filter policies build small summaries of the keys in a table file that are
consulted on reads to skip disk seeks for keys that are definitely absent.

stratadb ships a Bloom-filter-based policy that is adequate for most
situations. A policy's name is stored in table files next to its filter
data, so the serialized form of a policy must never change without also
changing its name.
*/

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::SIZE_OF_U64_BYTES;
use crate::utils::bytes::hash;

/// Seed for the hash function feeding the Bloom filter probes.
const BLOOM_HASH_SEED: u32 = 0xbc9f_1d34;

/// Trait to be implemented by filter generating structures.
pub trait FilterPolicy: Debug + Send + Sync {
    /**
    The name of the filter policy.

    The name is recorded in table files alongside filter data. If the
    serialization produced by [`FilterPolicy::create_filter`] changes in an
    incompatible way, the name returned by this method must change with it.
    */
    fn name(&self) -> &'static str;

    /**
    Create a filter summarizing the provided keys (duplicates allowed).

    Returns the serialized filter, suitable for writing to a file.
    */
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /**
    Report whether `key` may be present in the set `serialized_filter` was
    built from.

    # Invariants

    1. Must return true if `key` was in the list of keys used to create the
       filter.
    1. May return true or false for keys not on that list, but should aim
       for false with high probability.
    */
    fn key_may_match(&self, key: &[u8], serialized_filter: &[u8]) -> bool;
}

/**
A Bloom filter based filter policy.

The filter uses double hashing: a single base hash and a rotated delta
simulate the `k` probe functions, a scheme this format lineage adopted from
Kirsch and Mitzenmacher's composition result.

# Serialization

The filter is a bit array of `max(n * bits_per_key, 64)` bits rounded up to
a whole number of bytes, followed by one trailing byte holding the probe
count `k`.
*/
#[derive(Debug)]
pub struct BloomFilterPolicy {
    /**
    The number of filter bits allocated per key.

    Ten bits per key yields a filter with a roughly 1% false positive rate.
    */
    bits_per_key: usize,

    /// The number of hash probes per key, `round(bits_per_key * ln 2)` clamped to `[1, 30]`.
    num_probes: usize,
}

/// Public methods
impl BloomFilterPolicy {
    /// Create a new instance of [`BloomFilterPolicy`].
    pub fn new(bits_per_key: usize) -> Self {
        // ln(2) is approximately 0.69.
        let num_probes = ((bits_per_key as f64) * 0.69).round() as usize;
        let num_probes = num_probes.clamp(1, 30);

        Self {
            bits_per_key,
            num_probes,
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "stratadb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        // Compute the bloom filter size and round up to a whole byte count.
        // Small filter sizes see enormous false positive rates, so enforce
        // a floor of 64 bits.
        let mut filter_size_bits = keys.len() * self.bits_per_key;
        if filter_size_bits < 64 {
            filter_size_bits = 64;
        }
        let filter_size_bytes = (filter_size_bits + 7) / 8;
        let filter_size_bits = filter_size_bytes * 8;

        let mut filter = vec![0u8; filter_size_bytes];
        for key in keys {
            // Double hashing generates the probe sequence: repeatedly add a
            // rotated copy of the base hash.
            let mut h = hash(key, BLOOM_HASH_SEED);
            let delta = (h >> 17) | (h << 15);
            for _ in 0..self.num_probes {
                let bit_position = (h as usize) % filter_size_bits;
                filter[bit_position / 8] |= 1 << (bit_position % 8);
                h = h.wrapping_add(delta);
            }
        }

        // Remember the probe count so readers built with a different
        // bits-per-key setting still probe correctly.
        filter.push(self.num_probes as u8);
        filter
    }

    fn key_may_match(&self, key: &[u8], serialized_filter: &[u8]) -> bool {
        if serialized_filter.len() < 2 {
            // An empty filter matches nothing.
            return false;
        }

        let filter_size_bits = (serialized_filter.len() - 1) * 8;
        let num_probes = serialized_filter[serialized_filter.len() - 1] as usize;
        if num_probes > 30 {
            // Reserved for future encodings; treat as a match to stay safe.
            return true;
        }

        let mut h = hash(key, BLOOM_HASH_SEED);
        let delta = (h >> 17) | (h << 15);
        for _ in 0..num_probes {
            let bit_position = (h as usize) % filter_size_bits;
            if serialized_filter[bit_position / 8] & (1 << (bit_position % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }

        true
    }
}

/**
Adapts a user-key filter policy to the internal keys stored in table files.

Table files index internal keys, but filters are much more useful over user
keys: a lookup probes with a fresh sequence number that would never match
an internal-key filter. This wrapper strips the tag before delegating.
*/
#[derive(Debug)]
pub(crate) struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

/// Crate-only methods
impl InternalFilterPolicy {
    pub(crate) fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        Self { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let user_keys: Vec<Vec<u8>> = keys
            .iter()
            .map(|internal_key| internal_key[..internal_key.len() - SIZE_OF_U64_BYTES].to_vec())
            .collect();

        self.user_policy.create_filter(&user_keys)
    }

    fn key_may_match(&self, key: &[u8], serialized_filter: &[u8]) -> bool {
        self.user_policy
            .key_may_match(&key[..key.len() - SIZE_OF_U64_BYTES], serialized_filter)
    }
}

#[cfg(test)]
mod tests {
    use integer_encoding::FixedInt;
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_key(i: u32) -> Vec<u8> {
        u32::encode_fixed_vec(i)
    }

    #[test]
    fn an_empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::new(10);
        assert!(!policy.key_may_match(b"hello", &[]));
        let empty_set_filter = policy.create_filter(&[]);
        assert!(!policy.key_may_match(b"hello", &empty_set_filter));
        assert!(!policy.key_may_match(b"world", &empty_set_filter));
    }

    #[test]
    fn small_filters_match_their_keys() {
        let policy = BloomFilterPolicy::new(10);
        let filter = policy.create_filter(&[b"hello".to_vec(), b"world".to_vec()]);

        assert!(policy.key_may_match(b"hello", &filter));
        assert!(policy.key_may_match(b"world", &filter));
        assert!(!policy.key_may_match(b"x", &filter));
        assert!(!policy.key_may_match(b"foo", &filter));
    }

    #[test]
    fn filters_stay_within_their_size_budget() {
        let policy = BloomFilterPolicy::new(10);

        let mut length = 1;
        while length <= 10_000 {
            let keys: Vec<Vec<u8>> = (0..length).map(test_key).collect();
            let filter = policy.create_filter(&keys);
            assert!(
                filter.len() <= ((length as usize) * 10 / 8) + 40,
                "Filter for {length} keys is larger than the budget allows."
            );
            length = if length < 10 { length + 1 } else { length * 10 };
        }
    }

    #[test]
    fn every_inserted_key_matches_and_false_positives_stay_rare() {
        let policy = BloomFilterPolicy::new(10);
        let mut mediocre_filters = 0;
        let mut good_filters = 0;

        let mut length = 1;
        while length <= 10_000 {
            let keys: Vec<Vec<u8>> = (0..length).map(test_key).collect();
            let filter = policy.create_filter(&keys);

            for i in 0..length {
                assert!(
                    policy.key_may_match(&test_key(i), &filter),
                    "Key {i} must match a filter it was inserted into (length {length})."
                );
            }

            // Probe keys that were never inserted and measure the false
            // positive rate.
            let mut hits = 0;
            for i in 0..10_000u32 {
                if policy.key_may_match(&test_key(i + 1_000_000_000), &filter) {
                    hits += 1;
                }
            }
            let rate = (hits as f64) / 10_000.0;
            assert!(
                rate <= 0.02,
                "False positive rate {rate} is over 2% at length {length}."
            );
            if rate > 0.0125 {
                mediocre_filters += 1;
            } else {
                good_filters += 1;
            }

            length = if length < 10 { length + 1 } else { length * 10 };
        }

        assert!(
            mediocre_filters <= good_filters / 5,
            "Allowed a small fraction of filters in the (1.25%, 2%] band, found \
            {mediocre_filters} mediocre vs {good_filters} good."
        );
    }

    #[test]
    fn the_probe_count_is_clamped() {
        // bits_per_key of 1 would compute k = 0.69 -> clamp to 1.
        let sparse = BloomFilterPolicy::new(1);
        let filter = sparse.create_filter(&[b"a".to_vec()]);
        assert_eq!(*filter.last().unwrap(), 1);

        // bits_per_key of 100 would compute k = 69 -> clamp to 30.
        let dense = BloomFilterPolicy::new(100);
        let filter = dense.create_filter(&[b"a".to_vec()]);
        assert_eq!(*filter.last().unwrap(), 30);
    }
}
