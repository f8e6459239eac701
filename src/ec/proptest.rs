//! Property-Based Tests for the block codec
//!
//! 1. **Any k of n**: a block decodes from any k surviving shards, for every
//!    supported RAID 6 layout.
//! 2. **Too many erasures**: losing m+1 shards always fails.
//! 3. **Shard names**: every generated shard name parses back to itself.

#![cfg(test)]

use proptest::prelude::*;

use super::encoder::{EcDecoder, EcEncoder};
use super::shard::{parse_shard_name, shard_file_name};

/// The three supported RAID 6 layouts
fn layout_strategy() -> impl Strategy<Value = (usize, usize)> {
    prop_oneof![Just((2usize, 1usize)), Just((4, 2)), Just((8, 4))]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_k_shards_decode(
        (k, m) in layout_strategy(),
        data in prop::collection::vec(any::<u8>(), 0..2048),
        seed in any::<u64>(),
    ) {
        let encoder = EcEncoder::new(k, m)?;
        let decoder = EcDecoder::new(k, m)?;
        let mut shards: Vec<Option<Vec<u8>>> =
            encoder.encode(&data)?.into_iter().map(Some).collect();

        // drop m shards picked from the seed
        let total = k + m;
        let mut dropped = 0;
        let mut i = (seed % total as u64) as usize;
        while dropped < m {
            if shards[i].is_some() {
                shards[i] = None;
                dropped += 1;
            }
            i = (i + 1 + (seed as usize % 3)) % total;
        }

        let recovered = decoder.decode(&mut shards, data.len(), 0)?;
        prop_assert_eq!(recovered, data);
    }

    #[test]
    fn prop_too_many_erasures_fail(
        (k, m) in layout_strategy(),
        data in prop::collection::vec(any::<u8>(), 1..512),
    ) {
        let encoder = EcEncoder::new(k, m)?;
        let decoder = EcDecoder::new(k, m)?;
        let mut shards: Vec<Option<Vec<u8>>> =
            encoder.encode(&data)?.into_iter().map(Some).collect();
        for shard in shards.iter_mut().take(m + 1) {
            *shard = None;
        }
        prop_assert!(decoder.decode(&mut shards, data.len(), 0).is_err());
    }

    #[test]
    fn prop_shard_names_parse(
        object in "[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,20}",
        chunk in 0u32..10_000,
        block in 0usize..12,
    ) {
        let name = shard_file_name(&object, chunk, block);
        let parsed = parse_shard_name(&object, &name);
        prop_assert!(parsed.is_some());
        let parsed = parsed.unwrap();
        prop_assert_eq!((parsed.chunk, parsed.block, parsed.version), (chunk, block, None));
    }
}
