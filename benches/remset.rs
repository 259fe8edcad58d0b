//! Benchmarks for remembered set recording and the young sampling walk.

use std::hint::black_box;
use std::sync::Arc;

use criterion::Criterion;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use regiongc::policy::region::RegionSpace;
use regiongc::util::alloc::AllocKind;
use regiongc::util::constants::BYTES_IN_WORD;
use regiongc::util::options::{HumanSize, Options};
use regiongc::util::test_util::TEST_HEAP_START;
use regiongc::util::Address;
use regiongc::vm::NopBinding;

const REGION_BYTES: usize = 1 << 20;
const REGION_WORDS: usize = REGION_BYTES / BYTES_IN_WORD;

fn make_space(regions: usize) -> RegionSpace<NopBinding> {
    let options = Arc::new(Options {
        region_size: HumanSize(REGION_BYTES),
        sparse_initial_capacity: 16,
        verify_region_lists: false,
    });
    RegionSpace::new("bench", TEST_HEAP_START, regions * REGION_BYTES, options)
}

pub fn bench(c: &mut Criterion) {
    c.bench_function("remset_record", |b| {
        let space = make_space(128);
        let mut rng = ChaCha8Rng::seed_from_u64(0xca4d);
        // Write barrier style traffic: endless repeats of a bounded set of
        // (source card, destination) pairs, so the steady state is lookup
        // dominated with the occasional fresh card.
        let pairs: Vec<(Address, Address)> = (0..4096)
            .map(|_| {
                let src = TEST_HEAP_START
                    + rng.random_range(0..128usize) * REGION_BYTES
                    + rng.random_range(0..2048usize) * 512;
                let dst = TEST_HEAP_START + rng.random_range(0..128usize) * REGION_BYTES;
                (src, dst)
            })
            .collect();
        let mut i = 0;
        b.iter(|| {
            let (src, dst) = pairs[i & (pairs.len() - 1)];
            i += 1;
            black_box(space.record_cross_region_reference(src, dst));
        })
    });

    c.bench_function("young_rs_sampling", |b| {
        let space = make_space(64);
        space.init_allocator(AllocKind::Mutator);
        // Thirty two young regions, each with a populated remembered set.
        let obj_words = REGION_WORDS / 2 - 64;
        for _ in 0..64 {
            space.allocate(AllocKind::Mutator, obj_words).unwrap();
        }
        let mut rng = ChaCha8Rng::seed_from_u64(0x5a3e);
        for _ in 0..2048 {
            let dst = TEST_HEAP_START + rng.random_range(0..32usize) * REGION_BYTES;
            let src = TEST_HEAP_START
                + rng.random_range(32..64usize) * REGION_BYTES
                + rng.random_range(0..2048usize) * 512;
            space.record_cross_region_reference(src, dst);
        }

        b.iter(|| {
            space.young_rs_sampling_init();
            while space.young_rs_sampling_more() {
                space.young_rs_sampling_next();
            }
            black_box(space.sampled_young_rs_lengths());
        })
    });
}
