//! End to end scenarios driving the public API the way an embedder would,
//! across mutator phases and the pause operations between them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use regiongc::policy::region::{AddCardResult, RegionSpace, CARDS_PER_ENTRY};
use regiongc::util::alloc::AllocKind;
use regiongc::util::constants::BYTES_IN_WORD;
use regiongc::util::options::{HumanSize, Options};
use regiongc::util::test_util::TEST_HEAP_START;
use regiongc::util::Address;
use regiongc::vm::{AgePolicy, NopBinding, ObjectFiller, RegionBinding};

const REGION_BYTES: usize = 1 << 20;
const REGION_WORDS: usize = REGION_BYTES / BYTES_IN_WORD;

fn make_space<B: RegionBinding>(regions: usize) -> RegionSpace<B> {
    let options = Arc::new(Options {
        region_size: HumanSize(REGION_BYTES),
        sparse_initial_capacity: 4,
        verify_region_lists: true,
    });
    RegionSpace::new("it", TEST_HEAP_START, regions * REGION_BYTES, options)
}

/// Asserts that no two allocations overlap and that all lie in the space.
fn check_disjoint<B: RegionBinding>(space: &RegionSpace<B>, spans: &mut Vec<(Address, usize)>) {
    spans.sort_by_key(|&(addr, _)| addr);
    for pair in spans.windows(2) {
        let (addr, words) = pair[0];
        assert!(
            addr + words * BYTES_IN_WORD <= pair[1].0,
            "allocations overlap: {:?}+{} and {:?}",
            addr,
            words * BYTES_IN_WORD,
            pair[1].0
        );
    }
    for &(addr, _) in spans.iter() {
        assert!(space.address_in_space(addr));
    }
}

#[test]
fn mutator_pause_cycles_reuse_regions() {
    let mut space = make_space::<NopBinding>(8);
    let fill = |space: &RegionSpace<NopBinding>| {
        let mut spans = Vec::new();
        for _ in 0..40 {
            for &words in &[64usize, 512, 3000, 8192] {
                let addr = space.allocate(AllocKind::Mutator, words).unwrap();
                spans.push((addr, words));
            }
        }
        spans
    };

    space.init_allocator(AllocKind::Mutator);
    let mut spans = fill(&space);
    check_disjoint(&space, &mut spans);
    let (eden, _) = space.young_lengths();
    assert!(eden >= 4);
    let committed = space.committed_regions();
    assert_eq!(committed, eden);
    assert!(space.verify_region_lists());

    // Pause: drop the allocators, evacuate nothing, rebuild the lists.
    space.release_allocator(AllocKind::Mutator);
    space.cleanup_sparse_tables();
    space.reset_young_lists();
    assert_eq!(space.used_bytes(), 0);
    assert_eq!(space.young_lengths(), (0, 0));
    assert_eq!(space.committed_regions(), committed);

    // The second mutator phase replays the first without committing
    // anything new.
    space.init_allocator(AllocKind::Mutator);
    let mut spans = fill(&space);
    check_disjoint(&space, &mut spans);
    assert_eq!(space.committed_regions(), committed);

    // A final pause followed by an unbounded shrink gives everything back.
    space.release_allocator(AllocKind::Mutator);
    space.reset_young_lists();
    assert_eq!(space.shrink(usize::MAX), committed);
    assert_eq!(space.committed_regions(), 0);
}

#[test]
fn parallel_mutators_get_disjoint_memory() {
    const THREADS: usize = 4;
    const ALLOCS_PER_THREAD: usize = 200;
    const SIZES: &[usize] = &[16, 64, 256, 1024, 4096, 16000];

    let space = make_space::<NopBinding>(32);
    space.init_allocator(AllocKind::Mutator);

    let mut spans: Vec<(Address, usize)> = Vec::new();
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let space = &space;
            handles.push(scope.spawn(move || {
                let mut mine = Vec::with_capacity(ALLOCS_PER_THREAD);
                for i in 0..ALLOCS_PER_THREAD {
                    let words = SIZES[(i + t) % SIZES.len()];
                    let addr = space.allocate(AllocKind::Mutator, words).unwrap();
                    mine.push((addr, words));
                }
                mine
            }));
        }
        for handle in handles {
            spans.extend(handle.join().unwrap());
        }
    });

    assert_eq!(spans.len(), THREADS * ALLOCS_PER_THREAD);
    check_disjoint(&space, &mut spans);

    // Everything handed out is accounted for, padding included.
    let payload: usize = spans.iter().map(|&(_, w)| w * BYTES_IN_WORD).sum();
    assert!(space.used_bytes() >= payload);
    assert!(space.used_bytes() <= space.committed_regions() * REGION_BYTES);
    let (eden, _) = space.young_lengths();
    assert_eq!(eden, space.committed_regions());
    assert!(space.verify_region_lists());
}

#[test]
fn humongous_objects_coexist_with_normal_allocation() {
    let mut space = make_space::<NopBinding>(16);
    space.init_allocator(AllocKind::Mutator);

    space.allocate(AllocKind::Mutator, 128).unwrap();
    let words = 3 * REGION_WORDS;
    let obj = space.allocate(AllocKind::Mutator, words).unwrap();
    space.allocate(AllocKind::Mutator, 128).unwrap();

    let first = space.region_index_of(obj);
    assert!(space.region(first).is_starts_humongous());
    assert_eq!(
        space.humongous_obj_size_in_regions(words),
        3,
        "three whole regions back a three region object"
    );

    let used_before = space.used_bytes();
    assert_eq!(space.free_humongous_object(first), 3);
    assert_eq!(used_before - space.used_bytes(), words * BYTES_IN_WORD);

    // The freed span is recycled before any new region is committed.
    let committed = space.committed_regions();
    for _ in 0..4 {
        space.allocate(AllocKind::Mutator, REGION_WORDS / 2 - 64).unwrap();
    }
    assert_eq!(space.committed_regions(), committed);
    assert!(space.verify_region_lists());
}

#[test]
fn remembered_sets_survive_growth_and_cleanup() {
    let mut space = make_space::<NopBinding>(16);
    space.init_allocator(AllocKind::Mutator);
    let dst = space.allocate(AllocKind::Mutator, 64).unwrap();

    // One card each from twelve regions grows the table past its initial
    // capacity more than once.
    for i in 1..=12u32 {
        let src = TEST_HEAP_START + i as usize * REGION_BYTES;
        assert_eq!(
            space.record_cross_region_reference(src, dst),
            AddCardResult::Added
        );
    }
    // A thirteenth region fills one entry to the brim and overflows it.
    let noisy = TEST_HEAP_START + 13 * REGION_BYTES;
    for card in 0..CARDS_PER_ENTRY {
        let src = noisy + card * 512;
        assert_eq!(
            space.record_cross_region_reference(src, dst),
            AddCardResult::Added
        );
    }
    assert_eq!(
        space.record_cross_region_reference(noisy + CARDS_PER_ENTRY * 512, dst),
        AddCardResult::Overflow
    );

    space.cleanup_sparse_tables();
    assert_eq!(space.sparse_table_stats(), (13, 12 + CARDS_PER_ENTRY));
    let dst_region = space.region_index_of(dst);
    let rs = space.region(dst_region).rem_set();
    let mut seen = 0;
    rs.iterate(|_, _| seen += 1);
    assert_eq!(seen, 12 + CARDS_PER_ENTRY);
}

static FILLED_WORDS: AtomicUsize = AtomicUsize::new(0);
static EDEN_RECORDS: AtomicUsize = AtomicUsize::new(0);
static SURVIVOR_RECORDS: AtomicUsize = AtomicUsize::new(0);
static SURVIVOR_PASSES: AtomicUsize = AtomicUsize::new(0);

struct CountingBinding;
struct CountingFiller;
struct CountingPolicy;

impl ObjectFiller for CountingFiller {
    const MIN_FILL_WORDS: usize = 2;

    fn fill(_start: Address, words: usize) {
        FILLED_WORDS.fetch_add(words, Ordering::SeqCst);
    }
}

impl AgePolicy for CountingPolicy {
    fn record_eden_region(_region: regiongc::policy::region::RegionIdx, _eden_index: usize) {
        EDEN_RECORDS.fetch_add(1, Ordering::SeqCst);
    }

    fn record_survivor_region(_region: regiongc::policy::region::RegionIdx, _young_index: usize) {
        SURVIVOR_RECORDS.fetch_add(1, Ordering::SeqCst);
    }

    fn survivors_end() {
        SURVIVOR_PASSES.fetch_add(1, Ordering::SeqCst);
    }
}

impl RegionBinding for CountingBinding {
    type Filler = CountingFiller;
    type Policy = CountingPolicy;
}

#[test]
fn binding_hooks_observe_the_region_lifecycle() {
    let mut space = make_space::<CountingBinding>(4);
    space.init_allocator(AllocKind::Mutator);
    space.init_allocator(AllocKind::Survivor);

    // Two allocations leave 128 words in region 0; the third rolls over and
    // pads that tail through the filler.
    let words = REGION_WORDS / 2 - 64;
    space.allocate(AllocKind::Mutator, words).unwrap();
    space.allocate(AllocKind::Mutator, words).unwrap();
    space.allocate(AllocKind::Mutator, words).unwrap();
    assert_eq!(FILLED_WORDS.load(Ordering::SeqCst), 128);
    assert_eq!(EDEN_RECORDS.load(Ordering::SeqCst), 2);

    space.allocate(AllocKind::Survivor, 64).unwrap();
    space.release_allocator(AllocKind::Mutator);
    space.release_allocator(AllocKind::Survivor);
    // Releasing retires without padding, so the filler count is unchanged.
    assert_eq!(FILLED_WORDS.load(Ordering::SeqCst), 128);

    space.reset_young_lists();
    assert_eq!(SURVIVOR_RECORDS.load(Ordering::SeqCst), 1);
    assert_eq!(SURVIVOR_PASSES.load(Ordering::SeqCst), 1);
    assert_eq!(EDEN_RECORDS.load(Ordering::SeqCst), 2);

    space.retag_survivors_eden();
    assert_eq!(space.young_lengths(), (1, 0));
}
