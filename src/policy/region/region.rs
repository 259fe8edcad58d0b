use atomic::{Atomic, Ordering};
use crossbeam::queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8};
use std::sync::Arc;

use super::region_type::{RegionKind, TransitionError};
use super::remset::SparsePRT;
use super::{CardIdx, RegionIdx};
use crate::util::constants::LOG_BYTES_IN_CARD;
use crate::util::conversions;
use crate::util::Address;

/// One fixed size region of the heap.
///
/// A region is a contiguous `[bottom, end)` slice of the address space with a
/// bump pointer `top`, a life cycle tag, and a sparse remembered set that
/// records incoming references by (region, card) pair. Region records live in
/// the space's region table and are indexed in address order.
///
/// `top` is the only field mutator threads race on. The tag is atomic so that
/// concurrent readers (for example remembered set sampling) always observe a
/// valid tag, but tag transitions themselves happen on one thread at a time.
pub struct HeapRegion {
    index: RegionIdx,
    bottom: Address,
    end: Address,
    top: Atomic<Address>,
    tag: AtomicU8,
    committed: AtomicBool,
    /// Link field for the young list. The list is threaded through the region
    /// table rather than through owning pointers.
    next_young: AtomicU32,
    /// Position of this region in the collection set. Only meaningful for
    /// young regions between `reset_auxiliary_lists` and the end of the pause.
    young_index_in_cset: AtomicU32,
    /// Position of this region in the space's address ordered sequence, kept
    /// in step by the sequence on insert and renumber.
    hrs_index: AtomicU32,
    rem_set: SparsePRT,
}

impl HeapRegion {
    pub(crate) fn new(
        index: RegionIdx,
        bottom: Address,
        region_bytes: usize,
        sparse_initial_capacity: usize,
        expanded_list: Arc<SegQueue<RegionIdx>>,
    ) -> Self {
        HeapRegion {
            index,
            bottom,
            end: bottom + region_bytes,
            top: Atomic::new(bottom),
            tag: AtomicU8::new(RegionKind::Free.tag()),
            committed: AtomicBool::new(false),
            next_young: AtomicU32::new(RegionIdx::INVALID),
            young_index_in_cset: AtomicU32::new(RegionIdx::INVALID),
            hrs_index: AtomicU32::new(RegionIdx::INVALID),
            rem_set: SparsePRT::new(index, sparse_initial_capacity, expanded_list),
        }
    }

    /// A permanently full zero length region. Allocation against it always
    /// fails, so allocator fast paths can treat "no current region" as an
    /// ordinary full region instead of branching on an option.
    pub(crate) fn new_dummy(
        index: RegionIdx,
        bottom: Address,
        sparse_initial_capacity: usize,
        expanded_list: Arc<SegQueue<RegionIdx>>,
    ) -> Self {
        Self::new(index, bottom, 0, sparse_initial_capacity, expanded_list)
    }

    pub fn index(&self) -> RegionIdx {
        self.index
    }

    pub fn bottom(&self) -> Address {
        self.bottom
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn top(&self) -> Address {
        self.top.load(Ordering::SeqCst)
    }

    /// Reposition the bump pointer. Only the owner of the region (the
    /// allocator that retired it, or the space at a safepoint) may do this.
    pub(crate) fn set_top(&self, top: Address) {
        debug_assert!(
            self.bottom <= top && top <= self.end,
            "top {:?} outside {:?}..{:?}",
            top,
            self.bottom,
            self.end
        );
        self.top.store(top, Ordering::SeqCst);
    }

    pub fn capacity_bytes(&self) -> usize {
        self.end - self.bottom
    }

    pub fn used_bytes(&self) -> usize {
        self.top() - self.bottom
    }

    pub fn free_bytes(&self) -> usize {
        self.end - self.top()
    }

    pub fn free_words(&self) -> usize {
        conversions::bytes_to_words_up(self.free_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Bump allocate `words` from this region. Safe to call from multiple
    /// threads. Returns `None` when the remaining space is too small, leaving
    /// `top` untouched.
    pub fn par_allocate(&self, words: usize) -> Option<Address> {
        let bytes = conversions::words_to_bytes(words);
        self.top
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |top| {
                if top + bytes > self.end {
                    None
                } else {
                    Some(top + bytes)
                }
            })
            .ok()
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::SeqCst);
    }

    pub fn kind(&self) -> RegionKind {
        RegionKind::from(self.tag.load(Ordering::SeqCst))
    }

    pub fn is_free(&self) -> bool {
        self.kind().is_free()
    }

    pub fn is_young(&self) -> bool {
        self.kind().is_young()
    }

    pub fn is_eden(&self) -> bool {
        self.kind().is_eden()
    }

    pub fn is_survivor(&self) -> bool {
        self.kind().is_survivor()
    }

    pub fn is_humongous(&self) -> bool {
        self.kind().is_humongous()
    }

    pub fn is_starts_humongous(&self) -> bool {
        self.kind().is_starts_humongous()
    }

    pub fn is_continues_humongous(&self) -> bool {
        self.kind().is_continues_humongous()
    }

    pub fn is_pinned(&self) -> bool {
        self.kind().is_pinned()
    }

    pub fn is_old(&self) -> bool {
        self.kind().is_old()
    }

    pub fn is_archive(&self) -> bool {
        self.kind().is_archive()
    }

    /// Install `to` after checking that the current tag is exactly
    /// `expected`. The check and the store are one compare and exchange, so a
    /// racing transition cannot slip between them.
    fn set_from(&self, to: RegionKind, expected: RegionKind) {
        if let Err(actual) =
            self.tag
                .compare_exchange(expected.tag(), to.tag(), Ordering::SeqCst, Ordering::SeqCst)
        {
            panic!(
                "region {} tag is {}, expected {} to become {}",
                self.index,
                RegionKind::from(actual),
                expected,
                to
            );
        }
    }

    pub fn set_eden(&self) {
        self.set_from(RegionKind::Eden, RegionKind::Free);
    }

    /// Re-tag a survivor region as eden. Used when last cycle's survivors are
    /// folded back into the eden set at the start of a collection.
    pub fn set_eden_pre_gc(&self) {
        self.set_from(RegionKind::Eden, RegionKind::Survivor);
    }

    pub fn set_survivor(&self) {
        self.set_from(RegionKind::Survivor, RegionKind::Free);
    }

    pub fn set_starts_humongous(&self) {
        self.set_from(RegionKind::StartsHumongous, RegionKind::Free);
    }

    pub fn set_continues_humongous(&self) {
        self.set_from(RegionKind::ContinuesHumongous, RegionKind::Free);
    }

    pub fn set_archive(&self) {
        self.set_from(RegionKind::Archive, RegionKind::Free);
    }

    /// Promotion is legal from any tag.
    pub fn set_old(&self) {
        self.tag.store(RegionKind::Old.tag(), Ordering::SeqCst);
    }

    /// Reclaim is legal from any tag. Only the tag changes here; callers that
    /// recycle the region also reset `top` and the remembered set.
    pub fn set_free(&self) {
        self.tag.store(RegionKind::Free.tag(), Ordering::SeqCst);
    }

    /// Checked tag transition that reports an illegal move instead of
    /// panicking. Retries until the transition is applied against a stable
    /// starting tag.
    pub fn try_transition(&self, to: RegionKind) -> Result<(), TransitionError> {
        let mut cur = self.tag.load(Ordering::SeqCst);
        loop {
            RegionKind::from(cur).transition(to)?;
            match self
                .tag
                .compare_exchange_weak(cur, to.tag(), Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn next_young(&self) -> Option<RegionIdx> {
        RegionIdx::decode(self.next_young.load(Ordering::SeqCst))
    }

    pub(crate) fn set_next_young(&self, next: Option<RegionIdx>) {
        self.next_young.store(RegionIdx::encode(next), Ordering::SeqCst);
    }

    pub fn young_index_in_cset(&self) -> Option<u32> {
        match self.young_index_in_cset.load(Ordering::SeqCst) {
            RegionIdx::INVALID => None,
            idx => Some(idx),
        }
    }

    pub(crate) fn set_young_index_in_cset(&self, index: Option<u32>) {
        let raw = match index {
            Some(idx) => {
                debug_assert!(idx != RegionIdx::INVALID);
                idx
            }
            None => RegionIdx::INVALID,
        };
        self.young_index_in_cset.store(raw, Ordering::SeqCst);
    }

    /// This region's position in the address ordered sequence, or `None` if
    /// it is not currently part of it.
    pub fn hrs_index(&self) -> Option<u32> {
        match self.hrs_index.load(Ordering::SeqCst) {
            RegionIdx::INVALID => None,
            idx => Some(idx),
        }
    }

    pub(crate) fn set_hrs_index(&self, index: Option<u32>) {
        let raw = match index {
            Some(idx) => {
                debug_assert!(idx != RegionIdx::INVALID);
                idx
            }
            None => RegionIdx::INVALID,
        };
        self.hrs_index.store(raw, Ordering::SeqCst);
    }

    pub fn rem_set(&self) -> &SparsePRT {
        &self.rem_set
    }

    /// Mutable access for safepoint operations on the remembered set
    /// (cleanup, clear, entry deletion).
    pub fn rem_set_mut(&mut self) -> &mut SparsePRT {
        &mut self.rem_set
    }

    /// The card within this region that covers `addr`.
    pub fn card_index_for(&self, addr: Address) -> CardIdx {
        debug_assert!(
            self.bottom <= addr && addr < self.end,
            "{:?} outside {:?}",
            addr,
            self
        );
        ((addr - self.bottom) >> LOG_BYTES_IN_CARD) as CardIdx
    }

    /// The first address covered by `card` in this region.
    pub fn addr_for_card(&self, card: CardIdx) -> Address {
        let addr = self.bottom + ((card as usize) << LOG_BYTES_IN_CARD);
        debug_assert!(addr < self.end || (addr == self.end && self.bottom == self.end));
        addr
    }

    /// Return the region to its boxed-fresh state so it can be handed out
    /// again: tag free, bump pointer reset, young fields cleared, remembered
    /// set dropped back to its initial table.
    pub(crate) fn reset_for_reuse(&mut self) {
        self.set_free();
        self.set_top(self.bottom);
        self.set_next_young(None);
        self.set_young_index_in_cset(None);
        self.rem_set.clear();
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "HR[{} {} {:?}..{:?} top {:?}]",
            self.index,
            self.kind().name(),
            self.bottom,
            self.end,
            self.top()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::{BYTES_IN_CARD, BYTES_IN_WORD};
    use crate::util::test_util::{panic_after, TEST_HEAP_START};

    const REGION_BYTES: usize = 1 << 20;

    fn test_region() -> HeapRegion {
        HeapRegion::new(
            RegionIdx::new(0),
            TEST_HEAP_START,
            REGION_BYTES,
            16,
            Arc::new(SegQueue::new()),
        )
    }

    #[test]
    fn fresh_region_is_free_and_empty() {
        let r = test_region();
        assert!(r.is_free());
        assert!(r.is_empty());
        assert_eq!(r.capacity_bytes(), REGION_BYTES);
        assert_eq!(r.free_bytes(), REGION_BYTES);
        assert_eq!(r.used_bytes(), 0);
        assert_eq!(r.next_young(), None);
        assert_eq!(r.young_index_in_cset(), None);
    }

    #[test]
    fn bump_allocation_moves_top() {
        let r = test_region();
        let a = r.par_allocate(8).unwrap();
        assert_eq!(a, r.bottom());
        let b = r.par_allocate(16).unwrap();
        assert_eq!(b, a + 8 * BYTES_IN_WORD);
        assert_eq!(r.used_bytes(), 24 * BYTES_IN_WORD);
    }

    #[test]
    fn allocation_fails_when_full() {
        let r = test_region();
        let words = REGION_BYTES / BYTES_IN_WORD;
        assert!(r.par_allocate(words).is_some());
        assert_eq!(r.free_bytes(), 0);
        assert_eq!(r.par_allocate(1), None);
        // A failed attempt must not move top.
        assert_eq!(r.top(), r.end());
    }

    #[test]
    fn oversized_request_leaves_top_untouched() {
        let r = test_region();
        r.par_allocate(8).unwrap();
        let top = r.top();
        assert_eq!(r.par_allocate(REGION_BYTES / BYTES_IN_WORD), None);
        assert_eq!(r.top(), top);
    }

    #[test]
    fn parallel_allocations_never_overlap() {
        panic_after(10000, || {
            let r = Arc::new(test_region());
            let words_each = 16;
            let threads = 8;
            let per_thread = 128;
            let mut handles = vec![];
            for _ in 0..threads {
                let r = r.clone();
                handles.push(std::thread::spawn(move || {
                    let mut got = vec![];
                    for _ in 0..per_thread {
                        got.push(r.par_allocate(words_each).unwrap());
                    }
                    got
                }));
            }
            let mut all: Vec<Address> = handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect();
            all.sort();
            all.dedup();
            assert_eq!(all.len(), threads * per_thread);
            assert_eq!(
                r.used_bytes(),
                threads * per_thread * words_each * BYTES_IN_WORD
            );
        })
    }

    #[test]
    fn dummy_region_never_allocates() {
        let r = HeapRegion::new_dummy(
            RegionIdx::new(7),
            TEST_HEAP_START,
            16,
            Arc::new(SegQueue::new()),
        );
        assert_eq!(r.capacity_bytes(), 0);
        assert_eq!(r.top(), r.end());
        assert_eq!(r.par_allocate(1), None);
    }

    #[test]
    fn tag_life_cycle() {
        let r = test_region();
        r.set_eden();
        assert!(r.is_eden() && r.is_young());
        r.set_free();
        r.set_survivor();
        assert!(r.is_survivor() && r.is_young());
        r.set_eden_pre_gc();
        assert!(r.is_eden());
        r.set_old();
        assert!(r.is_old() && !r.is_young());
        r.set_free();
        assert!(r.is_free());
    }

    #[test]
    #[should_panic(expected = "expected FREE")]
    fn eden_requires_free() {
        let r = test_region();
        r.set_old();
        r.set_eden();
    }

    #[test]
    #[should_panic(expected = "expected SURV")]
    fn eden_pre_gc_requires_survivor() {
        let r = test_region();
        r.set_eden();
        r.set_eden_pre_gc();
    }

    #[test]
    fn try_transition_reports_illegal_moves() {
        let r = test_region();
        r.set_eden();
        let err = r.try_transition(RegionKind::Survivor).unwrap_err();
        assert_eq!(err.from, RegionKind::Eden);
        assert_eq!(err.to, RegionKind::Survivor);
        assert!(r.is_eden());
        assert!(r.try_transition(RegionKind::Old).is_ok());
        assert!(r.is_old());
    }

    #[test]
    fn card_addressing_round_trips() {
        let r = test_region();
        assert_eq!(r.card_index_for(r.bottom()), 0);
        assert_eq!(r.card_index_for(r.bottom() + (BYTES_IN_CARD - 1)), 0);
        assert_eq!(r.card_index_for(r.bottom() + BYTES_IN_CARD), 1);
        let last = r.end() - 1usize;
        let last_card = r.card_index_for(last);
        assert_eq!(last_card as usize, REGION_BYTES / BYTES_IN_CARD - 1);
        assert_eq!(r.addr_for_card(0), r.bottom());
        assert_eq!(
            r.addr_for_card(last_card),
            r.bottom() + (REGION_BYTES - BYTES_IN_CARD)
        );
    }

    #[test]
    fn reset_for_reuse_restores_fresh_state() {
        let mut r = test_region();
        r.set_eden();
        r.par_allocate(64).unwrap();
        r.set_next_young(Some(RegionIdx::new(3)));
        r.set_young_index_in_cset(Some(1));
        r.reset_for_reuse();
        assert!(r.is_free());
        assert!(r.is_empty());
        assert_eq!(r.next_young(), None);
        assert_eq!(r.young_index_in_cset(), None);
        assert_eq!(r.rem_set().occupied_cards(), 0);
    }
}
