//! The region space: the controller that owns the region table and every
//! piece of shared bookkeeping around it.
//!
//! All regions are carved out of one contiguous reserve at construction
//! time, so a region's index fully determines its address range. Records
//! start uncommitted; committing is bookkeeping only (the embedder maps
//! memory), and proceeds at a watermark so the committed set grows from the
//! low end of the reserve. Archive regions are the exception and may commit
//! anywhere, which is what keeps the sequence's sort path alive.
//!
//! Locking. The fast allocation path is lock free and touches only the
//! active region's bump pointer. Everything that changes which regions are
//! committed or handed out runs under the space mutex: the slow allocation
//! path locks it, wraps the guard in a [`LockedSpace`], and passes that down
//! to [`AllocRegion`] as its provider, so replacing a region can commit
//! fresh ones without ever taking the lock twice. Operations marked
//! `&mut self` are safepoint operations: the embedder must have stopped
//! allocation before calling them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use atomic_refcell::AtomicRefCell;
use crossbeam::queue::SegQueue;
use enum_map::{enum_map, EnumMap};

use super::region::HeapRegion;
use super::remset::AddCardResult;
use super::seq::{IterOutcome, RegionSeq};
use super::young_list::YoungList;
use super::RegionIdx;
use crate::util::alloc::{AllocKind, AllocRegion, RegionProvider};
use crate::util::conversions;
use crate::util::options::Options;
use crate::util::Address;
use crate::vm::RegionBinding;

/// State that only changes under the space mutex.
struct SpaceSync {
    /// Committed regions in address order.
    seq: RegionSeq,
    /// Slot index of the next region to commit. Slots below the watermark
    /// are committed unless a shrink gave them back; slots above it are
    /// uncommitted unless an archive mapping claimed them.
    commit_watermark: u32,
    /// Soft cap on the young list length. Mutator region requests beyond it
    /// are refused unless forced.
    young_target: Option<usize>,
}

pub struct RegionSpace<B: RegionBinding> {
    name: &'static str,
    start: Address,
    region_bytes: usize,
    /// Region records in slot order, followed by the dummy in the last slot.
    regions: Box<[HeapRegion]>,
    /// Number of real regions; the slab holds one more record, the dummy.
    region_count: usize,
    sync: Mutex<SpaceSync>,
    /// Committed, free, empty regions available for handout. Every region on
    /// the list satisfies exactly that predicate and vice versa.
    free_regions: spin::Mutex<Vec<RegionIdx>>,
    /// The eden and survivor lists. Borrowed mutably only under the space
    /// mutex or through `&mut self`, which the runtime borrow check enforces.
    young_list: AtomicRefCell<YoungList<B>>,
    /// One active allocation region per kind.
    alloc_regions: EnumMap<AllocKind, AllocRegion<B>>,
    /// Regions whose sparse table grew since the last safepoint. Shared with
    /// every region's remembered set.
    expanded: Arc<SegQueue<RegionIdx>>,
    /// Bytes handed out from retired regions. Active regions are accounted
    /// separately in [`RegionSpace::used_bytes`].
    used_bytes: AtomicUsize,
    committed_count: AtomicUsize,
    options: Arc<Options>,
}

/// The space with its mutex held, acting as the allocation slow path's
/// region provider. Constructing one is the only way slow path code gets at
/// [`SpaceSync`], so the lock acquisition order is fixed by construction.
struct LockedSpace<'a, B: RegionBinding> {
    space: &'a RegionSpace<B>,
    sync: MutexGuard<'a, SpaceSync>,
}

impl<B: RegionBinding> RegionProvider for LockedSpace<'_, B> {
    fn allocate_new_region(
        &mut self,
        kind: AllocKind,
        word_size: usize,
        force: bool,
    ) -> Option<RegionIdx> {
        self.space.new_region_for(kind, word_size, force, &mut self.sync)
    }

    fn retire_region(&mut self, kind: AllocKind, idx: RegionIdx, allocated_bytes: usize) {
        self.space.retire_region_for(kind, idx, allocated_bytes);
    }
}

impl<B: RegionBinding> RegionSpace<B> {
    /// Carve `bytes` of address space starting at `start` into regions of
    /// `options.region_size` bytes each. Nothing is committed yet.
    pub fn new(name: &'static str, start: Address, bytes: usize, options: Arc<Options>) -> Self {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("regiongc initialized the logger."),
            Err(_) => debug!(
                "regiongc failed to initialize the logger. Possibly a logger has been initialized by user."
            ),
        }
        let region_bytes = options.region_size.bytes();
        assert!(
            conversions::raw_is_aligned(start.as_usize(), region_bytes),
            "{}: start {:?} is not aligned to the region size {}",
            name,
            start,
            region_bytes
        );
        assert!(
            bytes > 0 && conversions::raw_is_aligned(bytes, region_bytes),
            "{}: extent {} is not a positive multiple of the region size {}",
            name,
            bytes,
            region_bytes
        );
        let region_count = bytes / region_bytes;
        assert!(
            region_count < RegionIdx::INVALID as usize,
            "{}: {} regions do not fit in a region index",
            name,
            region_count
        );

        let expanded = Arc::new(SegQueue::new());
        let mut regions: Vec<HeapRegion> = (0..region_count)
            .map(|i| {
                HeapRegion::new(
                    RegionIdx::new(i as u32),
                    start + i * region_bytes,
                    region_bytes,
                    options.sparse_initial_capacity,
                    expanded.clone(),
                )
            })
            .collect();
        let dummy_slot = region_count as u32;
        regions.push(HeapRegion::new_dummy(
            RegionIdx::new(dummy_slot),
            start + bytes,
            options.sparse_initial_capacity,
            expanded.clone(),
        ));

        info!(
            "{}: regiongc {} managing {} regions of {} bytes starting at {:?}",
            name,
            env!("CARGO_PKG_VERSION"),
            region_count,
            region_bytes,
            start
        );

        RegionSpace {
            name,
            start,
            region_bytes,
            regions: regions.into_boxed_slice(),
            region_count,
            sync: Mutex::new(SpaceSync {
                seq: RegionSeq::new(),
                commit_watermark: 0,
                young_target: None,
            }),
            free_regions: spin::Mutex::new(Vec::new()),
            young_list: AtomicRefCell::new(YoungList::new()),
            alloc_regions: enum_map! { kind => AllocRegion::new(kind, dummy_slot) },
            expanded,
            used_bytes: AtomicUsize::new(0),
            committed_count: AtomicUsize::new(0),
            options,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    pub fn region_size(&self) -> usize {
        self.region_bytes
    }

    pub fn region(&self, idx: RegionIdx) -> &HeapRegion {
        assert!(
            idx.index() < self.region_count,
            "{}: region index {} out of range",
            self.name,
            idx
        );
        &self.regions[idx.index()]
    }

    pub fn address_in_space(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.start + self.region_count * self.region_bytes
    }

    /// The region covering `addr`. Geometry is fixed, so this is pure
    /// arithmetic on the reserve base.
    pub fn region_index_of(&self, addr: Address) -> RegionIdx {
        debug_assert!(
            self.address_in_space(addr),
            "{:?} is outside {}",
            addr,
            self.name
        );
        RegionIdx::new(((addr - self.start) / self.region_bytes) as u32)
    }

    /// Objects at or above half a region bypass the bump allocators and take
    /// the humongous path.
    pub fn is_humongous_size(&self, word_size: usize) -> bool {
        conversions::words_to_bytes(word_size) >= self.region_bytes / 2
    }

    /// Regions needed to cover a humongous object of `word_size` words.
    pub fn humongous_obj_size_in_regions(&self, word_size: usize) -> usize {
        let bytes = conversions::words_to_bytes(word_size);
        (bytes + self.region_bytes - 1) / self.region_bytes
    }

    /// Opens an allocation interval for `kind`. The kind's allocator must be
    /// uninitialized, either fresh or released.
    pub fn init_allocator(&self, kind: AllocKind) {
        self.alloc_regions[kind].init();
    }

    /// Closes the allocation interval for `kind`, retiring the active region
    /// without padding. Returns the retired region, if there was one.
    pub fn release_allocator(&self, kind: AllocKind) -> Option<RegionIdx> {
        let mut locked = self.lock();
        self.alloc_regions[kind].release(&self.regions, &mut locked)
    }

    /// Lock free allocation attempt against `kind`'s active region. `None`
    /// means the caller should escalate to [`RegionSpace::allocate`].
    pub fn attempt_allocation(&self, kind: AllocKind, word_size: usize) -> Option<Address> {
        self.alloc_regions[kind].attempt_allocation(word_size, &self.regions)
    }

    /// Full allocation escalation: lock free fast path, then the locked
    /// region replacement path, then the forced path that ignores the young
    /// soft cap. Humongous requests divert to the humongous path.
    pub fn allocate(&self, kind: AllocKind, word_size: usize) -> Option<Address> {
        if self.is_humongous_size(word_size) {
            assert_eq!(
                kind,
                AllocKind::Mutator,
                "humongous objects are allocated by mutators, not by evacuation"
            );
            return self.allocate_humongous(word_size);
        }
        if let Some(addr) = self.attempt_allocation(kind, word_size) {
            return Some(addr);
        }
        let ar = &self.alloc_regions[kind];
        let mut locked = self.lock();
        if let Some(addr) = ar.attempt_allocation_locked(word_size, &self.regions, &mut locked) {
            return Some(addr);
        }
        ar.attempt_allocation_force(word_size, &self.regions, &mut locked)
    }

    /// Allocate a humongous object spanning one or more whole regions.
    ///
    /// Scans the committed sequence for an address contiguous run of empty
    /// regions, committing one more region and rescanning on failure until
    /// the reserve is exhausted.
    pub fn allocate_humongous(&self, word_size: usize) -> Option<Address> {
        debug_assert!(self.is_humongous_size(word_size));
        let mut sync = self.sync.lock().unwrap();
        loop {
            if let Some(addr) = sync.seq.obj_allocate(word_size, &self.regions) {
                self.finish_humongous(addr, word_size);
                return Some(addr);
            }
            if self.commit_next_region(&mut sync).is_none() {
                debug!(
                    "{}: humongous allocation of {} words failed, reserve exhausted",
                    self.name, word_size
                );
                return None;
            }
        }
    }

    /// Take the spanned regions off the free list and account the object.
    /// The sequence has already tagged the run and set the bump pointers.
    fn finish_humongous(&self, addr: Address, word_size: usize) {
        let first = self.region_index_of(addr).raw();
        let span = self.humongous_obj_size_in_regions(word_size) as u32;
        self.free_regions
            .lock()
            .retain(|idx| idx.raw() < first || idx.raw() >= first + span);
        self.used_bytes
            .fetch_add(conversions::words_to_bytes(word_size), Ordering::Relaxed);
    }

    /// Free a humongous object given its starts-humongous region. Every
    /// region of the span is reset and returned to the free list. Returns
    /// the number of regions freed.
    pub fn free_humongous_object(&mut self, first: RegionIdx) -> usize {
        assert!(
            self.regions[first.index()].is_starts_humongous(),
            "{:?} does not start a humongous object",
            self.regions[first.index()]
        );
        let mut pos = first.index();
        let mut freed_bytes = 0;
        let mut freed_regions = 0;
        loop {
            {
                let hr = &mut self.regions[pos];
                freed_bytes += hr.used_bytes();
                hr.reset_for_reuse();
            }
            self.free_regions.get_mut().push(RegionIdx::new(pos as u32));
            freed_regions += 1;
            pos += 1;
            if pos >= self.region_count || !self.regions[pos].is_continues_humongous() {
                break;
            }
        }
        self.used_bytes.fetch_sub(freed_bytes, Ordering::Relaxed);
        debug!(
            "{}: freed a humongous object of {} bytes spanning {} regions at {}",
            self.name, freed_bytes, freed_regions, first
        );
        freed_regions
    }

    /// Record that the reference at `src` points to `dst`, updating the
    /// destination region's remembered set.
    ///
    /// Recording must be serialized per destination region by the caller,
    /// like any other sparse table write.
    pub fn record_cross_region_reference(&self, src: Address, dst: Address) -> AddCardResult {
        let src_region = self.region_index_of(src);
        let dst_region = self.region_index_of(dst);
        // References within one region are collected with their region and
        // never need remembering.
        if src_region == dst_region {
            return AddCardResult::Found;
        }
        let card = self.regions[src_region.index()].card_index_for(src);
        self.regions[dst_region.index()]
            .rem_set()
            .add_card(src_region, card)
    }

    fn lock(&self) -> LockedSpace<'_, B> {
        LockedSpace {
            space: self,
            sync: self.sync.lock().unwrap(),
        }
    }

    /// Hand out a committed region for `kind` and tag it. Mutator regions
    /// join the young list here, the moment they are handed out.
    fn new_region_for(
        &self,
        kind: AllocKind,
        word_size: usize,
        force: bool,
        sync: &mut SpaceSync,
    ) -> Option<RegionIdx> {
        debug_assert!(!self.is_humongous_size(word_size));
        if kind == AllocKind::Mutator && !force {
            if let Some(target) = sync.young_target {
                if self.young_list.borrow().length() >= target {
                    trace!(
                        "{}: young target {} reached, refusing a mutator region",
                        self.name,
                        target
                    );
                    return None;
                }
            }
        }
        let idx = self.claim_committed_region(sync)?;
        match kind {
            AllocKind::Mutator => self.young_list.borrow_mut().push_region(idx, &self.regions),
            AllocKind::Survivor => self.regions[idx.index()].set_survivor(),
            AllocKind::Old => self.regions[idx.index()].set_old(),
        }
        #[cfg(feature = "extreme_assertions")]
        assert!(self.verify_lists_locked(sync));
        Some(idx)
    }

    /// Account a retired region. Survivor regions filled during the pause
    /// collect on the survivor sub list for the pause end transfer.
    fn retire_region_for(&self, kind: AllocKind, idx: RegionIdx, allocated_bytes: usize) {
        self.used_bytes.fetch_add(allocated_bytes, Ordering::Relaxed);
        if kind == AllocKind::Survivor {
            self.young_list
                .borrow_mut()
                .add_survivor_region(idx, &self.regions);
        }
    }

    /// Pop a free region, committing at the watermark until one is available
    /// or the reserve is exhausted.
    fn claim_committed_region(&self, sync: &mut SpaceSync) -> Option<RegionIdx> {
        loop {
            if let Some(idx) = self.free_regions.lock().pop() {
                let hr = &self.regions[idx.index()];
                debug_assert!(hr.is_free() && hr.is_empty(), "{:?} on the free list", hr);
                return Some(idx);
            }
            self.commit_next_region(sync)?;
        }
    }

    /// Commit the slot at the watermark, skipping slots an archive mapping
    /// committed out of band. The fresh region joins the sequence and the
    /// free list.
    fn commit_next_region(&self, sync: &mut SpaceSync) -> Option<RegionIdx> {
        while (sync.commit_watermark as usize) < self.region_count
            && self.regions[sync.commit_watermark as usize].is_committed()
        {
            sync.commit_watermark += 1;
        }
        if sync.commit_watermark as usize == self.region_count {
            return None;
        }
        let idx = RegionIdx::new(sync.commit_watermark);
        sync.commit_watermark += 1;
        let hr = &self.regions[idx.index()];
        hr.set_committed(true);
        sync.seq.insert(idx, &self.regions);
        self.free_regions.lock().push(idx);
        self.committed_count.fetch_add(1, Ordering::Relaxed);
        trace!("{}: committed {:?}", self.name, hr);
        Some(idx)
    }

    /// Commit the region at `addr` out of address order and tag it as an
    /// archive region. Returns `None` if that slot is already committed.
    pub fn alloc_archive_region_at(&mut self, addr: Address) -> Option<RegionIdx> {
        assert!(
            conversions::raw_is_aligned(addr.as_usize(), self.region_bytes),
            "{}: archive address {:?} is not region aligned",
            self.name,
            addr
        );
        let idx = self.region_index_of(addr);
        let hr = &self.regions[idx.index()];
        if hr.is_committed() {
            warn!("{}: archive slot {:?} is already committed", self.name, hr);
            return None;
        }
        hr.set_committed(true);
        hr.set_archive();
        let sync = self.sync.get_mut().unwrap();
        sync.seq.insert(idx, &self.regions);
        self.committed_count.fetch_add(1, Ordering::Relaxed);
        // Deliberately not on the free list: archive regions are never
        // handed out and never reclaimed.
        debug!("{}: committed archive region {:?}", self.name, hr);
        Some(idx)
    }

    /// Safepoint: fold every sparse table that grew since the last pause, so
    /// pause time readers see the complete remembered sets again.
    pub fn cleanup_sparse_tables(&mut self) {
        let mut folded = 0;
        while let Some(idx) = self.expanded.pop() {
            self.regions[idx.index()].rem_set_mut().cleanup();
            folded += 1;
        }
        if folded > 0 {
            debug!("{}: folded {} expanded sparse tables", self.name, folded);
        }
    }

    /// Safepoint: the pause has evacuated the collection set. Free every
    /// region on the main young list, then transfer this pause's survivors
    /// onto it. All allocators must have been released first.
    pub fn reset_young_lists(&mut self) {
        debug_assert!(
            self.alloc_regions.values().all(|ar| ar.get().is_none()),
            "allocators must be released before the young lists are reset"
        );
        let young = self.young_list.get_mut();
        let regions = &mut self.regions;
        let free = self.free_regions.get_mut();

        let mut freed_bytes = 0;
        let mut freed_regions = 0;
        let mut curr = young.first_region();
        while let Some(idx) = curr {
            let hr = &mut regions[idx.index()];
            curr = hr.next_young();
            freed_bytes += hr.used_bytes();
            hr.reset_for_reuse();
            free.push(idx);
            freed_regions += 1;
        }
        young.clear_main_list();
        young.reset_auxiliary_lists(regions);

        self.used_bytes.fetch_sub(freed_bytes, Ordering::Relaxed);
        debug!(
            "{}: freed {} young regions ({} bytes), {} survivors transferred",
            self.name,
            freed_regions,
            freed_bytes,
            self.young_list.get_mut().length()
        );
        #[cfg(feature = "extreme_assertions")]
        assert!(self.verify_region_lists());
    }

    /// Pause start: fold last pause's survivors, sitting at the head of the
    /// main list, back into eden.
    pub fn retag_survivors_eden(&self) {
        let _sync = self.sync.lock().unwrap();
        self.young_list
            .borrow()
            .retag_survivors_eden(&self.regions);
    }

    /// Safepoint: give back up to `max_regions` committed regions from the
    /// free tail of the sequence. Returns how many were decommitted.
    pub fn shrink(&mut self, max_regions: usize) -> usize {
        let sync = self.sync.get_mut().unwrap();
        let candidates = sync.seq.free_suffix(&self.regions).min(max_regions);
        if candidates == 0 {
            return 0;
        }
        let removed = sync.seq.shrink_by(candidates, &self.regions);
        let free = self.free_regions.get_mut();
        for &idx in &removed {
            self.regions[idx.index()].set_committed(false);
            free.retain(|&f| f != idx);
        }
        // Rewind the watermark so the lowest decommitted slot is the next
        // one recommitted; the commit loop skips slots that stayed committed.
        if let Some(lowest) = removed.iter().map(|idx| idx.raw()).min() {
            sync.commit_watermark = sync.commit_watermark.min(lowest);
        }
        self.committed_count.fetch_sub(removed.len(), Ordering::Relaxed);
        debug!("{}: shrank by {} regions", self.name, removed.len());
        removed.len()
    }

    /// Safepoint: install the soft cap on young list length that the pause
    /// prediction model computed.
    pub fn set_young_target(&mut self, target: Option<usize>) {
        self.sync.get_mut().unwrap().young_target = target;
    }

    /// Visit every committed region starting at sequence position `start`,
    /// wrapping around. See [`RegionSeq::iterate_from`].
    pub fn iterate_from<F>(&self, start: usize, f: F) -> IterOutcome
    where
        F: FnMut(&HeapRegion) -> bool,
    {
        self.sync.lock().unwrap().seq.iterate_from(start, &self.regions, f)
    }

    /// Begin a remembered set length sampling walk over the young list. The
    /// walk is stepped by [`RegionSpace::young_rs_sampling_next`] and may be
    /// abandoned; a safepoint that rebuilds the lists cancels it.
    pub fn young_rs_sampling_init(&self) {
        let _sync = self.sync.lock().unwrap();
        self.young_list.borrow_mut().rs_length_sampling_init();
    }

    pub fn young_rs_sampling_more(&self) -> bool {
        let _sync = self.sync.lock().unwrap();
        self.young_list.borrow().rs_length_sampling_more()
    }

    pub fn young_rs_sampling_next(&self) {
        let _sync = self.sync.lock().unwrap();
        self.young_list
            .borrow_mut()
            .rs_length_sampling_next(&self.regions);
    }

    /// The total of the last completed sampling walk.
    pub fn sampled_young_rs_lengths(&self) -> usize {
        let _sync = self.sync.lock().unwrap();
        self.young_list.borrow().sampled_rs_lengths()
    }

    /// Bytes allocated into the space: everything retired plus whatever the
    /// active regions have handed out so far.
    pub fn used_bytes(&self) -> usize {
        let retired = self.used_bytes.load(Ordering::Relaxed);
        let active: usize = self
            .alloc_regions
            .values()
            .filter_map(|ar| ar.get())
            .map(|idx| self.regions[idx.index()].used_bytes())
            .sum();
        retired + active
    }

    pub fn committed_regions(&self) -> usize {
        self.committed_count.load(Ordering::Relaxed)
    }

    /// Main list and survivor sub list lengths, in that order.
    pub fn young_lengths(&self) -> (usize, usize) {
        let _sync = self.sync.lock().unwrap();
        let young = self.young_list.borrow();
        (young.eden_length(), young.survivor_length())
    }

    /// Occupied sparse entries and cards summed over the committed regions.
    pub fn sparse_table_stats(&self) -> (usize, usize) {
        let sync = self.sync.lock().unwrap();
        let mut entries = 0;
        let mut cards = 0;
        for idx in sync.seq.iter() {
            let rs = self.regions[idx.index()].rem_set();
            entries += rs.occupied_entries();
            cards += rs.occupied_cards();
        }
        (entries, cards)
    }

    /// Walk the young list and the sequence checking their invariants,
    /// logging every mismatch. Outside debug builds the walk only runs when
    /// the `verify_region_lists` option asks for it.
    pub fn verify_region_lists(&self) -> bool {
        if !self.verification_enabled() {
            return true;
        }
        let sync = self.sync.lock().unwrap();
        self.verify_lists_locked(&sync)
    }

    fn verification_enabled(&self) -> bool {
        cfg!(debug_assertions)
            || cfg!(feature = "extreme_assertions")
            || self.options.verify_region_lists
    }

    fn verify_lists_locked(&self, sync: &SpaceSync) -> bool {
        let mut ok = self.young_list.borrow().check_list_well_formed(&self.regions);
        ok &= sync.seq.verify(&self.regions);
        ok
    }
}
