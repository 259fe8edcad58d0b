//! The active bump allocation region.
//!
//! An [`AllocRegion`] wraps "the region we are currently allocating into" for
//! one allocation purpose. The fast path is lock free: any number of threads
//! may call [`AllocRegion::attempt_allocation`] against the same instance and
//! race on the region's top pointer. Replacing a full region is the slow
//! path: the caller must hold whatever lock serializes region replacement
//! for this purpose and then call [`AllocRegion::attempt_allocation_locked`]
//! or, as a last resort, [`AllocRegion::attempt_allocation_force`]. The
//! struct itself never locks, so mutator and collector instances can be
//! guarded by different locks.
//!
//! Between [`AllocRegion::init`] and [`AllocRegion::release`] the active slot
//! always names a region. When no real region is installed it names the
//! shared dummy region, which is permanently full, so the fast path never
//! branches on "do we have a region" and simply fails the bump attempt.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use enum_map::Enum;

use crate::policy::region::{HeapRegion, RegionIdx};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;
use crate::vm::{ObjectFiller, RegionBinding};

/// What an active region is being filled with. Decides which regions the
/// provider hands out and how retired regions are disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum AllocKind {
    /// Application allocation. Fresh regions become eden.
    Mutator,
    /// Evacuation targets for young objects during a pause.
    Survivor,
    /// Evacuation targets for promoted objects during a pause.
    Old,
}

impl AllocKind {
    pub fn name(&self) -> &'static str {
        match self {
            AllocKind::Mutator => "mutator",
            AllocKind::Survivor => "survivor",
            AllocKind::Old => "old",
        }
    }
}

/// The slow path half of region replacement, implemented by the region
/// space's locked view. The caller locks the space, builds the view, and
/// passes it down, so these methods run with replacement serialized.
pub trait RegionProvider {
    /// Hand out a fresh committed region suitable for `kind`, or `None` if
    /// capacity or policy refuse. `force` overrides the soft cap on young
    /// region count and is only passed by the last resort path.
    fn allocate_new_region(&mut self, kind: AllocKind, word_size: usize, force: bool)
        -> Option<RegionIdx>;

    /// Take back a region the allocator is done with, together with the
    /// number of bytes handed out from it during this allocation interval.
    fn retire_region(&mut self, kind: AllocKind, idx: RegionIdx, allocated_bytes: usize);
}

/// Slot value meaning "outside the init/release window".
const UNINIT: u32 = u32::MAX;

pub struct AllocRegion<B: RegionBinding> {
    kind: AllocKind,
    /// Region table slot of the active region. Either a real region, the
    /// dummy slot, or [`UNINIT`].
    active: AtomicU32,
    /// Region table slot of the shared dummy region.
    dummy: u32,
    /// Bytes already in the active region when it was installed. Subtracted
    /// when reporting allocated bytes at retirement.
    used_bytes_before: AtomicUsize,
    /// Distinct regions consumed since `init`.
    count: AtomicUsize,
    phantom: PhantomData<B>,
}

impl<B: RegionBinding> AllocRegion<B> {
    pub fn new(kind: AllocKind, dummy_slot: u32) -> Self {
        AllocRegion {
            kind,
            active: AtomicU32::new(UNINIT),
            dummy: dummy_slot,
            used_bytes_before: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            phantom: PhantomData,
        }
    }

    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    /// Distinct regions consumed since the last `init`.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// The active region, or `None` when none is installed. The dummy never
    /// escapes through here.
    pub fn get(&self) -> Option<RegionIdx> {
        let active = self.active.load(Ordering::Acquire);
        if active == UNINIT || active == self.dummy {
            None
        } else {
            Some(RegionIdx::new(active))
        }
    }

    /// Opens an allocation interval by pointing the active slot at the dummy.
    pub fn init(&self) {
        trace!("{} alloc region initializing", self.kind.name());
        assert!(
            self.active.load(Ordering::Relaxed) == UNINIT,
            "{} alloc region is already initialized",
            self.kind.name()
        );
        assert!(self.used_bytes_before.load(Ordering::Relaxed) == 0);
        self.count.store(0, Ordering::Relaxed);
        self.active.store(self.dummy, Ordering::Release);
    }

    /// Lock free fast path. Bumps the active region and returns `None` the
    /// moment that fails, leaving escalation to the caller. Never blocks.
    pub fn attempt_allocation(
        &self,
        word_size: usize,
        regions: &[HeapRegion],
    ) -> Option<Address> {
        let active = self.active.load(Ordering::Acquire);
        assert!(
            active != UNINIT,
            "{} alloc region is not initialized",
            self.kind.name()
        );
        // The dummy is permanently full, so an empty slot fails here like
        // any other full region.
        regions[active as usize].par_allocate(word_size)
    }

    /// Slow path, caller holds the replacement lock. Retries the fast path
    /// once in case another thread replaced the region while this one was
    /// waiting on the lock, then retires the active region and installs a
    /// new one.
    pub fn attempt_allocation_locked<P: RegionProvider>(
        &self,
        word_size: usize,
        regions: &[HeapRegion],
        provider: &mut P,
    ) -> Option<Address> {
        if let Some(result) = self.attempt_allocation(word_size, regions) {
            return Some(result);
        }

        self.retire(true, regions, provider);
        let result = self.new_alloc_region_and_allocate(word_size, false, regions, provider);
        if result.is_none() {
            trace!(
                "{} alloc region failed to replace its region",
                self.kind.name()
            );
        }
        result
    }

    /// Last resort path, caller still holds the replacement lock and has
    /// already failed [`AllocRegion::attempt_allocation_locked`]. Asks the
    /// provider to ignore its soft cap.
    pub fn attempt_allocation_force<P: RegionProvider>(
        &self,
        word_size: usize,
        regions: &[HeapRegion],
        provider: &mut P,
    ) -> Option<Address> {
        trace!("{} alloc region forcing a region", self.kind.name());
        self.new_alloc_region_and_allocate(word_size, true, regions, provider)
    }

    /// Retires the active region back to the provider and points the active
    /// slot at the dummy. With `fill_up` the region's tail is first padded
    /// with a filler object so heap walkers never cross raw memory.
    ///
    /// Returns the number of bytes spent on padding.
    pub fn retire<P: RegionProvider>(
        &self,
        fill_up: bool,
        regions: &[HeapRegion],
        provider: &mut P,
    ) -> usize {
        let active = self.active.load(Ordering::Acquire);
        assert!(
            active != UNINIT,
            "{} alloc region is not initialized",
            self.kind.name()
        );

        let mut waste = 0;
        if active != self.dummy {
            let hr = &regions[active as usize];
            // A region is published as active only after its first
            // allocation, so it can never be empty here.
            assert!(!hr.is_empty(), "the active region should never be empty");

            if fill_up {
                waste = self.fill_up_remaining_space(hr);
            }

            let used_before = self.used_bytes_before.load(Ordering::Relaxed);
            assert!(hr.used_bytes() >= used_before);
            let allocated_bytes = hr.used_bytes() - used_before;
            trace!(
                "{} alloc region retiring {} with {} bytes allocated",
                self.kind.name(),
                hr.index(),
                allocated_bytes
            );
            provider.retire_region(self.kind, hr.index(), allocated_bytes);

            self.used_bytes_before.store(0, Ordering::Relaxed);
            self.active.store(self.dummy, Ordering::Release);
        }
        waste
    }

    /// Closes the allocation interval. Retires the active region without
    /// padding and returns it, or `None` if only the dummy was installed.
    pub fn release<P: RegionProvider>(
        &self,
        regions: &[HeapRegion],
        provider: &mut P,
    ) -> Option<RegionIdx> {
        trace!("{} alloc region releasing", self.kind.name());
        let previous = self.active.load(Ordering::Acquire);
        self.retire(false, regions, provider);
        assert!(
            self.active.load(Ordering::Relaxed) == self.dummy,
            "retire should leave the dummy installed"
        );
        self.active.store(UNINIT, Ordering::Release);
        if previous == self.dummy {
            None
        } else {
            Some(RegionIdx::new(previous))
        }
    }

    fn new_alloc_region_and_allocate<P: RegionProvider>(
        &self,
        word_size: usize,
        force: bool,
        regions: &[HeapRegion],
        provider: &mut P,
    ) -> Option<Address> {
        assert!(
            self.active.load(Ordering::Relaxed) == self.dummy,
            "the previous region should have been retired"
        );
        assert!(self.used_bytes_before.load(Ordering::Relaxed) == 0);

        let idx = provider.allocate_new_region(self.kind, word_size, force)?;
        let hr = &regions[idx.index()];
        self.used_bytes_before
            .store(hr.used_bytes(), Ordering::Relaxed);

        let result = hr.par_allocate(word_size);
        assert!(
            result.is_some(),
            "fresh region {} cannot fit {} words",
            idx,
            word_size
        );
        // Publish the region only after allocating into it, so that an
        // active region is never observed empty.
        self.active.store(idx.raw(), Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
        trace!(
            "{} alloc region installed {} (region {} this interval)",
            self.kind.name(),
            idx,
            self.count()
        );
        result
    }

    /// Claims the region's remaining space with the same CAS the lock free
    /// allocators use, then writes a filler object over it. A failed claim
    /// means a racing allocation got in first, so the retry claims less.
    /// A tail smaller than the minimum filler is left as is.
    fn fill_up_remaining_space(&self, hr: &HeapRegion) -> usize {
        let mut filled = 0;
        let mut free_words = hr.free_words();
        while free_words >= B::Filler::MIN_FILL_WORDS {
            if let Some(start) = hr.par_allocate(free_words) {
                B::Filler::fill(start, free_words);
                filled += free_words * BYTES_IN_WORD;
                break;
            }
            free_words = hr.free_words();
        }
        filled
    }
}
