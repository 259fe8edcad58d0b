//! The list of regions currently serving the young generation.
//!
//! Young regions live on an intrusive singly linked list threaded through
//! each region's next young field. Eden regions are pushed at the head as
//! mutators claim them, so the main list is in reverse allocation order.
//! Survivor regions filled during a pause collect on a separate sub list and
//! are transferred into the main list by [`YoungList::reset_auxiliary_lists`]
//! at pause end, where they remain tagged survivor until
//! [`YoungList::retag_survivors_eden`] runs at the start of the next pause.
//!
//! The list also carries the remembered set length sampler: a resumable walk
//! over the main list that sums sparse table occupancy, letting the pause
//! prediction model see how much scanning the current young generation would
//! cost without ever locking the list.

use std::marker::PhantomData;

use super::region::HeapRegion;
use super::RegionIdx;
use crate::vm::{AgePolicy, RegionBinding};

pub struct YoungList<B: RegionBinding> {
    head: Option<RegionIdx>,
    length: usize,
    survivor_head: Option<RegionIdx>,
    survivor_tail: Option<RegionIdx>,
    survivor_length: usize,
    curr: Option<RegionIdx>,
    sampled_rs_lengths: usize,
    last_sampled_rs_lengths: usize,
    phantom: PhantomData<B>,
}

impl<B: RegionBinding> YoungList<B> {
    pub fn new() -> Self {
        YoungList {
            head: None,
            length: 0,
            survivor_head: None,
            survivor_tail: None,
            survivor_length: 0,
            curr: None,
            sampled_rs_lengths: 0,
            last_sampled_rs_lengths: 0,
            phantom: PhantomData,
        }
    }

    /// Tags a free region eden and links it at the head of the main list.
    ///
    /// The region's position in allocation order becomes its young index in
    /// the collection set, and the binding's policy is told about it.
    pub fn push_region(&mut self, idx: RegionIdx, regions: &[HeapRegion]) {
        let hr = &regions[idx.index()];
        assert!(!hr.is_young(), "{:?} is already young", hr);
        assert!(hr.next_young().is_none(), "{:?} is already linked", hr);

        hr.set_next_young(self.head);
        self.head = Some(idx);

        hr.set_eden();
        hr.set_young_index_in_cset(Some(self.length as u32));
        B::Policy::record_eden_region(idx, self.length);
        self.length += 1;
    }

    /// Links an already survivor tagged region at the head of the survivor
    /// sub list, keeping a tail handle for the pause end transfer.
    pub fn add_survivor_region(&mut self, idx: RegionIdx, regions: &[HeapRegion]) {
        let hr = &regions[idx.index()];
        assert!(hr.is_survivor(), "{:?} should be tagged survivor", hr);
        assert!(hr.next_young().is_none(), "{:?} is already linked", hr);

        hr.set_next_young(self.survivor_head);
        if self.survivor_head.is_none() {
            self.survivor_tail = Some(idx);
        }
        self.survivor_head = Some(idx);
        self.survivor_length += 1;
    }

    /// Total young regions across both sub lists.
    pub fn length(&self) -> usize {
        self.length + self.survivor_length
    }

    /// Regions on the main list. Last pause's survivors count here from the
    /// moment they are transferred, even before the pre pause retag runs.
    pub fn eden_length(&self) -> usize {
        self.length
    }

    /// Regions on the survivor sub list awaiting transfer.
    pub fn survivor_length(&self) -> usize {
        self.survivor_length
    }

    /// True when the main list is empty. Pending survivors do not count,
    /// since the transfer precondition is exactly an empty main list.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn first_region(&self) -> Option<RegionIdx> {
        self.head
    }

    pub fn first_survivor_region(&self) -> Option<RegionIdx> {
        self.survivor_head
    }

    pub fn last_survivor_region(&self) -> Option<RegionIdx> {
        self.survivor_tail
    }

    /// Starts a remembered set length sampling walk over the main list.
    pub fn rs_length_sampling_init(&mut self) {
        self.sampled_rs_lengths = 0;
        self.curr = self.head;
    }

    pub fn rs_length_sampling_more(&self) -> bool {
        self.curr.is_some()
    }

    /// Samples one region and advances. When the walk falls off the end the
    /// accumulated total is published for [`YoungList::sampled_rs_lengths`].
    pub fn rs_length_sampling_next(&mut self, regions: &[HeapRegion]) {
        let idx = self.curr.expect("sampling walk already finished");
        let hr = &regions[idx.index()];
        self.sampled_rs_lengths += hr.rem_set().occupied_cards();

        self.curr = hr.next_young();
        if self.curr.is_none() {
            self.last_sampled_rs_lengths = self.sampled_rs_lengths;
        }
    }

    /// The total of the last completed sampling walk. A walk in progress
    /// does not disturb this value.
    pub fn sampled_rs_lengths(&self) -> usize {
        self.last_sampled_rs_lengths
    }

    /// Moves the survivor sub list into the (empty) main list at pause end.
    ///
    /// Each survivor is assigned an incrementing young index in collection
    /// set and reported to the binding's policy between the survivors begin
    /// and end brackets. The regions keep their survivor tag until the next
    /// pause retags them.
    pub fn reset_auxiliary_lists(&mut self, regions: &[HeapRegion]) {
        assert!(self.is_empty(), "young list should be empty");
        debug_assert!(self.check_list_well_formed(regions));

        B::Policy::survivors_begin();
        let mut young_index_in_cset = 0u32;
        let mut curr = self.survivor_head;
        while let Some(idx) = curr {
            let hr = &regions[idx.index()];
            hr.set_young_index_in_cset(Some(young_index_in_cset));
            B::Policy::record_survivor_region(idx, young_index_in_cset as usize);
            young_index_in_cset += 1;
            curr = hr.next_young();
        }
        assert_eq!(
            young_index_in_cset as usize, self.survivor_length,
            "post-condition"
        );
        B::Policy::survivors_end();

        self.head = self.survivor_head;
        self.length = self.survivor_length;
        self.survivor_head = None;
        self.survivor_tail = None;
        self.survivor_length = 0;

        debug_assert!(self.check_list_well_formed(regions));
    }

    /// Retags last pause's survivors, now at the head of the main list, as
    /// eden at the start of the next pause.
    pub fn retag_survivors_eden(&self, regions: &[HeapRegion]) {
        let mut curr = self.head;
        while let Some(idx) = curr {
            let hr = &regions[idx.index()];
            if hr.is_survivor() {
                hr.set_eden_pre_gc();
            }
            curr = hr.next_young();
        }
    }

    /// Unlinks every region from both sub lists and zeroes the counters.
    ///
    /// Tags are left alone. The owning space retags each region as it frees
    /// or promotes it, so the list only severs the intrusive links.
    pub fn empty_list(&mut self, regions: &[HeapRegion]) {
        debug_assert!(self.check_list_well_formed(regions));

        Self::unlink(self.head, regions);
        self.head = None;
        self.length = 0;

        Self::unlink(self.survivor_head, regions);
        self.survivor_head = None;
        self.survivor_tail = None;
        self.survivor_length = 0;

        self.curr = None;
        self.last_sampled_rs_lengths = 0;

        debug_assert!(self.check_list_empty(false));
    }

    /// Forgets the main list without touching the regions. The caller has
    /// already severed each region's links, typically by resetting the
    /// regions for reuse while walking the list.
    pub(crate) fn clear_main_list(&mut self) {
        self.head = None;
        self.length = 0;
        self.curr = None;
    }

    fn unlink(list: Option<RegionIdx>, regions: &[HeapRegion]) {
        let mut curr = list;
        while let Some(idx) = curr {
            let hr = &regions[idx.index()];
            curr = hr.next_young();
            hr.set_next_young(None);
            hr.set_young_index_in_cset(None);
        }
    }

    /// Walks the main list checking tags and the length counter. Logs every
    /// mismatch and reports the verdict without touching any state.
    pub fn check_list_well_formed(&self, regions: &[HeapRegion]) -> bool {
        let mut ret = true;

        let mut walked = 0;
        let mut curr = self.head;
        while let Some(idx) = curr {
            let hr = &regions[idx.index()];
            if !hr.is_young() {
                warn!("young list: {:?} is on the list but tagged {}", hr, hr.kind());
                ret = false;
            }
            walked += 1;
            curr = hr.next_young();
        }
        if walked != self.length {
            warn!(
                "young list: walked {} regions but length says {}",
                walked, self.length
            );
            ret = false;
        }

        ret
    }

    /// Checks that the main list is empty, and optionally that no sampling
    /// total is left over. Report only, like
    /// [`YoungList::check_list_well_formed`].
    pub fn check_list_empty(&self, check_sample: bool) -> bool {
        let mut ret = true;

        if self.length != 0 {
            warn!("young list: length is {}, should be 0", self.length);
            ret = false;
        }
        if check_sample && self.last_sampled_rs_lengths != 0 {
            warn!(
                "young list: last sampled rs length is {}, should be 0",
                self.last_sampled_rs_lengths
            );
            ret = false;
        }
        if self.head.is_some() {
            warn!("young list: head is {:?}, should be none", self.head);
            ret = false;
        }

        ret
    }
}

impl<B: RegionBinding> Default for YoungList<B> {
    fn default() -> Self {
        Self::new()
    }
}
