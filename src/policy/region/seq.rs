//! The address ordered sequence of committed regions.
//!
//! [`RegionSeq`] does not own region records; it orders indices into the
//! space's region table, so every operation that needs region state takes
//! the table as a slice. The sequence drives humongous allocation (finding a
//! contiguous run of empty regions), shrink decisions (counting the free
//! tail), and resumable whole-heap scans.

use crate::util::conversions;
use crate::util::Address;

use super::region::HeapRegion;
use super::RegionIdx;

/// Result of a resumable scan: either every region was visited, or the
/// closure asked to stop early and the caller should resume later from
/// wherever it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterOutcome {
    Complete,
    Stopped,
}

impl IterOutcome {
    pub fn is_complete(self) -> bool {
        self == IterOutcome::Complete
    }
}

pub struct RegionSeq {
    /// Region table indices in address order.
    order: Vec<RegionIdx>,
    /// Rolling start position for humongous searches, so repeated
    /// allocations do not rescan the (likely full) low end of the heap.
    alloc_search_start: usize,
}

impl RegionSeq {
    pub fn new() -> Self {
        RegionSeq {
            order: Vec::new(),
            alloc_search_start: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The region at sequence position `pos`.
    pub fn at(&self, pos: usize) -> RegionIdx {
        self.order[pos]
    }

    pub fn iter(&self) -> impl Iterator<Item = RegionIdx> + '_ {
        self.order.iter().copied()
    }

    /// The sequence position of a region, if it is currently inserted.
    pub fn position_of(&self, idx: RegionIdx, regions: &[HeapRegion]) -> Option<usize> {
        let pos = regions[idx.index()].hrs_index()? as usize;
        debug_assert_eq!(self.order[pos], idx);
        Some(pos)
    }

    /// Checks address ordering and position numbering across the whole
    /// sequence. Logs every mismatch and reports the verdict without
    /// touching any state.
    pub fn verify(&self, regions: &[HeapRegion]) -> bool {
        let mut ret = true;
        for (pos, &idx) in self.order.iter().enumerate() {
            let hr = &regions[idx.index()];
            if hr.hrs_index() != Some(pos as u32) {
                warn!(
                    "region sequence: {:?} at position {} thinks it is at {:?}",
                    hr,
                    pos,
                    hr.hrs_index()
                );
                ret = false;
            }
            if pos > 0 {
                let prev = &regions[self.order[pos - 1].index()];
                if prev.end() > hr.bottom() {
                    warn!(
                        "region sequence: {:?} and {:?} are out of address order",
                        prev, hr
                    );
                    ret = false;
                }
            }
        }
        ret
    }

    /// Add a committed region, keeping the sequence address ordered.
    ///
    /// Appending at the tail is the normal case and costs O(1). A region
    /// landing anywhere else (archive mappings materializing inside the
    /// committed range) forces a full re-sort and position renumbering.
    pub fn insert(&mut self, idx: RegionIdx, regions: &[HeapRegion]) {
        let hr = &regions[idx.index()];
        debug_assert!(
            hr.hrs_index().is_none(),
            "{:?} inserted twice",
            hr
        );
        let in_order = match self.order.last() {
            Some(&last) => regions[last.index()].end() <= hr.bottom(),
            None => true,
        };
        if in_order {
            hr.set_hrs_index(Some(self.order.len() as u32));
            self.order.push(idx);
        } else {
            self.order.push(idx);
            self.order
                .sort_unstable_by_key(|r| regions[r.index()].bottom());
            for (pos, r) in self.order.iter().enumerate() {
                regions[r.index()].set_hrs_index(Some(pos as u32));
            }
        }
    }

    /// Allocate a humongous object of `word_size` words.
    ///
    /// Searches from the rolling cursor first and falls back to a scan from
    /// position zero, so the common case stays cheap while a full pass is
    /// always made before reporting failure.
    pub fn obj_allocate(&mut self, word_size: usize, regions: &[HeapRegion]) -> Option<Address> {
        let cur = self.alloc_search_start;
        match self.alloc_obj_from_region_index(cur, word_size, regions) {
            Some(addr) => Some(addr),
            None => self.alloc_obj_from_region_index(0, word_size, regions),
        }
    }

    /// Scan forward from sequence position `start` for enough contiguous
    /// empty regions to hold `word_size` words. On success the first region
    /// of the run becomes starts-humongous, the rest continues-humongous,
    /// the bump pointers are set to cover the object, and the search cursor
    /// moves past the consumed run.
    pub fn alloc_obj_from_region_index(
        &mut self,
        start: usize,
        word_size: usize,
        regions: &[HeapRegion],
    ) -> Option<Address> {
        debug_assert!(word_size > 0);
        let len = self.order.len();
        let mut first = start;
        let mut cur = start;
        let mut sum_words = 0;
        while cur < len && sum_words < word_size {
            let curhr = &regions[self.order[cur].index()];
            let contiguous = first == cur
                || regions[self.order[cur - 1].index()].end() == curhr.bottom();
            // Archive regions can be empty but are pinned at their address,
            // so only free regions may join a run.
            if curhr.is_free() && curhr.is_empty() && contiguous {
                sum_words += conversions::bytes_to_words_up(curhr.capacity_bytes());
            } else {
                first = cur + 1;
                sum_words = 0;
            }
            cur += 1;
        }
        if sum_words < word_size {
            return None;
        }
        self.alloc_search_start = cur;

        let first_hr = &regions[self.order[first].index()];
        let obj_bottom = first_hr.bottom();
        let obj_end = obj_bottom + conversions::words_to_bytes(word_size);
        first_hr.set_starts_humongous();
        for pos in first..cur {
            let hr = &regions[self.order[pos].index()];
            if pos != first {
                hr.set_continues_humongous();
            }
            // Interior regions are covered entirely by the object; the last
            // one ends where the object does, leaving its tail unused.
            hr.set_top(hr.end().min(obj_end));
        }
        trace!(
            "humongous allocation of {} words spans {} regions at {:?}",
            word_size,
            cur - first,
            obj_bottom
        );
        Some(obj_bottom)
    }

    /// Number of contiguous free empty regions at the address ordered tail.
    /// These are the regions a shrink could give back.
    pub fn free_suffix(&self, regions: &[HeapRegion]) -> usize {
        let len = self.order.len();
        let mut res = 0;
        let mut cur = len;
        while cur > 0 {
            let hr = &regions[self.order[cur - 1].index()];
            if !hr.is_free() || !hr.is_empty() {
                break;
            }
            if cur < len && regions[self.order[cur].index()].bottom() != hr.end() {
                break;
            }
            res += 1;
            cur -= 1;
        }
        res
    }

    /// Visit every region starting at sequence position `start`, wrapping
    /// around to the beginning. The closure returns `true` to stop early;
    /// the outcome tells the caller whether the scan must be resumed.
    pub fn iterate_from<F>(&self, start: usize, regions: &[HeapRegion], mut f: F) -> IterOutcome
    where
        F: FnMut(&HeapRegion) -> bool,
    {
        let len = self.order.len();
        debug_assert!(start <= len);
        for pos in (start..len).chain(0..start) {
            if f(&regions[self.order[pos].index()]) {
                return IterOutcome::Stopped;
            }
        }
        IterOutcome::Complete
    }

    /// Pop up to `num_regions` empty regions off the tail, stopping early at
    /// the first non-empty or humongous region. Returns the removed indices,
    /// highest address first, for the space to uncommit.
    pub fn shrink_by(&mut self, num_regions: usize, regions: &[HeapRegion]) -> Vec<RegionIdx> {
        let mut removed = Vec::new();
        while removed.len() < num_regions {
            let idx = match self.order.last() {
                Some(&idx) => idx,
                None => break,
            };
            let hr = &regions[idx.index()];
            // Humongous and archive spans are pinned in place; shrink works
            // around them by stopping at the first non free region it meets.
            if !hr.is_free() || !hr.is_empty() {
                break;
            }
            self.order.pop();
            hr.set_hrs_index(None);
            removed.push(idx);
        }
        self.alloc_search_start = self.alloc_search_start.min(self.order.len());
        removed
    }
}

impl Default for RegionSeq {
    fn default() -> Self {
        Self::new()
    }
}
