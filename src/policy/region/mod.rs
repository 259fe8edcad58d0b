//! A region based heap layout in the style of garbage-first collectors.
//!
//! The heap is carved into equally sized regions. Each region carries a life
//! cycle tag ([`RegionKind`]), a bump pointer for allocation, and a sparse
//! remembered set that records which cards in other regions may point into
//! it. [`RegionSpace`] owns the region table and the committed/free
//! bookkeeping, [`seq::RegionSeq`] maintains the address ordered view used
//! for humongous allocation, and [`young_list::YoungList`] threads the eden
//! and survivor regions into the lists the collector walks.

pub mod region;
pub mod region_type;
pub mod regionspace;
pub mod remset;
pub mod seq;
pub mod young_list;

pub use region::HeapRegion;
pub use region_type::{RegionKind, TransitionError};
pub use regionspace::RegionSpace;
pub use remset::{AddCardResult, SparsePRT, CARDS_PER_ENTRY};
pub use seq::{IterOutcome, RegionSeq};
pub use young_list::YoungList;

use std::fmt;

use static_assertions::const_assert;

/// Index of a region within the space's region table.
///
/// Regions are numbered in address order, so comparing indices compares
/// region base addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionIdx(u32);

impl RegionIdx {
    /// Raw value standing for "no region" in packed atomic fields.
    pub(crate) const INVALID: u32 = u32::MAX;

    pub const fn new(raw: u32) -> Self {
        RegionIdx(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The index as a `usize`, for region table lookup.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Pack an optional index into a raw `u32` for storage in an atomic.
    pub(crate) fn encode(idx: Option<RegionIdx>) -> u32 {
        match idx {
            Some(idx) => {
                debug_assert!(idx.0 != Self::INVALID);
                idx.0
            }
            None => Self::INVALID,
        }
    }

    /// Unpack a raw `u32` written by [`RegionIdx::encode`].
    pub(crate) fn decode(raw: u32) -> Option<RegionIdx> {
        if raw == Self::INVALID {
            None
        } else {
            Some(RegionIdx(raw))
        }
    }
}

impl fmt::Display for RegionIdx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a card within a single region.
///
/// Sixteen bits cover every card of the largest supported region, so sparse
/// remembered set entries can store cards compactly.
pub type CardIdx = u16;

const_assert!(
    crate::util::options::MAX_REGION_SIZE / crate::util::constants::BYTES_IN_CARD <= 1 << 16
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_idx_encode_decode() {
        assert_eq!(RegionIdx::decode(RegionIdx::encode(None)), None);
        let idx = RegionIdx::new(42);
        assert_eq!(RegionIdx::decode(RegionIdx::encode(Some(idx))), Some(idx));
        assert_eq!(RegionIdx::decode(RegionIdx::INVALID), None);
    }

    #[test]
    fn region_idx_orders_by_raw() {
        assert!(RegionIdx::new(3) < RegionIdx::new(7));
        assert_eq!(format!("{}", RegionIdx::new(12)), "#12");
    }
}
