//! The interface between the region engine and the runtime that embeds it.
//!
//! The engine is runtime neutral. Everything it needs to know about the
//! embedder is collected in the [`RegionBinding`] trait: how to write a
//! filler object over the unused tail of a retired region, and where to
//! report young region ages for pause prediction. A runtime implements the
//! component traits on zero sized types and names them from one
//! `RegionBinding` impl, which is then threaded through the engine as a type
//! parameter.

use crate::policy::region::RegionIdx;
use crate::util::Address;

/// Formats heap gaps as objects the runtime can walk over.
///
/// When a retired region has unused space below its end, the engine asks the
/// binding to write a dead, self describing object over the gap so that heap
/// walkers never trip on raw memory.
pub trait ObjectFiller {
    /// The smallest gap, in words, that `fill` can describe. Gaps smaller
    /// than this are left as is and the caller must tolerate them.
    const MIN_FILL_WORDS: usize;

    /// Write a filler object covering exactly `words` words starting at
    /// `start`. The caller guarantees `words >= MIN_FILL_WORDS` and that the
    /// range lies inside a single committed region.
    fn fill(start: Address, words: usize);
}

/// Receives notifications as regions take on or leave young roles.
///
/// The engine drives these callbacks; it never reads anything back. A
/// runtime with a pause prediction model records the region ages, a minimal
/// one leaves every method defaulted.
pub trait AgePolicy {
    /// A region was pushed onto the eden list. `eden_index` is its position
    /// in allocation order, starting from 0 each mutator phase.
    fn record_eden_region(_region: RegionIdx, _eden_index: usize) {}

    /// A survivor region was assigned `young_index` within the collection
    /// set during post-pause list fixup.
    fn record_survivor_region(_region: RegionIdx, _young_index: usize) {}

    /// Called before the walk that reports survivor regions.
    fn survivors_begin() {}

    /// Called after the last `record_survivor_region` of a fixup pass.
    fn survivors_end() {}
}

/// The types a runtime supplies to the region engine.
pub trait RegionBinding: 'static + Send + Sync + Sized {
    /// The runtime's filler object format.
    type Filler: ObjectFiller;
    /// The runtime's young region age model.
    type Policy: AgePolicy;
}

/// A binding for embedders that need no policy feedback, and for benchmarks.
///
/// Its filler writes nothing, so the heap is only walkable if the embedder
/// never scans retired regions linearly.
pub struct NopBinding;

pub struct NopFiller;

impl ObjectFiller for NopFiller {
    const MIN_FILL_WORDS: usize = 2;

    fn fill(_start: Address, _words: usize) {}
}

pub struct NopPolicy;

impl AgePolicy for NopPolicy {}

impl RegionBinding for NopBinding {
    type Filler = NopFiller;
    type Policy = NopPolicy;
}
