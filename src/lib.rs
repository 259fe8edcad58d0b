//! regiongc is the region level bookkeeping core of a garbage-first style
//! garbage collector. It carves a contiguous heap reserve into fixed size
//! regions and tracks everything a pause needs to know about them, without
//! itself scanning or moving objects.
//!
//! Logically, this crate includes these major parts:
//! * The region table: [`policy::region::HeapRegion`] records carrying a
//!   life cycle tag, a bump pointer, and commit state.
//! * Remembered sets: a sparse per region table
//!   ([`policy::region::SparsePRT`]) recording which foreign cards may hold
//!   references into the region.
//! * Region lists: the address ordered sequence backing humongous
//!   allocation ([`policy::region::RegionSeq`]) and the young lists the
//!   collector walks at pause time ([`policy::region::YoungList`]).
//! * Allocation: one active region per allocation kind
//!   ([`util::alloc::AllocRegion`]) with a lock free fast path, tied
//!   together by [`policy::region::RegionSpace`].
//! * Interfaces: the [`vm::RegionBinding`] trait through which the embedder
//!   supplies filler objects and observes region life cycle events.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod policy;
pub mod util;
pub mod vm;
