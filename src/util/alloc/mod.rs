//! The active allocation region machinery shared by the mutator and
//! collector allocation paths.

pub mod alloc_region;

pub use self::alloc_region::{AllocKind, AllocRegion, RegionProvider};
