//! Utilities used by other modules, including addresses, the active allocation
//! region, runtime options, etc.

/// An abstraction of memory address.
pub mod address;
/// The active bump allocation region and its per kind behavior.
pub mod alloc;
/// Size and geometry constants.
pub mod constants;
/// Conversions between different units.
pub mod conversions;
/// The built-in logger.
pub mod logger;
/// Runtime options.
pub mod options;
/// Utilities for tests.
pub mod test_util;

pub use self::address::Address;
pub use self::address::ByteOffset;
pub use self::address::ByteSize;
