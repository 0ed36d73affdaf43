//! Fixed-capacity containers with inline storage.

// -----------------------------------------------------------------------------
// Modules

mod sorted_map;

// -----------------------------------------------------------------------------
// Exports

pub use sorted_map::{MapError, SortedArrayMap};
