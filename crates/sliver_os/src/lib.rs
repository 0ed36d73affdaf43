//! Operating system queries used to seed pointer bases.
//!
//! - [`heap_origin`] and [`heaps`] locate the process heap.
//! - [`stack_probe`] samples the current stack position.
//! - [`memory_map`] parses the process memory map (`/proc/self/maps`).
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

// -----------------------------------------------------------------------------
// Modules

mod map;
mod origin;

// -----------------------------------------------------------------------------
// Top-level exports

pub use map::{
    MapLoadError, MapParseError, MemoryRegion, Permissions, RegionKind, SELF_MAPS, memory_map,
    parse_map,
};
pub use origin::{HeapHandle, heap_origin, heaps, stack_probe};
