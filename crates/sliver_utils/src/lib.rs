//! Small containers used alongside the `sliver` pointer handles.
//!
//! [`extra::SortedArrayMap`] is a fixed-capacity map kept sorted by key. It
//! owns its entries, so storing unique handles in it ties their pointees to
//! the map's lifetime.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![no_std]

// -----------------------------------------------------------------------------
// No STD Support

extern crate alloc;

// -----------------------------------------------------------------------------
// Modules

pub mod extra;
