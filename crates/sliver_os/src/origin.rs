//! Process wide reference addresses.

use alloc::boxed::Box;
use alloc::vec::Vec;
use std::sync::OnceLock;

#[cfg(target_os = "linux")]
use crate::map::{RegionKind, memory_map};

// -----------------------------------------------------------------------------
// Heap origin

static HEAP_ORIGIN: OnceLock<usize> = OnceLock::new();

/// The origin of the process heap, resolved once per process.
///
/// On Linux this is the start of the `[heap]` mapping. Elsewhere, or when
/// the memory map cannot be read, it is the address of a leaked sentinel
/// allocation, which lies inside the allocator's arena.
///
/// ```
/// assert_eq!(sliver_os::heap_origin(), sliver_os::heap_origin());
/// assert_ne!(sliver_os::heap_origin(), 0);
/// ```
pub fn heap_origin() -> usize {
    *HEAP_ORIGIN.get_or_init(|| match mapped_heap() {
        Some(start) => start,
        None => {
            let sentinel = Box::leak(Box::new(0_u8));
            let address = core::ptr::from_mut(sentinel).addr();
            log::debug!("no [heap] mapping, heap origin falls back to sentinel at {address:#x}");
            address
        }
    })
}

#[cfg(target_os = "linux")]
fn mapped_heap() -> Option<usize> {
    match memory_map() {
        Ok(regions) => regions
            .iter()
            .find(|region| region.kind == RegionKind::Heap)
            .map(|region| region.start),
        Err(err) => {
            log::debug!("memory map unavailable: {err}");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
#[inline(always)]
fn mapped_heap() -> Option<usize> {
    None
}

// -----------------------------------------------------------------------------
// Stack probe

/// Address of a local variable in a frame that is never inlined.
///
/// The value approximates the stack pointer of the caller.
#[inline(never)]
pub fn stack_probe() -> usize {
    let probe = 0_u8;
    core::hint::black_box(core::ptr::from_ref(&probe)).addr()
}

// -----------------------------------------------------------------------------
// Heaps

/// An opaque handle naming one heap of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapHandle(usize);

impl HeapHandle {
    /// The lowest address belonging to the heap.
    #[inline(always)]
    pub const fn origin(self) -> usize {
        self.0
    }
}

/// Handles of the process heaps.
///
/// On Linux there is one handle per `[heap]` mapping. Otherwise, or when the
/// map is unreadable, the single handle at [`heap_origin`] is returned.
pub fn heaps() -> Vec<HeapHandle> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(regions) = memory_map() {
            let heaps: Vec<_> = regions
                .iter()
                .filter(|region| region.kind == RegionKind::Heap)
                .map(|region| HeapHandle(region.start))
                .collect();
            if !heaps.is_empty() {
                return heaps;
            }
        }
    }
    alloc::vec![HeapHandle(heap_origin())]
}

// -----------------------------------------------------------------------------
// Tests
