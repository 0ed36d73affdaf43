//! Owning smart pointers that can be demoted to non-owning views by flipping
//! a single ownership bit.
//!
//! Every handle in this crate is either **unique**, and frees its pointee on
//! drop, or **weak**, and never does. The tag travels with the handle, so a
//! view over someone else's allocation costs nothing beyond the handle itself.
//!
//! **TaggedBox**
//!
//! [`TaggedBox<T>`] stores a full address and keeps the tag in the lowest
//! address bit. It needs no thread-local state and works without `std`.
//!
//! **Offset handles**
//!
//! The remaining handles store a two byte [`Offset`]: a 15-bit displacement
//! from a base address plus the tag bit. They differ in where the base comes
//! from, and all keep their bases in thread-local storage.
//!
//! - [`BasedBox`]: one reference counted base per [`SingleDomain`].
//! - [`SegmentBox`]: up to [`MAX_SEGMENTS`] reference counted bases per
//!   [`SegmentDomain`], chosen by address.
//! - [`OffsetBox`]: one fixed base per [`Category`] and thread, see [`Heap`]
//!   and [`Stack`].
//!
//! Offset handles can only reach addresses within [`Offset::MAX_SIZE`] bytes
//! above their base. Checked constructors report [`OffsetError`] when an
//! address falls outside; the unsafe `from_raw` constructors truncate.
//!
//! None of the handles are `Send` or `Sync`.
#![expect(unsafe_code, reason = "Ownership tags live inside raw pointers.")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// -----------------------------------------------------------------------------
// Modules

mod error;
mod tag;
mod tagged;

#[cfg(feature = "std")]
mod category;
#[cfg(feature = "std")]
mod segment;
#[cfg(feature = "std")]
mod single;

// -----------------------------------------------------------------------------
// Top-level exports

pub use error::OffsetError;
pub use tag::{ADDR_WEAK_BIT, Offset, addr_is_weak, tag_addr, untag_addr};
pub use tagged::TaggedBox;

#[cfg(feature = "std")]
pub use category::{Category, Heap, HeapBox, OffsetBox, Stack, StackBox};
#[cfg(feature = "std")]
pub use segment::{MAX_SEGMENTS, Segment, SegmentBox, SegmentDomain, SegmentTable};
#[cfg(feature = "std")]
pub use single::{BasedBox, SingleBase, SingleDomain};

#[doc(hidden)]
#[cfg(feature = "std")]
pub use category::establish_base;

// -----------------------------------------------------------------------------
// Default domain

/// The domain used by [`BasedBox`] and [`SegmentBox`] when none is named.
///
/// Handles over unrelated allocations should use their own domains, declared
/// with [`single_domain!`] or [`segment_domain!`].
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct DefaultDomain;

#[cfg(feature = "std")]
crate::single_domain!(DefaultDomain);

#[cfg(feature = "std")]
crate::segment_domain!(DefaultDomain);

// -----------------------------------------------------------------------------
// Macro support

#[doc(hidden)]
#[cfg(feature = "std")]
pub mod __private {
    use core::cell::RefCell;

    /// Thread-local state of a domain.
    ///
    /// Only this crate can mutate the contents. Everyone else gets copies.
    pub struct DomainCell<T>(RefCell<T>);

    impl<T> DomainCell<T> {
        #[inline(always)]
        pub const fn new(value: T) -> Self {
            Self(RefCell::new(value))
        }

        #[inline]
        pub fn snapshot(&self) -> T
        where
            T: Clone,
        {
            self.0.borrow().clone()
        }

        #[inline]
        pub(crate) fn with_mut<R>(&self, func: impl FnOnce(&mut T) -> R) -> R {
            func(&mut self.0.borrow_mut())
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// Frees a pointer produced by `Box::into_raw`, ignoring null.
///
/// # Safety
///
/// `ptr` must be null or an unaliased `Box<T>` allocation.
#[inline]
pub(crate) unsafe fn free_boxed<T>(ptr: *mut T) {
    if !ptr.is_null() {
        drop(unsafe { alloc::boxed::Box::from_raw(ptr) });
    }
}
