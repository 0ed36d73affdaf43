//! Offset handles resolved against a single thread-local base.
//!
//! Each [`SingleDomain`] owns one [`SingleBase`] per thread. The base is
//! snapped on the first acquisition (to the first handle's address, or to a
//! stack probe for null handles) and counts the live handles that use it.
//! Once the count drops back to zero the next acquisition snaps again.
//!
//! Only one base region exists per domain and thread: two objects more than
//! [`Offset::MAX_SIZE`] bytes apart cannot share a domain.

use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use std::thread::LocalKey;

use crate::__private::DomainCell;
use crate::error::OffsetError;
use crate::free_boxed;
use crate::tag::{Offset, tag_name};

// -----------------------------------------------------------------------------
// SingleBase

/// One base address with a naive reference count.
///
/// ```
/// use sliver_ptr::SingleBase;
///
/// let mut base = SingleBase::new();
/// assert_eq!(base.acquire(Some(0x1000)), 0x1000);
/// // Later anchors do not move an established base.
/// assert_eq!(base.acquire(Some(0x9000)), 0x1000);
///
/// let offset = base.offset_from(0x1000 + 100);
/// assert_eq!(offset.displacement(), 100);
/// assert_eq!(base.address_from(offset), 0x1000 + 100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleBase {
    base: usize,
    ref_count: usize,
}

impl Default for SingleBase {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleBase {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            base: 0,
            ref_count: 0,
        }
    }

    #[inline(always)]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub const fn ref_count(&self) -> usize {
        self.ref_count
    }

    #[inline(always)]
    pub const fn is_established(&self) -> bool {
        self.ref_count != 0
    }

    /// Registers one more handle and returns the base it resolves against.
    ///
    /// When no handle is registered the base snaps to `anchor`, or to the
    /// current stack probe address if no anchor is given.
    pub fn acquire(&mut self, anchor: Option<usize>) -> usize {
        if self.ref_count == 0 {
            self.base = anchor.unwrap_or_else(sliver_os::stack_probe);
            log::debug!("single base established at {:#x}", self.base);
        }
        self.ref_count += 1;
        self.base
    }

    /// Unregisters one handle.
    #[inline]
    pub fn release(&mut self) {
        debug_assert!(self.ref_count > 0, "released an unregistered handle");
        self.ref_count = self.ref_count.saturating_sub(1);
    }

    /// Truncating distance from the base.
    #[inline(always)]
    pub const fn offset_from(&self, address: usize) -> Offset {
        Offset::from_distance(address.wrapping_sub(self.base))
    }

    /// Checked distance from the base.
    #[inline]
    pub const fn try_offset_from(&self, address: usize) -> Result<Offset, OffsetError> {
        match Offset::try_from_distance(address.wrapping_sub(self.base)) {
            Some(offset) => Ok(offset),
            None => Err(OffsetError::OutOfWindow {
                address,
                base: self.base,
            }),
        }
    }

    #[inline(always)]
    pub const fn address_from(&self, offset: Offset) -> usize {
        offset.resolve(self.base)
    }
}

// -----------------------------------------------------------------------------
// SingleDomain

/// A marker type owning one thread-local [`SingleBase`].
///
/// Implement it with [`single_domain!`](crate::single_domain).
pub trait SingleDomain: 'static {
    #[doc(hidden)]
    fn local() -> &'static LocalKey<DomainCell<SingleBase>>;

    /// Returns a copy of this thread's base of the domain.
    ///
    /// The live base is only changed by the handles themselves:
    ///
    /// ```compile_fail
    /// use sliver_ptr::{DefaultDomain, SingleDomain};
    ///
    /// DefaultDomain::local().with(|cell| cell.with_mut(|base| base.release()));
    /// ```
    #[inline]
    fn snapshot() -> SingleBase {
        Self::local().with(DomainCell::snapshot)
    }
}

/// Mutable access to the live base, for handles only.
pub(crate) trait BaseAccess: SingleDomain {
    #[inline]
    fn with<R>(func: impl FnOnce(&mut SingleBase) -> R) -> R {
        Self::local().with(|cell| cell.with_mut(func))
    }
}

impl<D: SingleDomain> BaseAccess for D {}

/// Implements [`SingleDomain`] for the given types, giving each one its
/// own thread-local base.
///
/// ```
/// use sliver_ptr::{single_domain, SingleDomain};
///
/// pub struct Scratch;
/// single_domain!(Scratch);
///
/// assert_eq!(Scratch::snapshot().ref_count(), 0);
/// ```
#[macro_export]
macro_rules! single_domain {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::SingleDomain for $ty {
            fn local() -> &'static ::std::thread::LocalKey<
                $crate::__private::DomainCell<$crate::SingleBase>
            > {
                ::std::thread_local! {
                    static BASE: $crate::__private::DomainCell<$crate::SingleBase> =
                        const { $crate::__private::DomainCell::new($crate::SingleBase::new()) };
                }
                &BASE
            }
        }
    )+};
}

// -----------------------------------------------------------------------------
// BasedBox

/// A two byte owning handle resolved against its domain's single base.
///
/// Behaves like [`TaggedBox`](crate::TaggedBox) with the address replaced
/// by a 15-bit displacement. Every live handle, null ones included, holds a
/// reference on the domain base.
///
/// # Examples
///
/// ```
/// use sliver_ptr::{BasedBox, DefaultDomain, SingleDomain};
///
/// let first = BasedBox::<u64>::new(5).unwrap();
/// assert_eq!(first.get(), Some(&5));
/// assert_eq!(first.offset().displacement(), 0);
/// assert_eq!(DefaultDomain::snapshot().ref_count(), 1);
/// assert_eq!(core::mem::size_of::<BasedBox<u64>>(), 2);
/// ```
pub struct BasedBox<T, D: SingleDomain = crate::DefaultDomain> {
    offset: Offset,
    _marker: PhantomData<(*mut T, D)>,
}

impl<T, D: SingleDomain> Drop for BasedBox<T, D> {
    fn drop(&mut self) {
        let ptr = D::with(|base| {
            let ptr = self.resolve(base);
            base.release();
            ptr
        });
        if self.offset.is_unique() {
            // SAFETY: a unique handle owns a `Box` allocation or is null.
            unsafe { free_boxed(ptr) }
        }
    }
}

impl<T, D: SingleDomain> Default for BasedBox<T, D> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<T, D: SingleDomain> BasedBox<T, D> {
    #[inline(always)]
    const fn from_offset(offset: Offset) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn resolve(&self, base: &SingleBase) -> *mut T {
        if self.offset.is_null() {
            core::ptr::null_mut()
        } else {
            core::ptr::with_exposed_provenance_mut(base.address_from(self.offset))
        }
    }

    /// Upper bound of the displacement window.
    #[inline(always)]
    pub const fn max_size() -> usize {
        Offset::MAX_SIZE
    }

    /// Creates a null handle, registering it on the domain base.
    pub fn null() -> Self {
        D::with(|base| base.acquire(None));
        Self::from_offset(Offset::NULL)
    }

    /// Moves `value` to the heap and owns it.
    ///
    /// Fails with [`OffsetError::OutOfWindow`] if the allocation is not
    /// addressable from the current base. The value is dropped in that case.
    pub fn new(value: T) -> Result<Self, OffsetError> {
        let raw = Box::into_raw(Box::new(value));
        let address = raw.expose_provenance();
        let offset = D::with(|base| {
            base.acquire(Some(address));
            let checked = base.try_offset_from(address);
            if checked.is_err() {
                base.release();
            }
            checked
        });
        match offset {
            Ok(offset) => Ok(Self::from_offset(offset)),
            Err(err) => {
                log::warn!("BasedBox::new: {err}");
                // SAFETY: `raw` was never handed out.
                unsafe { free_boxed(raw) };
                Err(err)
            }
        }
    }

    /// Takes ownership of `raw`, tag initialized to unique.
    ///
    /// If no other handle of the domain is alive, the base snaps to `raw`.
    ///
    /// # Safety
    ///
    /// - `raw` must be null or come from [`Box::into_raw`].
    /// - No other unique handle may own `raw`.
    /// - `raw` must lie within [`max_size`](Self::max_size) bytes above the
    ///   domain base, otherwise the offset silently wraps.
    pub unsafe fn from_raw(raw: *mut T) -> Self {
        if raw.is_null() {
            return Self::null();
        }
        let address = raw.expose_provenance();
        let offset = D::with(|base| {
            base.acquire(Some(address));
            base.offset_from(address)
        });
        let this = Self::from_offset(offset);
        debug_assert_eq!(this.as_ptr(), raw, "address outside the displacement window");
        this
    }

    /// Creates a weak handle to the same address.
    ///
    /// # Safety
    ///
    /// The returned handle must not be dereferenced after the owner freed
    /// the pointee.
    pub unsafe fn weak_alias(&self) -> Self {
        D::with(|base| base.acquire(None));
        Self::from_offset(self.offset.weakify())
    }

    /// Returns the raw tagged offset.
    #[inline(always)]
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    /// Resolves the address, `base + (offset & DISPLACEMENT_MASK)`.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        D::with(|base| self.resolve(base))
    }

    #[inline(always)]
    pub const fn is_null(&self) -> bool {
        self.offset.is_null()
    }

    #[inline(always)]
    pub const fn is_weak(&self) -> bool {
        self.offset.is_weak()
    }

    #[inline(always)]
    pub const fn is_unique(&self) -> bool {
        self.offset.is_unique()
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: non-null offsets resolve to a live value by contract.
        unsafe { self.as_ptr().as_ref() }
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: see `get`.
        unsafe { self.as_ptr().as_mut() }
    }

    /// Hands back the address and leaves a null handle.
    ///
    /// The handle keeps its reference on the domain base.
    pub fn release(&mut self) -> *mut T {
        let ptr = self.as_ptr();
        self.offset = Offset::NULL;
        ptr
    }

    /// Frees the pointee if unique, leaving a null handle.
    pub fn reset(&mut self) {
        let unique = self.is_unique();
        let old = self.release();
        if unique {
            // SAFETY: the handle was unique, so it owned `old`.
            unsafe { free_boxed(old) }
        }
    }

    /// Frees the pointee if unique, then takes ownership of `raw`.
    ///
    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw).
    pub unsafe fn reset_with(&mut self, raw: *mut T) {
        *self = unsafe { Self::from_raw(raw) };
    }

    #[inline]
    pub fn weakify(&mut self) {
        self.offset = self.offset.weakify();
    }

    #[inline]
    pub fn uniquify(&mut self) {
        self.offset = self.offset.uniquify();
    }

    #[inline]
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(self, other);
    }

    /// Exchanges the ownership tags of `self` and `other`, leaving both
    /// offsets in place. See [`TaggedBox::swap_ownership`](crate::TaggedBox::swap_ownership).
    pub fn swap_ownership(&mut self, other: &mut Self) {
        let mine = self.offset;
        self.offset = self.offset.with_tag_of(other.offset);
        other.offset = other.offset.with_tag_of(mine);
    }

    /// Reinterprets the pointee type, keeping offset, tag and base reference.
    ///
    /// # Safety
    ///
    /// The allocation must be valid to free as a `Box<U>`, and the pointee
    /// must be a valid `U`.
    pub unsafe fn cast<U>(self) -> BasedBox<U, D> {
        let this = ManuallyDrop::new(self);
        BasedBox::from_offset(this.offset)
    }
}

impl<T, D: SingleDomain> fmt::Debug for BasedBox<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BasedBox({:p}, {})",
            self.as_ptr(),
            tag_name(self.is_weak())
        )
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use core::cell::Cell;

    use super::{BasedBox, SingleBase, SingleDomain};
    use crate::{Offset, OffsetError};

    struct Local;
    crate::single_domain!(Local);

    struct Counted(Rc<Cell<usize>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn base_snaps_on_first_acquire() {
        let mut base = SingleBase::new();
        assert!(!base.is_established());

        assert_eq!(base.acquire(Some(0x4000)), 0x4000);
        assert_eq!(base.acquire(Some(0x8000)), 0x4000);
        assert_eq!(base.ref_count(), 2);

        base.release();
        base.release();
        assert!(!base.is_established());
        assert_eq!(base.acquire(Some(0x8000)), 0x8000);
    }

    #[test]
    fn null_acquire_uses_stack_probe() {
        let mut base = SingleBase::new();
        let snapped = base.acquire(None);
        assert_ne!(snapped, 0);
    }

    #[test]
    fn checked_offsets() {
        let mut base = SingleBase::new();
        base.acquire(Some(0x1_0000));

        assert_eq!(base.try_offset_from(0x1_0000 + 100), Ok(Offset::new(100)));
        assert_eq!(
            base.try_offset_from(0x1_0000 + Offset::MAX_SIZE),
            Err(OffsetError::OutOfWindow {
                address: 0x1_0000 + Offset::MAX_SIZE,
                base: 0x1_0000
            })
        );
        assert!(base.try_offset_from(0x1_0000 - 1).is_err());
    }

    #[test]
    fn handles_count_references() {
        std::thread::spawn(|| {
            let a = BasedBox::<u32, Local>::new(1).unwrap();
            assert_eq!(Local::snapshot().ref_count(), 1);
            {
                let _null = BasedBox::<u32, Local>::null();
                assert_eq!(Local::snapshot().ref_count(), 2);
            }
            assert_eq!(Local::snapshot().ref_count(), 1);
            drop(a);
            assert_eq!(Local::snapshot().ref_count(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn first_handle_anchors_the_base() {
        std::thread::spawn(|| {
            let slab = Box::into_raw(Box::new([0_u32; 64]));
            // The slab is freed below as an array, so every handle is a view.
            let mut first = unsafe { BasedBox::<u32, Local>::from_raw(slab.cast::<u32>()) };
            first.weakify();
            assert_eq!(Local::snapshot().base(), slab.addr());
            assert_eq!(first.offset().displacement(), 0);

            // A view into the same allocation, 100 bytes above the base.
            let mut inner =
                unsafe { BasedBox::<u32, Local>::from_raw(slab.cast::<u32>().add(25)) };
            inner.weakify();
            assert_eq!(inner.offset().displacement(), 100);
            assert_eq!(inner.as_ptr().addr(), slab.addr() + 100);

            drop(inner);
            drop(first);
            assert_eq!(Local::snapshot().ref_count(), 0);
            drop(unsafe { Box::from_raw(slab) });
        })
        .join()
        .unwrap();
    }

    #[test]
    fn weak_and_unique_free_once() {
        std::thread::spawn(|| {
            let drops = Rc::new(Cell::new(0));
            let owner = BasedBox::<Counted, Local>::new(Counted(drops.clone())).unwrap();
            let view = unsafe { owner.weak_alias() };
            assert_eq!(view.as_ptr(), owner.as_ptr());
            assert_eq!(Local::snapshot().ref_count(), 2);

            drop(view);
            assert_eq!(drops.get(), 0);
            drop(owner);
            assert_eq!(drops.get(), 1);
            assert_eq!(Local::snapshot().ref_count(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn reset_and_swap_ownership() {
        std::thread::spawn(|| {
            let drops = Rc::new(Cell::new(0));
            let mut owner = BasedBox::<Counted, Local>::new(Counted(drops.clone())).unwrap();
            let mut view = unsafe { owner.weak_alias() };

            owner.swap_ownership(&mut view);
            assert!(owner.is_weak());
            assert!(view.is_unique());

            owner.reset();
            assert!(owner.is_null());
            assert_eq!(drops.get(), 0);

            view.reset();
            assert_eq!(drops.get(), 1);
            assert_eq!(Local::snapshot().ref_count(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn addresses_below_base_are_rejected() {
        std::thread::spawn(|| {
            let anchor = Box::into_raw(Box::new(0_u64));
            let handle = unsafe { BasedBox::<u64, Local>::from_raw(anchor) };

            // Anything below the base is out of the window.
            let snapshot = Local::snapshot();
            let below = snapshot.try_offset_from(snapshot.base() - 8);
            assert!(below.is_err());
            drop(handle);
            assert_eq!(Local::snapshot().ref_count(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn out_of_window_new_drops_the_value() {
        std::thread::spawn(|| {
            let mut anchor = 0_u64;
            // A view over a stack local moves the base away from the heap.
            let mut view = unsafe { BasedBox::<u64, Local>::from_raw(&raw mut anchor) };
            view.weakify();
            let base = core::ptr::from_ref(&anchor).addr();
            assert_eq!(Local::snapshot().base(), base);

            let drops = Rc::new(Cell::new(0));
            let result = BasedBox::<Counted, Local>::new(Counted(drops.clone()));
            assert!(matches!(
                result,
                Err(OffsetError::OutOfWindow { base: rejected, .. }) if rejected == base
            ));
            assert_eq!(drops.get(), 1);
            assert_eq!(Local::snapshot().ref_count(), 1);

            drop(view);
            assert_eq!(Local::snapshot().ref_count(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn snapshots_are_detached_copies() {
        std::thread::spawn(|| {
            let handle = BasedBox::<u64, Local>::new(9).unwrap();
            let before = handle.as_ptr();

            let mut copy = Local::snapshot();
            copy.release();
            copy.acquire(Some(0x1000));
            assert_eq!(copy.base(), 0x1000);

            assert_eq!(handle.as_ptr(), before);
            assert_eq!(Local::snapshot().ref_count(), 1);
            assert_eq!(handle.get(), Some(&9));
        })
        .join()
        .unwrap();
    }
}
