//! Offset handles with one base per category and thread.
//!
//! The category is picked at the type level. Its base is queried from the
//! category origin the first time a thread touches it and never changes for
//! the rest of that thread's life. Resolution is a single masked addition.
//!
//! The shipped categories are [`Heap`], seeded from the process heap origin,
//! and [`Stack`], seeded from a stack probe. The stack base is only an
//! approximation of the thread's stack region: it is the address of one
//! local at first use, so frames deeper than that point sit below the base.

use alloc::boxed::Box;
use core::any::TypeId;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use std::thread::LocalKey;

use crate::error::OffsetError;
use crate::free_boxed;
use crate::tag::{Offset, tag_name};

// -----------------------------------------------------------------------------
// Category

/// A base category with a lazily established thread-local base.
///
/// Define new categories with [`category!`](crate::category).
pub trait Category: 'static {
    /// The address a thread's base is seeded from.
    fn origin() -> usize;

    #[doc(hidden)]
    fn local() -> &'static LocalKey<usize>;

    /// This thread's base, established on first call.
    #[inline]
    fn base() -> usize {
        Self::local().with(|base| *base)
    }
}

#[doc(hidden)]
pub fn establish_base<C: Category>() -> usize {
    let base = C::origin();
    log::debug!(
        "{} base established at {base:#x}",
        core::any::type_name::<C>()
    );
    base
}

/// Declares a unit struct implementing [`Category`] with the given origin.
///
/// ```
/// use sliver_ptr::{category, Category, OffsetBox};
///
/// static ARENA: [u64; 16] = [0; 16];
///
/// category! {
///     /// Offsets into `ARENA`.
///     pub struct Arena => ARENA.as_ptr().addr();
/// }
///
/// let third = OffsetBox::<u64, Arena>::offset_from(ARENA.as_ptr().wrapping_add(3).addr());
/// assert_eq!(third.displacement(), 24);
/// assert_eq!(Arena::base(), ARENA.as_ptr().addr());
/// ```
#[macro_export]
macro_rules! category {
    ($(#[$meta:meta])* $vis:vis struct $name:ident => $origin:expr;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name;

        impl $crate::Category for $name {
            #[inline]
            fn origin() -> usize {
                $origin
            }

            fn local() -> &'static ::std::thread::LocalKey<usize> {
                ::std::thread_local! {
                    static BASE: usize = $crate::establish_base::<$name>();
                }
                &BASE
            }
        }
    };
}

category! {
    /// Bases seeded from the process heap origin.
    pub struct Heap => sliver_os::heap_origin();
}

category! {
    /// Bases seeded from a stack probe taken at first use.
    pub struct Stack => sliver_os::stack_probe();
}

// -----------------------------------------------------------------------------
// Scalars

/// Returns `true` for the primitive integer, float, `bool` and `char` types.
fn is_scalar<T: 'static>() -> bool {
    let id = TypeId::of::<T>();
    [
        TypeId::of::<u8>(),
        TypeId::of::<u16>(),
        TypeId::of::<u32>(),
        TypeId::of::<u64>(),
        TypeId::of::<u128>(),
        TypeId::of::<usize>(),
        TypeId::of::<i8>(),
        TypeId::of::<i16>(),
        TypeId::of::<i32>(),
        TypeId::of::<i64>(),
        TypeId::of::<i128>(),
        TypeId::of::<isize>(),
        TypeId::of::<f32>(),
        TypeId::of::<f64>(),
        TypeId::of::<bool>(),
        TypeId::of::<char>(),
    ]
    .contains(&id)
}

// -----------------------------------------------------------------------------
// OffsetBox

/// A two byte owning handle resolved against its category's thread base.
///
/// Primitive scalar payloads (integers, floats, `bool`, `char`) are never
/// freed by the handle; it acts as a view into storage owned elsewhere.
/// Every other payload, aggregates without drop glue included, is freed on
/// drop when the handle is unique.
///
/// # Examples
///
/// ```
/// use sliver_ptr::{Offset, StackBox};
///
/// let base = StackBox::<u32>::base();
/// let offset = StackBox::<u32>::offset_from(base + 100);
/// assert_eq!(offset.displacement(), 100);
/// assert_eq!(StackBox::<u32>::address_from(offset), base + 100);
/// assert_eq!(core::mem::size_of::<StackBox<u32>>(), 2);
/// ```
pub struct OffsetBox<T: 'static, C: Category = Heap> {
    offset: Offset,
    _marker: PhantomData<(*mut T, C)>,
}

/// An [`OffsetBox`] relative to the heap origin.
pub type HeapBox<T> = OffsetBox<T, Heap>;

/// An [`OffsetBox`] relative to the stack probe.
pub type StackBox<T> = OffsetBox<T, Stack>;

impl<T: 'static, C: Category> Drop for OffsetBox<T, C> {
    #[inline]
    fn drop(&mut self) {
        self.free_if_owned();
    }
}

impl<T: 'static, C: Category> Default for OffsetBox<T, C> {
    #[inline(always)]
    fn default() -> Self {
        Self::null()
    }
}

impl<T: 'static, C: Category> OffsetBox<T, C> {
    /// `false` for the primitive scalars the handle never frees.
    #[inline]
    pub fn owns_payload() -> bool {
        !is_scalar::<T>()
    }

    #[inline(always)]
    const fn from_offset(offset: Offset) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn free_if_owned(&mut self) {
        if self.is_unique() && !self.is_null() && Self::owns_payload() {
            // SAFETY: a unique, owning handle holds a `Box` allocation.
            unsafe { free_boxed(self.as_ptr()) }
        }
    }

    /// This thread's base of the category.
    #[inline]
    pub fn base() -> usize {
        C::base()
    }

    /// `(address - base) & DISPLACEMENT_MASK`, as a unique offset.
    #[inline]
    pub fn offset_from(address: usize) -> Offset {
        Offset::from_distance(address.wrapping_sub(C::base()))
    }

    /// `base + (offset & DISPLACEMENT_MASK)`.
    #[inline]
    pub fn address_from(offset: Offset) -> usize {
        offset.resolve(C::base())
    }

    /// Upper bound of the displacement window.
    #[inline(always)]
    pub const fn max_size() -> usize {
        Offset::MAX_SIZE
    }

    #[inline(always)]
    pub const fn null() -> Self {
        Self::from_offset(Offset::NULL)
    }

    /// Moves `value` to the heap and owns it.
    ///
    /// Fails with [`OffsetError::OutOfWindow`] if the allocation is not
    /// addressable from the category base, dropping the value.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a primitive scalar, which the handle would never
    /// free. Use [`from_raw`](Self::from_raw) over owned storage instead.
    pub fn new(value: T) -> Result<Self, OffsetError> {
        assert!(
            Self::owns_payload(),
            "OffsetBox never frees scalar payloads, use `from_raw` over owned storage"
        );
        let raw = Box::into_raw(Box::new(value));
        let address = raw.expose_provenance();
        let base = C::base();
        match Offset::try_from_distance(address.wrapping_sub(base)) {
            Some(offset) => Ok(Self::from_offset(offset)),
            None => {
                let err = OffsetError::OutOfWindow { address, base };
                log::warn!("OffsetBox::new: {err}");
                // SAFETY: `raw` was never handed out.
                unsafe { free_boxed(raw) };
                Err(err)
            }
        }
    }

    /// Takes ownership of `raw`, tag initialized to unique.
    ///
    /// # Safety
    ///
    /// - Unless `T` is a primitive scalar or the handle is weakified before
    ///   it is dropped, `raw` must be null or come from [`Box::into_raw`],
    ///   and no other unique handle may own it.
    /// - `raw` must lie within [`max_size`](Self::max_size) bytes above the
    ///   category base, otherwise the offset silently wraps.
    pub unsafe fn from_raw(raw: *mut T) -> Self {
        if raw.is_null() {
            return Self::null();
        }
        let this = Self::from_offset(Self::offset_from(raw.expose_provenance()));
        debug_assert_eq!(this.as_ptr(), raw, "address outside the displacement window");
        this
    }

    /// Creates a weak handle to the same address.
    ///
    /// # Safety
    ///
    /// The returned handle must not be dereferenced after the owner freed
    /// the pointee.
    #[inline]
    pub unsafe fn weak_alias(&self) -> Self {
        Self::from_offset(self.offset.weakify())
    }

    /// Returns the raw tagged offset.
    #[inline(always)]
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        if self.offset.is_null() {
            core::ptr::null_mut()
        } else {
            core::ptr::with_exposed_provenance_mut(Self::address_from(self.offset))
        }
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
    #[inline]
    pub fn release(&mut self) -> *mut T {
        let ptr = self.as_ptr();
        self.offset = Offset::NULL;
        ptr
    }

    /// Frees the pointee if owned and unique, leaving a null handle.
    #[inline]
    pub fn reset(&mut self) {
        self.free_if_owned();
        self.offset = Offset::NULL;
    }

    /// Frees the pointee if owned and unique, then takes ownership of `raw`.
    ///
    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw).
    #[inline]
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
    /// offsets in place.
    pub fn swap_ownership(&mut self, other: &mut Self) {
        let mine = self.offset;
        self.offset = self.offset.with_tag_of(other.offset);
        other.offset = other.offset.with_tag_of(mine);
    }

    /// Moves the handle to another payload type and category, re-offsetting
    /// the address against the new base. The tag is kept.
    ///
    /// # Safety
    ///
    /// - The pointee must be a valid `U`, freeable as a `Box<U>` unless `U`
    ///   is a primitive scalar or the handle is weak.
    /// - The address must lie within the displacement window of `W`.
    pub unsafe fn rebase<U: 'static, W: Category>(self) -> OffsetBox<U, W> {
        let this = ManuallyDrop::new(self);
        let ptr = this.as_ptr();
        if ptr.is_null() {
            return OffsetBox::from_offset(Offset::NULL.with_tag_of(this.offset));
        }
        let offset = OffsetBox::<U, W>::offset_from(ptr.addr()).with_tag_of(this.offset);
        let moved = OffsetBox::<U, W>::from_offset(offset);
        debug_assert_eq!(moved.as_ptr().addr(), ptr.addr(), "address outside the new window");
        moved
    }
}

impl<T: 'static, C: Category> fmt::Debug for OffsetBox<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OffsetBox<{}>({:p}, {})",
            core::any::type_name::<C>(),
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

    use core::alloc::{GlobalAlloc, Layout};
    use std::alloc::System;

    use super::{Category, Heap, HeapBox, OffsetBox, Stack, StackBox};
    use crate::{Offset, OffsetError};

    std::thread_local! {
        static ORIGIN: Cell<usize> = const { Cell::new(0) };
        static FREES: Cell<usize> = const { Cell::new(0) };
    }

    // Counts deallocations made by the current thread.
    struct CountingAlloc;

    unsafe impl GlobalAlloc for CountingAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            let _ = FREES.try_with(|frees| frees.set(frees.get() + 1));
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    #[global_allocator]
    static GLOBAL: CountingAlloc = CountingAlloc;

    #[derive(Clone, Copy)]
    struct Pair {
        _a: u64,
        _b: u64,
    }

    crate::category! {
        struct Arena => ORIGIN.get();
    }

    crate::category! {
        struct Shifted => ORIGIN.get() - 64;
    }

    struct Counted(Rc<Cell<usize>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn base_plus_hundred_round_trips() {
        let base = StackBox::<u8>::base();
        let offset = StackBox::<u8>::offset_from(base + 100);
        assert_eq!(offset.displacement(), 100);
        assert_eq!(StackBox::<u8>::address_from(Offset::new(100)), base + 100);

        let base = HeapBox::<u8>::base();
        assert_eq!(HeapBox::<u8>::offset_from(base + 100), Offset::new(100));
        assert_eq!(HeapBox::<u8>::address_from(Offset::new(100)), base + 100);
    }

    #[test]
    fn round_trip_over_the_window() {
        let base = Heap::base();
        for distance in (0..Offset::MAX_SIZE).step_by(97) {
            let offset = HeapBox::<u64>::offset_from(base + distance);
            assert_eq!(HeapBox::<u64>::address_from(offset), base + distance);
        }
    }

    #[test]
    fn base_is_fixed_per_thread() {
        fn deeper() -> usize {
            Stack::base()
        }
        let first = Stack::base();
        assert_eq!(deeper(), first);
        assert_eq!(Heap::base(), Heap::base());
    }

    #[test]
    fn scalar_payloads_are_views() {
        std::thread::spawn(|| {
            let slab = Box::into_raw(Box::new([0_u64; 32]));
            ORIGIN.set(slab.addr());

            let mut handles: [OffsetBox<u64, Arena>; 4] = Default::default();
            for (i, handle) in handles.iter_mut().enumerate() {
                unsafe { handle.reset_with(slab.cast::<u64>().add(i * 2)) };
                *handle.get_mut().unwrap() = i as u64 + 10;
            }
            assert!(!OffsetBox::<u64, Arena>::owns_payload());
            assert_eq!(handles[3].offset().displacement(), 48);
            assert!(handles.iter().all(OffsetBox::is_unique));

            drop(handles);
            let slab = unsafe { Box::from_raw(slab) };
            assert_eq!(slab[..8], [10, 0, 11, 0, 12, 0, 13, 0]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unique_frees_once_weak_never() {
        std::thread::spawn(|| {
            let drops = Rc::new(Cell::new(0));
            let raw = Box::into_raw(Box::new(Counted(drops.clone())));
            ORIGIN.set(raw.addr());

            let owner = unsafe { OffsetBox::<Counted, Arena>::from_raw(raw) };
            assert_eq!(owner.offset(), Offset::new(0));
            let mut view = unsafe { OffsetBox::<Counted, Arena>::from_raw(raw) };
            view.weakify();

            drop(view);
            assert_eq!(drops.get(), 0);
            drop(owner);
            assert_eq!(drops.get(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn new_is_checked_against_the_window() {
        std::thread::spawn(|| {
            let drops = Rc::new(Cell::new(0));
            // An origin far above any allocation puts every address out of window.
            ORIGIN.set(usize::MAX - 0x1000);
            match OffsetBox::<Counted, Arena>::new(Counted(drops.clone())) {
                Err(OffsetError::OutOfWindow { base, .. }) => assert_eq!(base, usize::MAX - 0x1000),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(drops.get(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn swap_ownership_and_reset() {
        std::thread::spawn(|| {
            let drops = Rc::new(Cell::new(0));
            let raw = Box::into_raw(Box::new(Counted(drops.clone())));
            ORIGIN.set(raw.addr());

            let mut owner = unsafe { OffsetBox::<Counted, Arena>::from_raw(raw) };
            let mut view = unsafe { owner.weak_alias() };
            owner.swap_ownership(&mut view);
            assert!(owner.is_weak() && view.is_unique());

            owner.reset();
            assert!(owner.is_null());
            assert_eq!(drops.get(), 0);

            let moved = view.release();
            assert_eq!(moved, raw);
            drop(view);
            assert_eq!(drops.get(), 0);
            drop(unsafe { Box::from_raw(moved) });
            assert_eq!(drops.get(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn rebase_moves_between_categories() {
        std::thread::spawn(|| {
            let drops = Rc::new(Cell::new(0));
            let raw = Box::into_raw(Box::new(Counted(drops.clone())));
            ORIGIN.set(raw.addr());

            let mut handle = unsafe { OffsetBox::<Counted, Arena>::from_raw(raw) };
            handle.weakify();
            let shifted: OffsetBox<Counted, Shifted> = unsafe { handle.rebase() };
            assert_eq!(shifted.offset().displacement(), 64);
            assert!(shifted.is_weak());
            assert_eq!(shifted.as_ptr(), raw);

            let mut shifted = shifted;
            shifted.uniquify();
            drop(shifted);
            assert_eq!(drops.get(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn aggregates_without_drop_glue_are_freed() {
        std::thread::spawn(|| {
            let raw = Box::into_raw(Box::new(Pair { _a: 1, _b: 2 }));
            ORIGIN.set(raw.addr());
            assert!(OffsetBox::<Pair, Arena>::owns_payload());
            assert!(OffsetBox::<[u8; 4], Arena>::owns_payload());

            let handle = unsafe { OffsetBox::<Pair, Arena>::from_raw(raw) };
            let view = unsafe { handle.weak_alias() };
            let before = FREES.get();
            drop(view);
            assert_eq!(FREES.get(), before);
            drop(handle);
            assert_eq!(FREES.get(), before + 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn scalars_are_never_freed() {
        std::thread::spawn(|| {
            let raw = Box::into_raw(Box::new(7_u64));
            ORIGIN.set(raw.addr());

            let handle = unsafe { OffsetBox::<u64, Arena>::from_raw(raw) };
            assert!(handle.is_unique());
            let before = FREES.get();
            drop(handle);
            assert_eq!(FREES.get(), before);

            drop(unsafe { Box::from_raw(raw) });
            assert_eq!(FREES.get(), before + 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn new_accepts_plain_arrays() {
        std::thread::spawn(|| {
            ORIGIN.set(usize::MAX - 0x1000);
            let before = FREES.get();
            let result = OffsetBox::<[u8; 64], Arena>::new([3; 64]);
            assert!(matches!(result, Err(OffsetError::OutOfWindow { .. })));
            // The rejected allocation is reclaimed.
            assert_eq!(FREES.get(), before + 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "never frees scalar payloads")]
    fn new_rejects_scalars() {
        let _ = HeapBox::<u32>::new(5);
    }
}
