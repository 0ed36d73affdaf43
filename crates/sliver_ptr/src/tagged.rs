use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use core::ptr;

use crate::free_boxed;
use crate::tag::{addr_is_weak, tag_addr, tag_name, untag_addr};

// -----------------------------------------------------------------------------
// TaggedBox

/// A `Box`-like exclusive owner that can be turned into a non-owning view
/// by flipping one bit of the stored address.
///
/// The lowest address bit holds the ownership tag, so the handle stays one
/// machine word. A **unique** handle frees its pointee on drop; a **weak**
/// handle never does.
///
/// The pointee type must have an alignment of at least 2, which is checked
/// at compile time by every constructor.
///
/// # Ownership
///
/// Two unique handles over the same address is a logic error that leads to
/// a double free. Nothing detects this at runtime, the caller must weakify
/// all but one of them.
///
/// # Examples
///
/// ```
/// use sliver_ptr::TaggedBox;
///
/// let mut owner = TaggedBox::new(42_u32);
/// assert!(owner.is_unique());
/// assert_eq!(owner.get(), Some(&42));
///
/// owner.weakify();
/// assert!(owner.is_weak());
/// assert_eq!(owner.get(), Some(&42));
///
/// owner.uniquify();
/// assert_eq!(core::mem::size_of::<TaggedBox<u32>>(), core::mem::size_of::<usize>());
/// ```
pub struct TaggedBox<T> {
    raw: *mut T,
    _marker: PhantomData<T>,
}

impl<T> Drop for TaggedBox<T> {
    fn drop(&mut self) {
        if self.is_unique() {
            // SAFETY: a unique handle owns a `Box` allocation or is null.
            unsafe { free_boxed(self.as_ptr()) }
        }
    }
}

impl<T> Default for TaggedBox<T> {
    #[inline(always)]
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Box<T>> for TaggedBox<T> {
    #[inline]
    fn from(boxed: Box<T>) -> Self {
        Self::from_box(boxed)
    }
}

impl<T> TaggedBox<T> {
    const ALIGNED: () = assert!(
        align_of::<T>() >= 2,
        "TaggedBox needs a pointee alignment of at least 2 to store its tag"
    );

    /// Creates an empty unique handle.
    #[inline(always)]
    pub const fn null() -> Self {
        Self {
            raw: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// Moves `value` to the heap and owns it.
    #[inline]
    pub fn new(value: T) -> Self {
        Self::from_box(Box::new(value))
    }

    /// Takes ownership of a boxed value.
    #[inline]
    pub fn from_box(boxed: Box<T>) -> Self {
        let () = Self::ALIGNED;
        Self {
            raw: Box::into_raw(boxed),
            _marker: PhantomData,
        }
    }

    /// Takes ownership of `raw`, tag initialized to unique.
    ///
    /// # Safety
    ///
    /// - `raw` must be null or come from [`Box::into_raw`].
    /// - No other unique handle may own `raw`.
    #[inline]
    pub unsafe fn from_raw(raw: *mut T) -> Self {
        let () = Self::ALIGNED;
        debug_assert!(
            !addr_is_weak(raw),
            "address {raw:p} collides with the ownership tag bit"
        );
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Creates a weak handle to the same address.
    ///
    /// # Safety
    ///
    /// The returned handle must not be dereferenced after the owner freed
    /// the pointee.
    #[inline]
    pub unsafe fn weak_alias(&self) -> Self {
        Self {
            raw: tag_addr(self.raw, true),
            _marker: PhantomData,
        }
    }

    /// Returns the untagged address.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut T {
        untag_addr(self.raw)
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.as_ptr().is_null()
    }

    #[inline(always)]
    pub fn is_weak(&self) -> bool {
        addr_is_weak(self.raw)
    }

    #[inline(always)]
    pub fn is_unique(&self) -> bool {
        !self.is_weak()
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: non-null addresses point to a live value by contract.
        unsafe { self.as_ptr().as_ref() }
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: see `get`, `&mut self` excludes access through this handle.
        unsafe { self.as_ptr().as_mut() }
    }

    /// Hands back the address and leaves an empty handle.
    ///
    /// The caller becomes responsible for freeing a previously unique pointee.
    ///
    /// ```
    /// use sliver_ptr::TaggedBox;
    ///
    /// let mut handle = TaggedBox::new(String::from("moved"));
    /// let raw = handle.release();
    /// assert!(handle.is_null());
    ///
    /// let boxed = unsafe { Box::from_raw(raw) };
    /// assert_eq!(*boxed, "moved");
    /// ```
    #[inline]
    pub fn release(&mut self) -> *mut T {
        untag_addr(mem::replace(&mut self.raw, ptr::null_mut()))
    }

    /// Consumes the handle without freeing the pointee.
    #[inline]
    pub fn into_raw(self) -> *mut T {
        ManuallyDrop::new(self).release()
    }

    /// Frees the pointee if unique, leaving an empty handle.
    pub fn reset(&mut self) {
        let weak = self.is_weak();
        let old = self.release();
        if !weak {
            // SAFETY: the handle was unique, so it owned `old`.
            unsafe { free_boxed(old) }
        }
    }

    /// Frees the pointee if unique, then takes ownership of `raw`.
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
        self.raw = tag_addr(self.raw, true);
    }

    #[inline]
    pub fn uniquify(&mut self) {
        self.raw = tag_addr(self.raw, false);
    }

    /// Exchanges both handles entirely.
    #[inline]
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(self, other);
    }

    /// Exchanges the ownership tags of `self` and `other`, leaving both
    /// addresses in place.
    ///
    /// The number of unique handles across the pair never changes: for a
    /// unique owner and its weak view, the duty to free moves to the view.
    ///
    /// ```
    /// use sliver_ptr::TaggedBox;
    ///
    /// let mut owner = TaggedBox::new(7_u64);
    /// let mut view = unsafe { owner.weak_alias() };
    ///
    /// owner.swap_ownership(&mut view);
    /// assert!(owner.is_weak());
    /// assert!(view.is_unique());
    /// assert_eq!(owner.as_ptr(), view.as_ptr());
    /// ```
    pub fn swap_ownership(&mut self, other: &mut Self) {
        let (mine, theirs) = (self.is_weak(), other.is_weak());
        self.raw = tag_addr(self.raw, theirs);
        other.raw = tag_addr(other.raw, mine);
    }

    /// Reinterprets the pointee type, keeping address and tag.
    ///
    /// # Safety
    ///
    /// The allocation must be valid to free as a `Box<U>`, and the pointee
    /// must be a valid `U`.
    pub unsafe fn cast<U>(self) -> TaggedBox<U> {
        let weak = self.is_weak();
        let raw = self.into_raw();
        let mut cast = unsafe { TaggedBox::from_raw(raw.cast::<U>()) };
        if weak {
            cast.weakify();
        }
        cast
    }
}

impl<T> fmt::Pointer for TaggedBox<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}

impl<T> fmt::Debug for TaggedBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaggedBox({:p}, {})", self.as_ptr(), tag_name(self.is_weak()))
    }
}

// -----------------------------------------------------------------------------
// Tests
