//! Offset handles resolved against a bounded table of segments.
//!
//! A [`SegmentTable`] tracks up to [`MAX_SEGMENTS`] disjoint base regions per
//! domain and thread, so one narrow offset type can address objects living
//! in independent allocations. Each handle remembers the slot of the segment
//! it was resolved against; the slot of an assigned segment never moves.

use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use std::thread::LocalKey;

use crate::__private::DomainCell;
use crate::error::OffsetError;
use crate::free_boxed;
use crate::tag::{Offset, tag_name};

/// Number of segments a table can track.
pub const MAX_SEGMENTS: usize = 8;

const NO_SLOT: u8 = u8::MAX;

// -----------------------------------------------------------------------------
// Segment

/// One tracked base region: `[base, base + MAX_SIZE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    base: usize,
    ref_count: usize,
}

impl Segment {
    const EMPTY: Self = Self {
        base: 0,
        ref_count: 0,
    };

    #[inline(always)]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    pub const fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// A segment without references is free for reuse.
    #[inline(always)]
    pub const fn is_live(&self) -> bool {
        self.ref_count != 0
    }

    #[inline(always)]
    pub const fn contains(&self, address: usize) -> bool {
        self.base <= address && address - self.base < Offset::MAX_SIZE
    }
}

// -----------------------------------------------------------------------------
// SegmentTable

/// Bounded set of `(base, ref_count)` entries, scanned in base order.
///
/// # Examples
///
/// ```
/// use sliver_ptr::{OffsetError, SegmentTable};
///
/// let mut table = SegmentTable::new();
/// for i in 1..=8 {
///     table.acquire(i * 0x10_0000).unwrap();
/// }
/// assert_eq!(
///     table.acquire(0x100_0000),
///     Err(OffsetError::SegmentsExhausted { capacity: 8 }),
/// );
///
/// // An address inside a known segment only bumps its count.
/// let (slot, offset) = table.acquire(0x30_0000 + 100).unwrap();
/// assert_eq!(offset.displacement(), 100);
/// assert_eq!(table.segment(slot).unwrap().ref_count(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTable {
    slots: [Segment; MAX_SEGMENTS],
    // Assigned slots sorted by base.
    order: [u8; MAX_SEGMENTS],
    len: u8,
}

impl Default for SegmentTable {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentTable {
    pub const CAPACITY: usize = MAX_SEGMENTS;

    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            slots: [Segment::EMPTY; MAX_SEGMENTS],
            order: [0; MAX_SEGMENTS],
            len: 0,
        }
    }

    /// Number of assigned slots, live or not.
    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of segments with at least one reference.
    pub fn live(&self) -> usize {
        self.segments().filter(|(_, seg)| seg.is_live()).count()
    }

    #[inline]
    pub fn segment(&self, slot: u8) -> Option<&Segment> {
        if (slot as usize) < self.len() {
            Some(&self.slots[slot as usize])
        } else {
            None
        }
    }

    /// Assigned segments with their slots, in ascending base order.
    pub fn segments(&self) -> impl Iterator<Item = (u8, &Segment)> {
        self.order[..self.len()]
            .iter()
            .map(|&slot| (slot, &self.slots[slot as usize]))
    }

    /// Returns the slot of the first segment (by base) containing `address`.
    ///
    /// The scan stops at the first base above `address`.
    pub fn find(&self, address: usize) -> Option<u8> {
        for (slot, seg) in self.segments() {
            if seg.base > address {
                break;
            }
            if seg.contains(address) {
                return Some(slot);
            }
        }
        None
    }

    /// Registers a reference to `address`, returning its slot and offset.
    ///
    /// A containing segment is reused (revived if unreferenced). Otherwise a
    /// new segment based at `address` takes the next free slot, or the first
    /// unreferenced one once all slots are assigned. The table is left
    /// untouched when every slot is referenced.
    pub fn acquire(&mut self, address: usize) -> Result<(u8, Offset), OffsetError> {
        if let Some(slot) = self.find(address) {
            let seg = &mut self.slots[slot as usize];
            if seg.ref_count == 0 {
                log::trace!("segment {slot} revived at {:#x}", seg.base);
            }
            seg.ref_count += 1;
            return Ok((slot, Offset::from_distance(address - seg.base)));
        }

        let slot = if self.len() < MAX_SEGMENTS {
            let slot = self.len;
            self.order[self.len()] = slot;
            self.len += 1;
            slot
        } else if let Some(slot) = self.slots.iter().position(|seg| !seg.is_live()) {
            slot as u8
        } else {
            log::warn!("segment table exhausted while registering {address:#x}");
            return Err(OffsetError::SegmentsExhausted {
                capacity: MAX_SEGMENTS,
            });
        };

        self.slots[slot as usize] = Segment {
            base: address,
            ref_count: 1,
        };
        self.sort();
        log::trace!("segment {slot} registered at {address:#x}");
        Ok((slot, Offset::new(0)))
    }

    /// Adds a reference to an assigned slot.
    #[inline]
    pub fn retain(&mut self, slot: u8) {
        debug_assert!((slot as usize) < self.len(), "retained an unassigned slot");
        self.slots[slot as usize].ref_count += 1;
    }

    /// Drops a reference to an assigned slot. The slot stays assigned.
    pub fn release(&mut self, slot: u8) {
        let seg = &mut self.slots[slot as usize];
        debug_assert!(seg.ref_count > 0, "released an unreferenced segment");
        seg.ref_count = seg.ref_count.saturating_sub(1);
        if seg.ref_count == 0 {
            log::trace!("segment {slot} freed");
        }
    }

    /// Truncating distance from the base of `slot`.
    #[inline]
    pub fn offset_from(&self, slot: u8, address: usize) -> Offset {
        Offset::from_distance(address.wrapping_sub(self.slots[slot as usize].base))
    }

    #[inline]
    pub fn address_from(&self, slot: u8, offset: Offset) -> usize {
        offset.resolve(self.slots[slot as usize].base)
    }

    fn sort(&mut self) {
        let slots = &self.slots;
        let len = self.len as usize;
        self.order[..len].sort_unstable_by_key(|&slot| slots[slot as usize].base);
    }
}

// -----------------------------------------------------------------------------
// SegmentDomain

/// A marker type owning one thread-local [`SegmentTable`].
///
/// Implement it with [`segment_domain!`](crate::segment_domain).
pub trait SegmentDomain: 'static {
    #[doc(hidden)]
    fn local() -> &'static LocalKey<DomainCell<SegmentTable>>;

    /// Returns a copy of this thread's table of the domain.
    ///
    /// The live table is only changed by the handles themselves:
    ///
    /// ```compile_fail
    /// use sliver_ptr::{DefaultDomain, SegmentDomain};
    ///
    /// DefaultDomain::local().with(|cell| cell.with_mut(|table| table.release(0)));
    /// ```
    #[inline]
    fn snapshot() -> SegmentTable {
        Self::local().with(DomainCell::snapshot)
    }
}

/// Mutable access to the live table, for handles only.
pub(crate) trait TableAccess: SegmentDomain {
    #[inline]
    fn with<R>(func: impl FnOnce(&mut SegmentTable) -> R) -> R {
        Self::local().with(|cell| cell.with_mut(func))
    }
}

impl<D: SegmentDomain> TableAccess for D {}

/// Implements [`SegmentDomain`] for the given types, giving each one its
/// own thread-local segment table.
#[macro_export]
macro_rules! segment_domain {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::SegmentDomain for $ty {
            fn local() -> &'static ::std::thread::LocalKey<
                $crate::__private::DomainCell<$crate::SegmentTable>
            > {
                ::std::thread_local! {
                    static TABLE: $crate::__private::DomainCell<$crate::SegmentTable> =
                        const { $crate::__private::DomainCell::new($crate::SegmentTable::new()) };
                }
                &TABLE
            }
        }
    )+};
}

// -----------------------------------------------------------------------------
// SegmentBox

/// An owning handle resolved against one segment of its domain's table.
///
/// The handle stores the tagged offset plus the slot of its segment, which
/// is what lets several disjoint regions share one offset type.
///
/// # Examples
///
/// ```
/// use sliver_ptr::{DefaultDomain, SegmentBox, SegmentDomain};
///
/// let a = SegmentBox::<[u64; 8192]>::new([1; 8192]).unwrap();
/// let b = SegmentBox::<[u64; 8192]>::new([2; 8192]).unwrap();
///
/// // Two 64 KiB allocations never share a segment.
/// assert_ne!(a.slot(), b.slot());
/// assert_eq!(DefaultDomain::snapshot().live(), 2);
/// assert_eq!(b.get().unwrap()[0], 2);
/// ```
pub struct SegmentBox<T, D: SegmentDomain = crate::DefaultDomain> {
    offset: Offset,
    slot: u8,
    _marker: PhantomData<(*mut T, D)>,
}

impl<T, D: SegmentDomain> Drop for SegmentBox<T, D> {
    fn drop(&mut self) {
        if self.slot == NO_SLOT {
            return;
        }
        let ptr = D::with(|table| {
            let ptr = self.resolve(table);
            table.release(self.slot);
            ptr
        });
        if self.offset.is_unique() {
            // SAFETY: a unique handle owns a `Box` allocation.
            unsafe { free_boxed(ptr) }
        }
    }
}

impl<T, D: SegmentDomain> Default for SegmentBox<T, D> {
    #[inline(always)]
    fn default() -> Self {
        Self::null()
    }
}

impl<T, D: SegmentDomain> SegmentBox<T, D> {
    #[inline]
    fn resolve(&self, table: &SegmentTable) -> *mut T {
        core::ptr::with_exposed_provenance_mut(table.address_from(self.slot, self.offset))
    }

    /// Upper bound of the displacement window of one segment.
    #[inline(always)]
    pub const fn max_size() -> usize {
        Offset::MAX_SIZE
    }

    /// Creates a null handle. It references no segment.
    #[inline(always)]
    pub const fn null() -> Self {
        Self {
            offset: Offset::NULL,
            slot: NO_SLOT,
            _marker: PhantomData,
        }
    }

    /// Moves `value` to the heap and owns it.
    ///
    /// Fails with [`OffsetError::SegmentsExhausted`] when the allocation
    /// needs a new segment and all of them are referenced. The value is
    /// dropped in that case.
    pub fn new(value: T) -> Result<Self, OffsetError> {
        let raw = Box::into_raw(Box::new(value));
        // SAFETY: `raw` comes from `Box::into_raw` and is owned by nobody else.
        unsafe { Self::from_raw(raw) }.inspect_err(|_| {
            // SAFETY: `raw` was never handed out.
            unsafe { free_boxed(raw) }
        })
    }

    /// Takes ownership of `raw`, tag initialized to unique.
    ///
    /// # Safety
    ///
    /// - `raw` must be null or come from [`Box::into_raw`].
    /// - No other unique handle may own `raw`.
    pub unsafe fn from_raw(raw: *mut T) -> Result<Self, OffsetError> {
        if raw.is_null() {
            return Ok(Self::null());
        }
        let (slot, offset) = D::with(|table| table.acquire(raw.expose_provenance()))?;
        Ok(Self {
            offset,
            slot,
            _marker: PhantomData,
        })
    }

    /// Creates a weak handle to the same address in the same segment.
    ///
    /// # Safety
    ///
    /// The returned handle must not be dereferenced after the owner freed
    /// the pointee.
    pub unsafe fn weak_alias(&self) -> Self {
        if self.slot != NO_SLOT {
            D::with(|table| table.retain(self.slot));
        }
        Self {
            offset: self.offset.weakify(),
            slot: self.slot,
            _marker: PhantomData,
        }
    }

    /// Returns the raw tagged offset.
    #[inline(always)]
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    /// Returns the slot of the owning segment, `None` for null handles.
    #[inline(always)]
    pub const fn slot(&self) -> Option<u8> {
        if self.slot == NO_SLOT {
            None
        } else {
            Some(self.slot)
        }
    }

    /// Returns a copy of the owning segment.
    pub fn segment(&self) -> Option<Segment> {
        let slot = self.slot()?;
        D::with(|table| table.segment(slot).copied())
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        if self.slot == NO_SLOT {
            return core::ptr::null_mut();
        }
        D::with(|table| self.resolve(table))
    }

    #[inline(always)]
    pub const fn is_null(&self) -> bool {
        self.slot == NO_SLOT
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
        // SAFETY: non-null handles resolve to a live value by contract.
        unsafe { self.as_ptr().as_ref() }
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: see `get`.
        unsafe { self.as_ptr().as_mut() }
    }

    /// Hands back the address and leaves a null handle, dropping the
    /// segment reference.
    pub fn release(&mut self) -> *mut T {
        if self.slot == NO_SLOT {
            return core::ptr::null_mut();
        }
        let ptr = D::with(|table| {
            let ptr = self.resolve(table);
            table.release(self.slot);
            ptr
        });
        self.slot = NO_SLOT;
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

    /// Takes ownership of `raw`, then frees the old pointee if it was unique.
    ///
    /// On error the handle is left unchanged.
    ///
    /// # Safety
    ///
    /// Same as [`from_raw`](Self::from_raw).
    pub unsafe fn reset_with(&mut self, raw: *mut T) -> Result<(), OffsetError> {
        *self = unsafe { Self::from_raw(raw) }?;
        Ok(())
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

    /// Exchanges the ownership tags of `self` and `other`, leaving offsets
    /// and segments in place.
    pub fn swap_ownership(&mut self, other: &mut Self) {
        let mine = self.offset;
        self.offset = self.offset.with_tag_of(other.offset);
        other.offset = other.offset.with_tag_of(mine);
    }

    /// Reinterprets the pointee type, keeping offset, tag and segment.
    ///
    /// # Safety
    ///
    /// The allocation must be valid to free as a `Box<U>`, and the pointee
    /// must be a valid `U`.
    pub unsafe fn cast<U>(self) -> SegmentBox<U, D> {
        let this = ManuallyDrop::new(self);
        SegmentBox {
            offset: this.offset,
            slot: this.slot,
            _marker: PhantomData,
        }
    }
}

impl<T, D: SegmentDomain> fmt::Debug for SegmentBox<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SegmentBox({:p}, slot {:?}, {})",
            self.as_ptr(),
            self.slot(),
            tag_name(self.is_weak())
        )
    }
}

// -----------------------------------------------------------------------------
// Tests
