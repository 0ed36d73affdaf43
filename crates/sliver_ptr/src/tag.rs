//! Ownership tag encoding shared by every handle in this crate.
//!
//! Two encodings exist:
//!
//! - [`Offset`]: a `u16` whose top bit is the weak tag and whose low 15 bits
//!   are a displacement from some base address.
//! - Address tagging: the lowest bit of a pointer with alignment `>= 2`
//!   carries the weak tag, see [`tag_addr`] and [`untag_addr`].
//!
//! All masking in the crate goes through this module.

use core::fmt;

// -----------------------------------------------------------------------------
// Address tagging

/// Bit set in a tagged address when the handle is weak.
pub const ADDR_WEAK_BIT: usize = 1;

/// Sets or clears the weak bit of `ptr` without touching other address bits.
#[inline(always)]
pub fn tag_addr<T>(ptr: *mut T, weak: bool) -> *mut T {
    if weak {
        ptr.map_addr(|addr| addr | ADDR_WEAK_BIT)
    } else {
        untag_addr(ptr)
    }
}

/// Returns `ptr` with the weak bit cleared.
#[inline(always)]
pub fn untag_addr<T>(ptr: *mut T) -> *mut T {
    ptr.map_addr(|addr| addr & !ADDR_WEAK_BIT)
}

/// Returns `true` if the weak bit of `ptr` is set.
#[inline(always)]
pub fn addr_is_weak<T>(ptr: *mut T) -> bool {
    ptr.addr() & ADDR_WEAK_BIT != 0
}

// -----------------------------------------------------------------------------
// Offset

/// A 16-bit ownership tagged displacement.
///
/// ```text
/// 15  14                              0
/// +---+--------------------------------+
/// | W |          displacement          |
/// +---+--------------------------------+
/// ```
///
/// Valid displacements satisfy `0 <= d < MAX_SIZE`. The one remaining
/// displacement, `0x7FFF`, marks a null handle.
///
/// # Examples
///
/// ```
/// use sliver_ptr::Offset;
///
/// let offset = Offset::new(100);
/// assert_eq!(offset.displacement(), 100);
/// assert!(offset.is_unique());
///
/// let weak = offset.weakify();
/// assert!(weak.is_weak());
/// assert_eq!(weak.displacement(), 100);
/// assert_eq!(weak.to_bits(), 0x8064);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Offset(u16);

impl Offset {
    /// The ownership tag bit.
    pub const WEAK_BIT: u16 = 1 << 15;

    /// Isolates the displacement bits from the tag bit.
    pub const DISPLACEMENT_MASK: u16 = !Self::WEAK_BIT;

    /// Exclusive upper bound of a displacement, `2^15 - 1`.
    pub const MAX_SIZE: usize = (u16::MAX >> 1) as usize;

    /// A unique handle that points nowhere.
    pub const NULL: Self = Self(Self::DISPLACEMENT_MASK);

    /// Creates a unique offset, discarding any bit above the displacement.
    #[inline(always)]
    pub const fn new(displacement: u16) -> Self {
        Self(displacement & Self::DISPLACEMENT_MASK)
    }

    /// Creates a unique offset from a byte distance, silently wrapping
    /// distances that do not fit the displacement window.
    #[inline(always)]
    pub const fn from_distance(distance: usize) -> Self {
        Self::new(distance as u16)
    }

    /// Creates a unique offset from a byte distance, or `None` if the
    /// distance is outside `0..MAX_SIZE`.
    ///
    /// ```
    /// use sliver_ptr::Offset;
    ///
    /// assert!(Offset::try_from_distance(Offset::MAX_SIZE - 1).is_some());
    /// assert!(Offset::try_from_distance(Offset::MAX_SIZE).is_none());
    /// ```
    #[inline]
    pub const fn try_from_distance(distance: usize) -> Option<Self> {
        if distance < Self::MAX_SIZE {
            Some(Self(distance as u16))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[inline(always)]
    pub const fn to_bits(self) -> u16 {
        self.0
    }

    /// Returns the displacement with the tag bit masked away.
    #[inline(always)]
    pub const fn displacement(self) -> u16 {
        self.0 & Self::DISPLACEMENT_MASK
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.displacement() == Self::DISPLACEMENT_MASK
    }

    #[inline(always)]
    pub const fn is_weak(self) -> bool {
        self.0 & Self::WEAK_BIT != 0
    }

    #[inline(always)]
    pub const fn is_unique(self) -> bool {
        !self.is_weak()
    }

    /// Same displacement, weak tag.
    #[inline(always)]
    pub const fn weakify(self) -> Self {
        Self(self.0 | Self::WEAK_BIT)
    }

    /// Same displacement, unique tag.
    #[inline(always)]
    pub const fn uniquify(self) -> Self {
        Self(self.0 & Self::DISPLACEMENT_MASK)
    }

    /// Same displacement, tag copied from `other`.
    #[inline(always)]
    pub const fn with_tag_of(self, other: Self) -> Self {
        Self(self.displacement() | (other.0 & Self::WEAK_BIT))
    }

    /// Resolves the displacement against `base`.
    #[inline(always)]
    pub const fn resolve(self, base: usize) -> usize {
        base.wrapping_add(self.displacement() as usize)
    }
}

impl Default for Offset {
    #[inline(always)]
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Offset(null, {})", tag_name(self.is_weak()));
        }
        write!(
            f,
            "Offset({:#06x}, {})",
            self.displacement(),
            tag_name(self.is_weak())
        )
    }
}

#[inline]
pub(crate) const fn tag_name(weak: bool) -> &'static str {
    if weak { "weak" } else { "unique" }
}

// -----------------------------------------------------------------------------
// Tests
