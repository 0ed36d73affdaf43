//! Fixed-capacity map kept sorted by key, with inline storage.
#![expect(unsafe_code, reason = "entries live in uninitialized inline storage")]

use core::fmt;
use core::mem::MaybeUninit;
use core::ops::Index;
use core::ptr;

use thiserror::Error;

// -----------------------------------------------------------------------------
// MapError

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MapError {
    #[error("index {index} out of bounds for map of length {len}")]
    OutOfBounds { index: usize, len: usize },
}

impl MapError {
    #[cold]
    #[inline(never)]
    pub fn handle_error(&self) -> ! {
        panic!("{self}");
    }
}

// -----------------------------------------------------------------------------
// SortedArrayMap

/// A map of at most `N` entries, stored contiguously and ordered by key.
///
/// Lookups are binary searches. Inserting a new key shifts the tail of the
/// array, so the map suits small `N`. Entries own their values: clearing or
/// dropping the map drops every entry.
///
/// ```
/// use sliver_utils::extra::SortedArrayMap;
///
/// let mut map: SortedArrayMap<u32, &str, 4> = SortedArrayMap::new();
/// assert_eq!(map.insert_or_assign(3, "a"), Ok((0, true)));
/// assert_eq!(map.insert_or_assign(1, "b"), Ok((0, true)));
/// assert_eq!(map.insert_or_assign(4, "c"), Ok((2, true)));
/// assert_eq!(map.insert_or_assign(1, "d"), Ok((0, false)));
///
/// assert_eq!(map.as_slice(), &[(1, "d"), (3, "a"), (4, "c")]);
/// assert_eq!(map.get(&3), Some(&"a"));
/// ```
pub struct SortedArrayMap<K, V, const N: usize> {
    slots: [MaybeUninit<(K, V)>; N],
    len: usize,
}

impl<K, V, const N: usize> Drop for SortedArrayMap<K, V, N> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K, V, const N: usize> Default for SortedArrayMap<K, V, N> {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> SortedArrayMap<K, V, N> {
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            slots: [const { MaybeUninit::uninit() }; N],
            len: 0,
        }
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub const fn is_full(&self) -> bool {
        self.len == N
    }

    #[inline(always)]
    fn base(&mut self) -> *mut (K, V) {
        self.slots.as_mut_ptr().cast()
    }

    /// The entries in ascending key order.
    #[inline]
    pub fn as_slice(&self) -> &[(K, V)] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { core::slice::from_raw_parts(self.slots.as_ptr().cast(), self.len) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [(K, V)] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { core::slice::from_raw_parts_mut(self.base(), self.len) }
    }

    /// Drops every entry and empties the map.
    pub fn clear(&mut self) {
        let len = self.len;
        // A panicking destructor must not lead to a second drop.
        self.len = 0;
        if core::mem::needs_drop::<(K, V)>() {
            // SAFETY: the first `len` slots were initialized.
            unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.base(), len)) }
        }
    }

    /// Bounds checked positional access.
    ///
    /// ```
    /// use sliver_utils::extra::{MapError, SortedArrayMap};
    ///
    /// let mut map: SortedArrayMap<u8, u8, 2> = SortedArrayMap::new();
    /// map.insert_or_assign(7, 70).unwrap();
    /// assert_eq!(map.at(0), Ok(&(7, 70)));
    /// assert_eq!(map.at(1), Err(MapError::OutOfBounds { index: 1, len: 1 }));
    /// ```
    pub fn at(&self, index: usize) -> Result<&(K, V), MapError> {
        self.as_slice().get(index).ok_or(MapError::OutOfBounds {
            index,
            len: self.len,
        })
    }

    /// Bounds checked positional access to the value of an entry.
    ///
    /// Keys stay immutable so the ordering cannot be broken.
    pub fn at_mut(&mut self, index: usize) -> Result<(&K, &mut V), MapError> {
        let len = self.len;
        match self.as_mut_slice().get_mut(index) {
            Some((key, value)) => Ok((&*key, value)),
            None => Err(MapError::OutOfBounds { index, len }),
        }
    }

    /// Positional access without bounds checking.
    ///
    /// # Safety
    ///
    /// `index` must be less than [`len`](Self::len).
    #[inline]
    pub unsafe fn get_unchecked(&self, index: usize) -> &(K, V) {
        debug_assert!(index < self.len);
        unsafe { self.as_slice().get_unchecked(index) }
    }

    #[inline]
    pub fn first(&self) -> Option<&(K, V)> {
        self.as_slice().first()
    }

    #[inline]
    pub fn last(&self) -> Option<&(K, V)> {
        self.as_slice().last()
    }

    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, (K, V)> {
        self.as_slice().iter()
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &K> + ExactSizeIterator {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl DoubleEndedIterator<Item = &V> + ExactSizeIterator {
        self.iter().map(|(_, value)| value)
    }
}

impl<K: Ord, V, const N: usize> SortedArrayMap<K, V, N> {
    #[inline]
    fn search(&self, key: &K) -> Result<usize, usize> {
        self.as_slice().binary_search_by(|(probe, _)| probe.cmp(key))
    }

    /// Position of `key`, if present.
    #[inline]
    pub fn find(&self, key: &K) -> Option<usize> {
        self.search(key).ok()
    }

    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.search(key).is_ok()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let index = self.search(key).ok()?;
        Some(&self.as_slice()[index].1)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.search(key).ok()?;
        Some(&mut self.as_mut_slice()[index].1)
    }

    /// Inserts `key` or overwrites its value.
    ///
    /// Returns the entry position and `true` if the key is new. When the key
    /// is new and the map is full, the pair is handed back untouched.
    pub fn insert_or_assign(&mut self, key: K, value: V) -> Result<(usize, bool), (K, V)> {
        match self.search(&key) {
            Ok(index) => {
                self.as_mut_slice()[index].1 = value;
                Ok((index, false))
            }
            Err(_) if self.is_full() => Err((key, value)),
            Err(index) => {
                let len = self.len;
                let base = self.base();
                // SAFETY: `len < N`, so shifting `index..len` up by one stays
                // in bounds, and slot `index` is then free to be written.
                unsafe {
                    ptr::copy(base.add(index), base.add(index + 1), len - index);
                    ptr::write(base.add(index), (key, value));
                }
                self.len = len + 1;
                Ok((index, true))
            }
        }
    }

    /// Removes `key` and returns its value, keeping the order of the rest.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.search(key).ok()?;
        let len = self.len;
        let base = self.base();
        // SAFETY: `index < len`; the entry is read out before the tail
        // closes the gap.
        let (_, value) = unsafe {
            let entry = ptr::read(base.add(index));
            ptr::copy(base.add(index + 1), base.add(index), len - index - 1);
            entry
        };
        self.len = len - 1;
        Some(value)
    }
}

impl<K, V, const N: usize> Index<usize> for SortedArrayMap<K, V, N> {
    type Output = (K, V);

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        match self.at(index) {
            Ok(entry) => entry,
            Err(err) => err.handle_error(),
        }
    }
}

impl<K: Clone, V: Clone, const N: usize> Clone for SortedArrayMap<K, V, N> {
    fn clone(&self) -> Self {
        let mut map = Self::new();
        for (index, entry) in self.iter().enumerate() {
            map.slots[index].write(entry.clone());
            map.len = index + 1;
        }
        map
    }
}

impl<'a, K, V, const N: usize> IntoIterator for &'a SortedArrayMap<K, V, N> {
    type Item = &'a (K, V);
    type IntoIter = core::slice::Iter<'a, (K, V)>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug, const N: usize> fmt::Debug for SortedArrayMap<K, V, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(key, value)| (key, value)))
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::cell::Cell;

    use super::*;

    struct Counted(Rc<Cell<usize>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn insert_overwrite_and_exhaust() {
        let mut map: SortedArrayMap<i32, &str, 4> = SortedArrayMap::new();
        map.insert_or_assign(3, "a").unwrap();
        map.insert_or_assign(1, "b").unwrap();
        map.insert_or_assign(4, "c").unwrap();
        map.insert_or_assign(1, "d").unwrap();
        assert_eq!(map.as_slice(), &[(1, "d"), (3, "a"), (4, "c")]);
        assert_eq!(map.len(), 3);

        assert_eq!(map.insert_or_assign(2, "e"), Ok((1, true)));
        assert!(map.is_full());
        assert_eq!(map.insert_or_assign(9, "f"), Err((9, "f")));
        assert_eq!(map.len(), 4);

        // Existing keys still update in a full map.
        assert_eq!(map.insert_or_assign(4, "g"), Ok((3, false)));
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), [1, 2, 3, 4]);
        assert_eq!(map.values().copied().collect::<Vec<_>>(), ["d", "e", "a", "g"]);
    }

    #[test]
    fn ordering_holds_after_any_insert_sequence() {
        let mut map: SortedArrayMap<u32, u32, 16> = SortedArrayMap::new();
        for key in [9, 2, 14, 7, 0, 11, 2, 5, 14, 3] {
            map.insert_or_assign(key, key * 10).unwrap();
            assert!(map.as_slice().windows(2).all(|pair| pair[0].0 < pair[1].0));
        }
        assert_eq!(map.len(), 8);
        assert_eq!(map.find(&7), Some(4));
        assert_eq!(map.find(&8), None);
    }

    #[test]
    fn overwrite_keeps_size_and_drops_old_value() {
        let drops = Rc::new(Cell::new(0));
        let mut map: SortedArrayMap<u8, Counted, 2> = SortedArrayMap::new();
        map.insert_or_assign(1, Counted(drops.clone())).ok().unwrap();
        map.insert_or_assign(1, Counted(drops.clone())).ok().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn clear_and_drop_release_entries() {
        let drops = Rc::new(Cell::new(0));
        let mut map: SortedArrayMap<u8, Counted, 4> = SortedArrayMap::new();
        for key in 0..3 {
            map.insert_or_assign(key, Counted(drops.clone())).ok().unwrap();
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(drops.get(), 3);

        map.insert_or_assign(5, Counted(drops.clone())).ok().unwrap();
        drop(map);
        assert_eq!(drops.get(), 4);
    }

    #[test]
    fn remove_closes_the_gap() {
        let mut map: SortedArrayMap<u8, String, 4> = SortedArrayMap::new();
        for (key, name) in [(3, "c"), (1, "a"), (2, "b")] {
            map.insert_or_assign(key, name.into()).unwrap();
        }
        assert_eq!(map.remove(&2).as_deref(), Some("b"));
        assert_eq!(map.remove(&2), None);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), [1, 3]);
        assert_eq!(map.first().map(|(key, _)| *key), Some(1));
        assert_eq!(map.last().map(|(key, _)| *key), Some(3));
    }

    #[test]
    fn positional_access() {
        let mut map: SortedArrayMap<u8, u8, 4> = SortedArrayMap::new();
        map.insert_or_assign(2, 20).unwrap();
        map.insert_or_assign(1, 10).unwrap();

        assert_eq!(map[1], (2, 20));
        assert_eq!(unsafe { map.get_unchecked(0) }, &(1, 10));
        assert_eq!(map.at(2), Err(MapError::OutOfBounds { index: 2, len: 2 }));

        let (key, value) = map.at_mut(0).unwrap();
        *value += *key;
        assert_eq!(map.get(&1), Some(&11));
        *map.get_mut(&2).unwrap() = 0;
        assert_eq!(map.at(1), Ok(&(2, 0)));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn index_panics_out_of_bounds() {
        let map: SortedArrayMap<u8, u8, 4> = SortedArrayMap::new();
        let _entry = &map[0];
    }

    #[test]
    fn clone_and_debug() {
        let mut map: SortedArrayMap<u8, &str, 3> = SortedArrayMap::new();
        map.insert_or_assign(2, "two").unwrap();
        map.insert_or_assign(1, "one").unwrap();
        let copy = map.clone();
        assert_eq!(copy.as_slice(), map.as_slice());
        assert_eq!(alloc::format!("{copy:?}"), r#"{1: "one", 2: "two"}"#);
    }

    #[test]
    fn zero_capacity() {
        let mut map: SortedArrayMap<u8, u8, 0> = SortedArrayMap::default();
        assert!(map.is_full() && map.is_empty());
        assert_eq!(map.insert_or_assign(1, 1), Err((1, 1)));
    }
}
