//! Compact owning pointers whose ownership can be switched off by a tag bit.
//!
//! - [`ptr`]: [`TaggedBox`](ptr::TaggedBox) and the two byte offset handles.
//! - [`os`]: heap origin, stack probe and memory map queries (`std` only).
//! - [`utils`]: [`SortedArrayMap`](utils::extra::SortedArrayMap), a small
//!   fixed-capacity container that owns what it stores.
//!
//! ```
//! use sliver::ptr::TaggedBox;
//! use sliver::utils::extra::SortedArrayMap;
//!
//! let mut names: SortedArrayMap<u32, TaggedBox<String>, 4> = SortedArrayMap::new();
//! names.insert_or_assign(2, TaggedBox::new("two".into())).ok().unwrap();
//! names.insert_or_assign(1, TaggedBox::new("one".into())).ok().unwrap();
//!
//! let first = names.first().and_then(|(_, name)| name.get());
//! assert_eq!(first.map(String::as_str), Some("one"));
//!
//! // Frees both strings.
//! names.clear();
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![no_std]

#[cfg(feature = "std")]
pub use sliver_os as os;
pub use sliver_ptr as ptr;
pub use sliver_utils as utils;

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
#[expect(unsafe_code, reason = "weak views are built from raw addresses")]
mod tests {
    extern crate alloc;
    extern crate std;

    use alloc::rc::Rc;
    use core::cell::Cell;

    use crate::ptr::TaggedBox;
    use crate::utils::extra::SortedArrayMap;

    struct Counted(Rc<Cell<usize>>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn map_owns_unique_handles_only() {
        let drops = Rc::new(Cell::new(0));
        let mut owners: SortedArrayMap<u8, TaggedBox<Counted>, 4> = SortedArrayMap::new();
        let mut views: SortedArrayMap<u8, TaggedBox<Counted>, 4> = SortedArrayMap::new();

        for key in 0..3 {
            let owner = TaggedBox::new(Counted(drops.clone()));
            let view = unsafe { owner.weak_alias() };
            owners.insert_or_assign(key, owner).ok().unwrap();
            views.insert_or_assign(key, view).ok().unwrap();
        }

        views.clear();
        assert_eq!(drops.get(), 0);

        // Overwriting a key frees the replaced pointee.
        owners
            .insert_or_assign(1, TaggedBox::new(Counted(drops.clone())))
            .ok()
            .unwrap();
        assert_eq!(drops.get(), 1);

        owners.clear();
        assert_eq!(drops.get(), 4);
    }

    #[test]
    fn full_map_hands_the_handle_back() {
        let drops = Rc::new(Cell::new(0));
        let mut owners: SortedArrayMap<u8, TaggedBox<Counted>, 1> = SortedArrayMap::new();
        owners
            .insert_or_assign(0, TaggedBox::new(Counted(drops.clone())))
            .ok()
            .unwrap();

        let Err((key, rejected)) = owners.insert_or_assign(9, TaggedBox::new(Counted(drops.clone())))
        else {
            panic!("insert into a full map succeeded");
        };
        assert_eq!(key, 9);
        assert!(rejected.is_unique());
        assert_eq!(owners.len(), 1);

        drop(rejected);
        assert_eq!(drops.get(), 1);
        drop(owners);
        assert_eq!(drops.get(), 2);
    }

    #[cfg(feature = "std")]
    #[test]
    fn map_of_offset_handles() {
        use crate::ptr::{DefaultDomain, SegmentBox, SegmentDomain};

        std::thread::spawn(|| {
            let drops = Rc::new(Cell::new(0));
            let mut map: SortedArrayMap<u8, SegmentBox<Counted>, 4> = SortedArrayMap::new();
            for key in [3, 1, 2] {
                let handle = SegmentBox::new(Counted(drops.clone())).unwrap();
                map.insert_or_assign(key, handle).ok().unwrap();
            }
            // Nearby allocations share segments.
            assert!((1..=3).contains(&DefaultDomain::snapshot().live()));

            map.clear();
            assert_eq!(drops.get(), 3);
            assert_eq!(DefaultDomain::snapshot().live(), 0);
        })
        .join()
        .unwrap();
    }
}
