//! Generational arena
//!
//! Kernel objects refer to each other through handles into an [`Arena`]
//! rather than pointers. Every insertion stamps the slot with a fresh
//! generation, so a handle that outlives its object is detected instead of
//! silently aliasing whatever reuses the slot.
use core::{fmt, marker::PhantomData, ops};
use slab::Slab;

/// The slot index and generation of an arena entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// A typed handle to an [`Arena`] entry.
pub(crate) trait Key: Copy + Eq + fmt::Debug {
    fn from_raw(raw: RawHandle) -> Self;
    fn into_raw(self) -> RawHandle;
}

/// Define a typed handle type implementing [`Key`].
macro_rules! define_key {
    (
        $( #[$meta:meta] )*
        $vis:vis struct $Name:ident;
    ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $Name($crate::utils::arena::RawHandle);

        impl $crate::utils::Key for $Name {
            #[inline]
            fn from_raw(raw: $crate::utils::arena::RawHandle) -> Self {
                Self(raw)
            }

            #[inline]
            fn into_raw(self) -> $crate::utils::arena::RawHandle {
                self.0
            }
        }

        impl ::core::fmt::Debug for $Name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, concat!(stringify!($Name), "({:?})"), self.0)
            }
        }
    };
}

pub(crate) use define_key;

struct Entry<T> {
    generation: u32,
    value: T,
}

/// A slab of `T` addressed by generation-checked handles of type `K`.
pub(crate) struct Arena<K, T> {
    slab: Slab<Entry<T>>,
    next_generation: u32,
    _key: PhantomData<fn() -> K>,
}

impl<K: Key, T> Arena<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            slab: Slab::new(),
            next_generation: 0,
            _key: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn insert(&mut self, value: T) -> K {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slab.insert(Entry { generation, value });
        K::from_raw(RawHandle {
            index: index as u32,
            generation,
        })
    }

    pub(crate) fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn get(&self, key: K) -> Option<&T> {
        let raw = key.into_raw();
        self.slab
            .get(raw.index as usize)
            .filter(|e| e.generation == raw.generation)
            .map(|e| &e.value)
    }

    pub(crate) fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let raw = key.into_raw();
        self.slab
            .get_mut(raw.index as usize)
            .filter(|e| e.generation == raw.generation)
            .map(|e| &mut e.value)
    }

    /// Remove the entry. Return `None` if `key` is stale.
    pub(crate) fn remove(&mut self, key: K) -> Option<T> {
        if !self.contains(key) {
            return None;
        }
        Some(self.slab.remove(key.into_raw().index as usize).value)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.slab.iter().map(|(index, e)| {
            (
                K::from_raw(RawHandle {
                    index: index as u32,
                    generation: e.generation,
                }),
                &e.value,
            )
        })
    }
}

impl<K: Key, T> ops::Index<K> for Arena<K, T> {
    type Output = T;

    #[track_caller]
    fn index(&self, key: K) -> &T {
        self.get(key)
            .unwrap_or_else(|| panic!("stale handle: {:?}", key))
    }
}

impl<K: Key, T> ops::IndexMut<K> for Arena<K, T> {
    #[track_caller]
    fn index_mut(&mut self, key: K) -> &mut T {
        self.get_mut(key)
            .unwrap_or_else(|| panic!("stale handle: {:?}", key))
    }
}

impl<K: Key, T: fmt::Debug> fmt::Debug for Arena<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::vec::Vec;

    define_key! {
        struct TestKey;
    }

    #[test]
    fn stale_handle_is_rejected() {
        let mut arena: Arena<TestKey, &str> = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));

        // The slot is reused, but the old handle must not reach the new value
        let b = arena.insert("b");
        assert_eq!(a.into_raw().index, b.into_raw().index);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena[b], "b");
    }

    #[test]
    #[should_panic(expected = "stale handle")]
    fn index_panics_on_stale_handle() {
        let mut arena: Arena<TestKey, u32> = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let _ = arena[a];
    }

    /// Apply a random sequence of insertions and removals and check that live
    /// handles resolve to their values and dead ones resolve to nothing.
    #[quickcheck]
    fn live_and_dead_handles(ops: Vec<u8>) {
        let mut arena: Arena<TestKey, usize> = Arena::new();
        let mut live: Vec<(TestKey, usize)> = Vec::new();
        let mut dead: Vec<TestKey> = Vec::new();

        for (i, op) in ops.into_iter().enumerate() {
            if op % 3 == 0 && !live.is_empty() {
                let (key, value) = live.swap_remove(op as usize % live.len());
                assert_eq!(arena.remove(key), Some(value));
                dead.push(key);
            } else {
                live.push((arena.insert(i), i));
            }

            assert_eq!(arena.len(), live.len());
            for &(key, value) in live.iter() {
                assert_eq!(arena.get(key), Some(&value));
            }
            for &key in dead.iter() {
                assert!(!arena.contains(key));
            }
        }
    }
}
