//! Single-owner storage for devices and streams.
//!
//! Entities refer to each other through generation-checked handles, so a
//! handle to a freed entity becomes a lookup miss instead of a dangling
//! reference, even after its slot has been reused.

use std::{fmt, marker::PhantomData};

/// Typed handle into an [`Arena`]
pub trait ArenaKey: Copy + Eq {
    /// Build a handle from its raw parts
    fn from_parts(slot: u32, generation: u32) -> Self;
    /// Slot position
    fn slot(self) -> u32;
    /// Generation the slot had when this handle was issued
    fn generation(self) -> u32;
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            slot: u32,
            generation: u32,
        }

        impl ArenaKey for $name {
            fn from_parts(slot: u32, generation: u32) -> Self {
                Self { slot, generation }
            }

            fn slot(self) -> u32 {
                self.slot
            }

            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}.{}", $prefix, self.slot, self.generation)
            }
        }
    };
}

arena_key!(
    /// Handle of an output or input device
    DeviceIndex,
    "device"
);

arena_key!(
    /// Handle of a playback or capture stream
    StreamIndex,
    "stream"
);

enum Entry<V> {
    Occupied { generation: u32, value: V },
    Vacant { generation: u32 },
}

/// Slot map with generation counters
pub struct Arena<K, V> {
    entries: Vec<Entry<V>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, V> Default for Arena<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, V> Arena<K, V> {
    /// Empty arena
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    /// Insert a value built from its own handle
    pub fn insert_with(&mut self, build: impl FnOnce(K) -> V) -> K {
        self.len += 1;

        if let Some(slot) = self.free.pop() {
            let generation = match self.entries.get(slot as usize) {
                Some(Entry::Vacant { generation }) => generation.wrapping_add(1),
                _ => 0,
            };
            let key = K::from_parts(slot, generation);
            self.entries[slot as usize] = Entry::Occupied {
                generation,
                value: build(key),
            };
            return key;
        }

        let slot = self.entries.len() as u32;
        let key = K::from_parts(slot, 0);
        self.entries.push(Entry::Occupied {
            generation: 0,
            value: build(key),
        });
        key
    }

    /// Look up a live value
    pub fn get(&self, key: K) -> Option<&V> {
        match self.entries.get(key.slot() as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == key.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Look up a live value mutably
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        match self.entries.get_mut(key.slot() as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == key.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Whether `key` still names a live value
    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Remove and return a live value
    pub fn remove(&mut self, key: K) -> Option<V> {
        let slot = key.slot() as usize;
        match self.entries.get(slot) {
            Some(Entry::Occupied { generation, .. }) if *generation == key.generation() => {}
            _ => return None,
        }

        let vacant = Entry::Vacant {
            generation: key.generation(),
        };
        match std::mem::replace(&mut self.entries[slot], vacant) {
            Entry::Occupied { value, .. } => {
                self.free.push(key.slot());
                self.len -= 1;
                Some(value)
            }
            Entry::Vacant { .. } => None,
        }
    }

    /// Live handles in slot order
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| k).collect()
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.entries.iter().enumerate().filter_map(|(slot, entry)| match entry {
            Entry::Occupied { generation, value } => {
                Some((K::from_parts(slot as u32, *generation), value))
            }
            Entry::Vacant { .. } => None,
        })
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds nothing
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_miss_after_reuse() {
        let mut arena: Arena<StreamIndex, &str> = Arena::new();
        let first = arena.insert_with(|_| "first");
        assert_eq!(arena.remove(first), Some("first"));

        let second = arena.insert_with(|_| "second");
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second), Some(&"second"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn insert_with_sees_own_key() {
        let mut arena: Arena<DeviceIndex, DeviceIndex> = Arena::new();
        let key = arena.insert_with(|k| k);
        assert_eq!(arena.get(key), Some(&key));
        assert_eq!(arena.remove(key), Some(key));
        assert!(arena.remove(key).is_none());
        assert!(arena.is_empty());
    }
}
