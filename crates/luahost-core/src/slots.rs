//! Generation-checked slot storage.
//!
//! Everything the guest (or the host) refers to by integer id lives in a
//! [`Slots`] table. An id is an `(index, generation)` pair; a slot that is
//! freed and reused gets a fresh generation, so an old id can never resolve
//! to the new occupant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generations are drawn from one process-wide counter, which also keeps an
/// id issued by one state from resolving in another. At 64 bits it does not
/// wrap within the life of any process.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    loop {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        // 0 is reserved for "never issued"
        if generation != 0 {
            return generation;
        }
    }
}

/// Untyped `(index, generation)` pair behind every id type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub index: usize,
    pub generation: u64,
}

macro_rules! slot_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(SlotKey);

        impl $name {
            pub fn key(self) -> SlotKey {
                self.0
            }
        }

        impl From<SlotKey> for $name {
            fn from(key: SlotKey) -> Self {
                Self(key)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}.{}", $label, self.0.index, self.0.generation)
            }
        }
    };
}

slot_id!(
    /// Capability token for a host callable registered in one state.
    CallbackId,
    "callback"
);
slot_id!(
    /// Capability token for a host object registered in one state.
    StructId,
    "struct"
);
slot_id!(
    /// Handle to a state owned by a [`StateRegistry`](crate::StateRegistry).
    StateHandle,
    "state"
);

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u64 },
    Free { next_free: Option<usize> },
}

/// Slot map with a free list; removed slots are reused under a new generation.
#[derive(Debug)]
pub(crate) struct Slots<T> {
    entries: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }
}

impl<T> Slots<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, value: T) -> SlotKey {
        let generation = next_generation();
        let index = match self.free_head {
            Some(free) => {
                let slot = &mut self.entries[free];
                self.free_head = match slot {
                    Slot::Free { next_free } => *next_free,
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                *slot = Slot::Occupied { value, generation };
                free
            }
            None => {
                let index = self.entries.len();
                self.entries.push(Slot::Occupied { value, generation });
                index
            }
        };
        self.len += 1;
        SlotKey { index, generation }
    }

    pub(crate) fn get(&self, key: SlotKey) -> Option<&T> {
        match self.entries.get(key.index)? {
            Slot::Occupied { value, generation } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<T> {
        if !self.contains(key) {
            return None;
        }
        let freed = std::mem::replace(
            &mut self.entries[key.index],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(key.index);
        self.len -= 1;
        match freed {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every entry; all previously issued keys become stale.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.free_head = None;
        self.len = 0;
    }
}
