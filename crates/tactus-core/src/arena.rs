//! Generational arena backing the audio graph.
//!
//! Audios and channels live in slot vectors instead of intrusive linked lists.
//! Every slot carries a generation that is bumped on removal, so an [`Index`]
//! captured by a realtime reader before a removal can never resolve to the
//! node that later reuses the slot.

/// Stable handle into an [`Arena`]: slot position plus the generation that
/// was current when the value was inserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index {
    slot: u32,
    generation: u32,
}

impl Index {
    /// Returns the raw slot position.
    #[inline]
    pub fn slot(self) -> u32 {
        self.slot
    }

    /// Returns the generation this handle was issued for.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Returns a handle that never resolves in any arena.
    #[inline]
    pub fn sentinel() -> Self {
        Self {
            slot: u32::MAX,
            generation: u32::MAX,
        }
    }
}

impl core::fmt::Display for Index {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot vector with free-list reuse and generation checks.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Inserts a value and returns its handle. Freed slots are reused first.
    pub fn insert(&mut self, value: T) -> Index {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return Index {
                slot,
                generation: entry.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Index {
            slot,
            generation: 0,
        }
    }

    /// Removes the value behind `index`, bumping the slot generation.
    ///
    /// Returns `None` for stale or unknown handles.
    pub fn remove(&mut self, index: Index) -> Option<T> {
        let entry = self.slots.get_mut(index.slot as usize)?;
        if entry.generation != index.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(index.slot);
        self.len -= 1;
        Some(value)
    }

    /// Returns a shared reference if `index` is still live.
    pub fn get(&self, index: Index) -> Option<&T> {
        let entry = self.slots.get(index.slot as usize)?;
        if entry.generation != index.generation {
            return None;
        }
        entry.value.as_ref()
    }

    /// Returns a mutable reference if `index` is still live.
    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        let entry = self.slots.get_mut(index.slot as usize)?;
        if entry.generation != index.generation {
            return None;
        }
        entry.value.as_mut()
    }

    /// Returns `true` if `index` resolves to a live value.
    pub fn contains(&self, index: Index) -> bool {
        self.get(index).is_some()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no values are live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    Index {
                        slot: slot as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }
}
