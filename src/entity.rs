//! Entity arenas: stable, copyable handles into per-[`Module`](crate::Module) storage.
//!
//! Every IR object (block, instruction, function, interned type/constant)
//! lives in an arena owned by its module and is referred to by a typed
//! [`Handle`]. Handles are plain indices: only meaningful for the arena they
//! came from, and valid for that arena's whole lifetime (arenas are
//! append-only; nothing is ever removed).

use crate::FxIndexSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// Typed index of an entity allocated in an [`Arena<T>`] or [`UniqueArena<T>`].
pub struct Handle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: usize) -> Self {
        Self { index: u32::try_from(index).expect("arena overflow"), _marker: PhantomData }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

// NOTE: manual impls to avoid `derive`'s unwanted `T: Trait` bounds.
impl<T> Copy for Handle<T> {}
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T> Eq for Handle<T> {}
impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}
impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}
impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.index)
    }
}

/// Append-only arena; the handle of an entry never changes once allocated.
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub fn append(&mut self, value: T) -> Handle<T> {
        let handle = Handle::new(self.items.len());
        self.items.push(value);
        handle
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates entries in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.items.iter().enumerate().map(|(i, item)| (Handle::new(i), item))
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;
    fn index(&self, handle: Handle<T>) -> &T {
        &self.items[handle.index()]
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        &mut self.items[handle.index()]
    }
}

/// Interning arena: equal values share one handle.
pub struct UniqueArena<T: Eq + Hash> {
    set: FxIndexSet<T>,
}

impl<T: Eq + Hash> Default for UniqueArena<T> {
    fn default() -> Self {
        Self { set: FxIndexSet::default() }
    }
}

impl<T: Eq + Hash> UniqueArena<T> {
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let (index, _) = self.set.insert_full(value);
        Handle::new(index)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.set.iter().enumerate().map(|(i, item)| (Handle::new(i), item))
    }
}

impl<T: Eq + Hash> Index<Handle<T>> for UniqueArena<T> {
    type Output = T;
    fn index(&self, handle: Handle<T>) -> &T {
        &self.set[handle.index()]
    }
}
