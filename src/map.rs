#![allow(unsafe_code)]

//! Arena-backed hash map for protobuf map fields.
//!
//! Open hashing with power-of-two bucket arrays. Each bucket starts as an
//! unsorted chain scanned linearly; a chain that collects eight entries is
//! promoted to a key-sorted array probed by binary search, so a flood of
//! colliding keys degrades to logarithmic rather than linear lookups. Keys
//! hash with foldhash under a fixed seed.

use crate::arena::Arena;
use crate::message::MsgPtr;
use crate::repeated::RepeatedScalar;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Entries per bucket before a chain is promoted to a sorted tree bucket.
const CHAIN_TO_TREE: usize = 8;
/// Grow when len exceeds 12/16 of the bucket count.
const MAX_LOAD_16THS: u64 = 12;
/// Shrink when len drops under 3/16 of the bucket count.
const MIN_LOAD_16THS: u64 = 3;
const MIN_BUCKETS: u32 = 8;

/// A map key. All keys in one map hold the same variant; string keys
/// borrow from the arena (or the input buffer).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey<'a> {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    Bool(bool),
    Str(&'a [u8]),
}

/// A map value in normalized storage: 32-bit scalars widen to `S32`,
/// 64-bit scalars to `S64`, with the schema supplying the interpretation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapValue<'a> {
    S32(u32),
    S64(u64),
    Bool(bool),
    Bytes(&'a [u8]),
    Msg(MsgPtr<'a>),
}

#[derive(Copy, Clone, Debug)]
struct Node<'a> {
    key: MapKey<'a>,
    value: MapValue<'a>,
}

enum Bucket<'a> {
    Empty,
    /// Unsorted, linear scan.
    Chain(RepeatedScalar<'a, Node<'a>>),
    /// Sorted by key, binary search.
    Tree(RepeatedScalar<'a, Node<'a>>),
}

/// Map storage for a single map field.
pub struct Map<'a> {
    buckets: NonNull<Bucket<'a>>,
    /// Power of two, or 0 before the first insert.
    bucket_count: u32,
    len: u32,
    _arena: PhantomData<&'a Arena>,
}

#[inline]
fn hash_key(key: &MapKey<'_>) -> u64 {
    foldhash::fast::FixedState::default().hash_one(key)
}

impl<'a> Default for Map<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Map<'a> {
    #[inline]
    pub fn new() -> Self {
        Map {
            buckets: NonNull::dangling(),
            bucket_count: 0,
            len: 0,
            _arena: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn buckets(&self) -> &[Bucket<'a>] {
        if self.bucket_count == 0 {
            return &[];
        }
        // Safety: bucket_count buckets were initialized by resize().
        unsafe { std::slice::from_raw_parts(self.buckets.as_ptr(), self.bucket_count as usize) }
    }

    #[inline]
    fn bucket_mut(&mut self, hash: u64) -> &mut Bucket<'a> {
        debug_assert!(self.bucket_count.is_power_of_two());
        let idx = (hash as usize) & (self.bucket_count as usize - 1);
        // Safety: idx < bucket_count and the array is initialized.
        unsafe { &mut *self.buckets.as_ptr().add(idx) }
    }

    /// Inserts or overwrites. Returns `true` when the key was not present
    /// (an overwrite keeps the map length unchanged).
    pub fn insert(&mut self, key: MapKey<'a>, value: MapValue<'a>, arena: &'a Arena) -> bool {
        let hash = hash_key(&key);
        // Overwrites leave the load factor alone, so probe before deciding
        // to grow.
        if self.bucket_count != 0 {
            match self.bucket_mut(hash) {
                Bucket::Empty => {}
                Bucket::Chain(chain) => {
                    if let Some(existing) =
                        chain.as_mut_slice().iter_mut().find(|n| n.key == key)
                    {
                        existing.value = value;
                        return false;
                    }
                }
                Bucket::Tree(tree) => {
                    if let Ok(i) = tree.as_slice().binary_search_by(|n| n.key.cmp(&key)) {
                        tree.as_mut_slice()[i].value = value;
                        return false;
                    }
                }
            }
        }
        if self.bucket_count == 0
            || (self.len as u64 + 1) * 16 > self.bucket_count as u64 * MAX_LOAD_16THS
        {
            let target = (self.bucket_count * 2).max(MIN_BUCKETS);
            self.resize(target, arena);
        }
        // The key is known absent, so this is a plain fresh insert.
        self.insert_rehashed(Node { key, value }, arena);
        true
    }

    pub fn get(&self, key: MapKey<'_>) -> Option<MapValue<'a>> {
        if self.len == 0 {
            return None;
        }
        let hash = hash_key(&key);
        let idx = (hash as usize) & (self.bucket_count as usize - 1);
        match &self.buckets()[idx] {
            Bucket::Empty => None,
            Bucket::Chain(chain) => chain
                .iter()
                .find(|n| n.key == key)
                .map(|n| n.value),
            Bucket::Tree(tree) => tree
                .as_slice()
                .binary_search_by(|n| n.key.cmp(&key))
                .ok()
                .map(|i| tree.as_slice()[i].value),
        }
    }

    #[inline]
    pub fn contains_key(&self, key: MapKey<'_>) -> bool {
        self.get(key).is_some()
    }

    /// Removes a key, returning its value. Shrinks the bucket array when
    /// the load drops low enough.
    pub fn remove(&mut self, key: MapKey<'_>, arena: &'a Arena) -> Option<MapValue<'a>> {
        if self.len == 0 {
            return None;
        }
        let hash = hash_key(&key);
        let removed = match self.bucket_mut(hash) {
            Bucket::Empty => None,
            Bucket::Chain(chain) => {
                let pos = chain.iter().position(|n| n.key == key)?;
                Some(chain.swap_remove(pos).value)
            }
            Bucket::Tree(tree) => {
                let i = tree
                    .as_slice()
                    .binary_search_by(|n| n.key.cmp(&key))
                    .ok()?;
                Some(tree.remove(i).value)
            }
        };
        if removed.is_some() {
            self.len -= 1;
            if self.bucket_count > MIN_BUCKETS
                && (self.len as u64) * 16 < self.bucket_count as u64 * MIN_LOAD_16THS
            {
                self.resize(self.bucket_count / 2, arena);
            }
        }
        removed
    }

    /// Drops all entries, keeping the bucket array and chain capacity.
    pub fn clear(&mut self) {
        for i in 0..self.bucket_count as usize {
            // Safety: i < bucket_count and the array is initialized.
            let bucket = unsafe { &mut *self.buckets.as_ptr().add(i) };
            match bucket {
                Bucket::Empty => {}
                Bucket::Chain(chain) => chain.clear(),
                Bucket::Tree(tree) => {
                    let mut entries = std::mem::take(tree);
                    entries.clear();
                    *bucket = Bucket::Chain(entries);
                }
            }
        }
        self.len = 0;
    }

    pub fn iter(&self) -> MapIter<'_, 'a> {
        MapIter {
            buckets: self.buckets().iter(),
            entries: [].iter(),
        }
    }

    /// Rebuild into `new_count` buckets, redistributing every entry.
    #[cold]
    fn resize(&mut self, new_count: u32, arena: &'a Arena) {
        debug_assert!(new_count.is_power_of_two());
        let old = std::mem::replace(
            self,
            Map {
                buckets: arena.alloc_array::<Bucket<'a>>(new_count as usize),
                bucket_count: new_count,
                len: 0,
                _arena: PhantomData,
            },
        );
        for i in 0..new_count as usize {
            // Safety: writing initial values into the fresh bucket array.
            unsafe { self.buckets.as_ptr().add(i).write(Bucket::Empty) };
        }
        for i in 0..old.bucket_count as usize {
            // Safety: old's buckets were initialized; each is read out once.
            let bucket = unsafe { old.buckets.as_ptr().add(i).read() };
            let entries = match bucket {
                Bucket::Empty => continue,
                Bucket::Chain(c) | Bucket::Tree(c) => c,
            };
            for node in entries.iter() {
                self.insert_rehashed(*node, arena);
            }
        }
    }

    /// Insert a key known to be absent (fresh insert, or redistribution
    /// during a rehash): skips the equality probe, keeps the promotion rule.
    fn insert_rehashed(&mut self, node: Node<'a>, arena: &'a Arena) {
        let hash = hash_key(&node.key);
        match self.bucket_mut(hash) {
            bucket @ Bucket::Empty => {
                let mut chain = RepeatedScalar::new();
                chain.push(node, arena);
                *bucket = Bucket::Chain(chain);
            }
            bucket @ Bucket::Chain(_) => {
                let Bucket::Chain(chain) = bucket else {
                    unreachable!();
                };
                chain.push(node, arena);
                if chain.len() >= CHAIN_TO_TREE {
                    chain
                        .as_mut_slice()
                        .sort_unstable_by(|a, b| a.key.cmp(&b.key));
                    let entries = std::mem::take(chain);
                    *bucket = Bucket::Tree(entries);
                }
            }
            Bucket::Tree(tree) => {
                let i = match tree.as_slice().binary_search_by(|n| n.key.cmp(&node.key)) {
                    Ok(i) | Err(i) => i,
                };
                tree.insert(i, node, arena);
            }
        }
        self.len += 1;
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// True when the bucket holding `key` has been promoted to a tree.
    #[cfg(test)]
    pub(crate) fn key_in_tree_bucket(&self, key: MapKey<'_>) -> bool {
        if self.bucket_count == 0 {
            return false;
        }
        let idx = (hash_key(&key) as usize) & (self.bucket_count as usize - 1);
        matches!(self.buckets()[idx], Bucket::Tree(_))
    }
}

impl std::fmt::Debug for Map<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub struct MapIter<'m, 'a> {
    buckets: std::slice::Iter<'m, Bucket<'a>>,
    entries: std::slice::Iter<'m, Node<'a>>,
}

impl<'m, 'a> Iterator for MapIter<'m, 'a> {
    type Item = (MapKey<'a>, MapValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.entries.next() {
                return Some((node.key, node.value));
            }
            match self.buckets.next()? {
                Bucket::Empty => {}
                Bucket::Chain(c) | Bucket::Tree(c) => self.entries = c.as_slice().iter(),
            }
        }
    }
}

#[cfg(test)]
#[path = "./map_tests.rs"]
mod tests;
