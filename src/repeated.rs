#![allow(unsafe_code)]

use crate::arena::Arena;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

const MIN_CAP: u32 = 4;

/// A growable array of `Copy` elements backed by a flat arena allocation,
/// with 32-bit length and capacity.
///
/// This is the storage for repeated scalar fields (and, internally, for the
/// unknown-field byte stream and the map's bucket entries). The backing
/// memory belongs to the arena: the container has no destructor and the
/// bytes are reclaimed when the arena is dropped.
pub struct RepeatedScalar<'a, T: Copy> {
    len: u32,
    cap: u32,
    ptr: NonNull<T>,
    _arena: PhantomData<&'a Arena>,
}

impl<'a, T: Copy> Default for RepeatedScalar<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: Copy> RepeatedScalar<'a, T> {
    /// Creates an empty array. Allocates nothing until the first push.
    #[inline]
    pub fn new() -> Self {
        Self {
            len: 0,
            cap: 0,
            ptr: NonNull::dangling(),
            _arena: PhantomData,
        }
    }

    /// Appends an element, growing geometrically through the arena.
    #[inline]
    pub fn push(&mut self, value: T, arena: &'a Arena) {
        if self.len == self.cap {
            self.grow(arena);
        }
        // Safety: len < cap after grow, so the write is in bounds.
        unsafe {
            self.ptr.as_ptr().add(self.len as usize).write(value);
        }
        self.len += 1;
    }

    /// Returns the number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns `true` if the array contains no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a reference to the element at the given index.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.len as usize {
            // Safety: index < len, the element is initialized.
            Some(unsafe { &*self.ptr.as_ptr().add(index) })
        } else {
            None
        }
    }

    /// Drops the logical contents, keeping the capacity for reuse.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Removes and returns the element at `index` by swapping in the last
    /// element. Ordering of the remaining elements may change.
    pub(crate) fn swap_remove(&mut self, index: usize) -> T {
        debug_assert!(index < self.len as usize);
        let last = self.len as usize - 1;
        // Safety: index and last are both < len and initialized.
        unsafe {
            let ptr = self.ptr.as_ptr();
            let value = ptr.add(index).read();
            if index != last {
                ptr.add(index).write(ptr.add(last).read());
            }
            self.len -= 1;
            value
        }
    }

    /// Inserts `value` at `index`, shifting later elements right.
    pub(crate) fn insert(&mut self, index: usize, value: T, arena: &'a Arena) {
        debug_assert!(index <= self.len as usize);
        if self.len == self.cap {
            self.grow(arena);
        }
        // Safety: capacity allows one more element; the shifted range is
        // initialized.
        unsafe {
            let ptr = self.ptr.as_ptr();
            std::ptr::copy(
                ptr.add(index),
                ptr.add(index + 1),
                self.len as usize - index,
            );
            ptr.add(index).write(value);
        }
        self.len += 1;
    }

    /// Removes the element at `index`, shifting later elements left.
    pub(crate) fn remove(&mut self, index: usize) -> T {
        debug_assert!(index < self.len as usize);
        // Safety: index < len; the shifted range is initialized.
        unsafe {
            let ptr = self.ptr.as_ptr();
            let value = ptr.add(index).read();
            std::ptr::copy(
                ptr.add(index + 1),
                ptr.add(index),
                self.len as usize - index - 1,
            );
            self.len -= 1;
            value
        }
    }

    /// Appends every element of `slice`.
    pub(crate) fn extend_from_slice(&mut self, slice: &[T], arena: &'a Arena) {
        let extra = u32::try_from(slice.len()).expect("length overflow");
        if extra > self.cap - self.len {
            let new_cap = (self.len + extra).max(MIN_CAP).max(self.cap * 2);
            self.grow_to(new_cap, arena);
        }
        // Safety: capacity reserved above; source and destination cannot
        // overlap because the destination is arena memory.
        unsafe {
            std::ptr::copy_nonoverlapping(
                slice.as_ptr(),
                self.ptr.as_ptr().add(self.len as usize),
                slice.len(),
            );
        }
        self.len += extra;
    }

    /// Returns the contents as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            &[]
        } else {
            // Safety: elements 0..len are initialized.
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize) }
        }
    }

    /// Returns the contents as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.len == 0 {
            &mut []
        } else {
            // Safety: elements 0..len are initialized; &mut self gives
            // exclusive access.
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len as usize) }
        }
    }

    /// Returns an iterator over references to the elements.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Pre-reserve for a packed read that declares `declared_bytes` of
    /// payload with a minimum element encoding of `min_elem_bytes`.
    ///
    /// The reservation is clamped to what `available_bytes` of input could
    /// actually hold, so a corrupt declared length cannot force a huge
    /// allocation up front; if the declared length turns out honest, growth
    /// proceeds geometrically as elements arrive.
    pub fn reserve_packed(
        &mut self,
        declared_bytes: usize,
        min_elem_bytes: usize,
        available_bytes: usize,
        arena: &'a Arena,
    ) {
        let hint = declared_bytes / min_elem_bytes.max(1);
        let bound = available_bytes / min_elem_bytes.max(1) + 1;
        let want = hint.min(bound).min(u32::MAX as usize) as u32;
        if want > self.cap - self.len {
            let new_cap = (self.len + want).max(MIN_CAP);
            self.grow_to(new_cap, arena);
        }
    }

    #[cold]
    fn grow(&mut self, arena: &'a Arena) {
        let new_cap = if self.cap == 0 {
            MIN_CAP
        } else {
            self.cap.checked_mul(2).expect("capacity overflow")
        };
        self.grow_to(new_cap, arena);
    }

    fn grow_to(&mut self, new_cap: u32, arena: &'a Arena) {
        let new_size = new_cap as usize * size_of::<T>();
        if self.cap > 0 {
            let old_size = self.cap as usize * size_of::<T>();
            // Safety: ptr was returned by a prior arena alloc of old_size bytes.
            self.ptr = unsafe { arena.realloc(self.ptr.cast(), old_size, new_size).cast() };
        } else {
            self.ptr = arena.alloc_array::<T>(new_cap as usize);
        }
        self.cap = new_cap;
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for RepeatedScalar<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<'s, 'a, T: Copy> IntoIterator for &'s RepeatedScalar<'a, T> {
    type Item = &'s T;
    type IntoIter = std::slice::Iter<'s, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

#[cfg(test)]
#[path = "./repeated_tests.rs"]
mod tests;
