#![allow(unsafe_code)]

use crate::arena::Arena;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

const MIN_CAP: u32 = 4;

/// Element types whose allocations can be recycled after a `clear()`.
///
/// `reuse` must reset the element to its freshly-created state while keeping
/// any arena storage it already owns (a cleared message keeps its slot
/// arrays and container capacity).
pub trait Reuse {
    fn reuse(&mut self);
}

impl<'a> Reuse for &'a [u8] {
    fn reuse(&mut self) {
        *self = &[];
    }
}

/// Repeated storage for pointer-like elements: strings and submessages.
///
/// Small-size optimized: the first element is stored inline, and spilling to
/// an arena array happens on the second add. Cleared elements are kept in
/// the `[current, allocated)` region and revived on the next add, so
/// `clear()` followed by refilling does not hit the allocator again.
///
/// Invariant: `current <= allocated <= cap`.
pub enum RepeatedPtr<'a, T: Reuse> {
    Empty,
    Inline { elem: T, live: bool },
    Spilled(Spill<'a, T>),
}

pub struct Spill<'a, T> {
    ptr: NonNull<T>,
    /// Live elements, `[0, current)`.
    current: u32,
    /// Constructed elements; `[current, allocated)` are cleared-but-reusable.
    allocated: u32,
    cap: u32,
    _arena: PhantomData<&'a Arena>,
}

impl<'a, T: Reuse> Default for RepeatedPtr<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: Reuse> RepeatedPtr<'a, T> {
    #[inline]
    pub fn new() -> Self {
        RepeatedPtr::Empty
    }

    /// Number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            RepeatedPtr::Empty => 0,
            RepeatedPtr::Inline { live, .. } => *live as usize,
            RepeatedPtr::Spilled(s) => s.current as usize,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Live elements as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        match self {
            RepeatedPtr::Empty => &[],
            RepeatedPtr::Inline { live: false, .. } => &[],
            RepeatedPtr::Inline { elem, live: true } => std::slice::from_ref(elem),
            RepeatedPtr::Spilled(s) => {
                // Safety: elements 0..current are initialized and live.
                unsafe { std::slice::from_raw_parts(s.ptr.as_ptr(), s.current as usize) }
            }
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            RepeatedPtr::Empty => &mut [],
            RepeatedPtr::Inline { live: false, .. } => &mut [],
            RepeatedPtr::Inline { elem, live: true } => std::slice::from_mut(elem),
            RepeatedPtr::Spilled(s) => {
                // Safety: elements 0..current are initialized; &mut self is
                // exclusive.
                unsafe { std::slice::from_raw_parts_mut(s.ptr.as_ptr(), s.current as usize) }
            }
        }
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Appends an element, reviving a cleared slot if one exists, otherwise
    /// constructing a fresh element with `make`. Returns the new element.
    pub fn add_with(&mut self, arena: &'a Arena, make: impl FnOnce() -> T) -> &mut T {
        if matches!(self, RepeatedPtr::Inline { live: true, .. }) {
            self.spill(arena);
        }
        match self {
            RepeatedPtr::Empty => {
                *self = RepeatedPtr::Inline {
                    elem: make(),
                    live: true,
                };
            }
            RepeatedPtr::Inline { elem, live } => {
                debug_assert!(!*live);
                elem.reuse();
                *live = true;
            }
            RepeatedPtr::Spilled(s) => s.add_slot(arena, make),
        }
        match self {
            RepeatedPtr::Inline { elem, .. } => elem,
            // Safety: add_slot just made current - 1 a live element.
            RepeatedPtr::Spilled(s) => unsafe {
                &mut *s.ptr.as_ptr().add(s.current as usize - 1)
            },
            RepeatedPtr::Empty => unreachable!(),
        }
    }

    /// Appends `value`, overwriting a revived cleared slot if one is used.
    pub fn push(&mut self, value: T, arena: &'a Arena) {
        let mut value = Some(value);
        let slot = self.add_with(arena, || value.take().unwrap());
        if let Some(v) = value.take() {
            *slot = v;
        }
    }

    /// Drops the logical contents. Elements stay constructed in
    /// `[0, allocated)` and are revived by later adds.
    pub fn clear(&mut self) {
        match self {
            RepeatedPtr::Empty => {}
            RepeatedPtr::Inline { live, .. } => *live = false,
            RepeatedPtr::Spilled(s) => s.current = 0,
        }
    }

    /// Moves the inline element into a fresh spilled array.
    #[cold]
    fn spill(&mut self, arena: &'a Arena) {
        let old = std::mem::replace(self, RepeatedPtr::Empty);
        let RepeatedPtr::Inline { elem, live } = old else {
            unreachable!();
        };
        debug_assert!(live);
        let ptr = arena.alloc_array::<T>(MIN_CAP as usize);
        // Safety: slot 0 is raw capacity from a fresh allocation.
        unsafe { ptr.as_ptr().write(elem) };
        *self = RepeatedPtr::Spilled(Spill {
            ptr,
            current: 1,
            allocated: 1,
            cap: MIN_CAP,
            _arena: PhantomData,
        });
    }

    /// (current, allocated, cap) for the spilled representation; used to
    /// observe the cleared-slot reuse behavior in tests.
    #[cfg(test)]
    pub(crate) fn spill_counts(&self) -> Option<(u32, u32, u32)> {
        match self {
            RepeatedPtr::Spilled(s) => Some((s.current, s.allocated, s.cap)),
            _ => None,
        }
    }
}

impl<'a, T: Reuse> Spill<'a, T> {
    fn add_slot(&mut self, arena: &'a Arena, make: impl FnOnce() -> T) {
        if self.current == self.cap {
            self.grow(arena);
        }
        let idx = self.current as usize;
        // Safety: idx < cap; slots below `allocated` hold constructed
        // elements, slots at or above are raw capacity.
        unsafe {
            let slot = self.ptr.as_ptr().add(idx);
            if self.current < self.allocated {
                (*slot).reuse();
            } else {
                slot.write(make());
                self.allocated += 1;
            }
        }
        self.current += 1;
    }

    #[cold]
    fn grow(&mut self, arena: &'a Arena) {
        let new_cap = self.cap.checked_mul(2).expect("capacity overflow");
        let old_size = self.cap as usize * size_of::<T>();
        let new_size = new_cap as usize * size_of::<T>();
        // Safety: ptr came from a prior arena allocation of old_size bytes.
        self.ptr = unsafe { arena.realloc(self.ptr.cast(), old_size, new_size).cast() };
        self.cap = new_cap;
    }
}

impl<T: Reuse + std::fmt::Debug> std::fmt::Debug for RepeatedPtr<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

#[cfg(test)]
#[path = "./repeated_ptr_tests.rs"]
mod tests;
