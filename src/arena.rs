#![allow(unsafe_code)]

use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::{self, NonNull};

const SLAB_ALIGN: usize = std::mem::align_of::<SlabHeader>();
const HEADER_SIZE: usize = std::mem::size_of::<SlabHeader>();
const INITIAL_SLAB_SIZE: usize = 1024;

const _: () = assert!(HEADER_SIZE == 16);
const _: () = assert!(SLAB_ALIGN == 8);

#[repr(C)]
struct SlabHeader {
    prev: Option<NonNull<SlabHeader>>,
    size: usize,
}

// Safety: EMPTY_SLAB is an immutable sentinel (prev=None, size=0). SlabHeaders
// on the heap are only reachable through Arena, which is !Sync due to Cell.
unsafe impl Sync for SlabHeader {}

static EMPTY_SLAB: SlabHeader = SlabHeader {
    prev: None,
    size: 0,
};

/// A cleanup record for an object that needs its destructor run when the
/// arena is dropped. Records form an intrusive chain through arena memory.
struct CleanupNode {
    prev: Option<NonNull<CleanupNode>>,
    object: NonNull<u8>,
    dropper: unsafe fn(NonNull<u8>),
}

/// A bump allocator that allocates from increasingly large slabs.
///
/// All allocations are bulk-freed when the arena is dropped. Individual
/// deallocation is not supported. Objects with non-trivial destructors can be
/// registered with `register_cleanup`; their destructors run (newest first)
/// before the slabs are released.
///
/// Every parsed message, container backing array and copied byte span lives
/// in an arena and borrows its lifetime from it. An arena must not be shared
/// between concurrently running parses; it is `!Sync`.
pub struct Arena {
    ptr: Cell<NonNull<u8>>,
    end: Cell<NonNull<u8>>,
    slab: Cell<NonNull<SlabHeader>>,
    cleanup: Cell<Option<NonNull<CleanupNode>>>,
}

const _: () = assert!(std::mem::size_of::<Arena>() == 32);

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        // Safety: EMPTY_SLAB is a static with a stable address.
        let sentinel =
            unsafe { NonNull::new_unchecked(&EMPTY_SLAB as *const SlabHeader as *mut SlabHeader) };
        let dangling = NonNull::dangling();
        Arena {
            ptr: Cell::new(dangling),
            end: Cell::new(dangling),
            slab: Cell::new(sentinel),
            cleanup: Cell::new(None),
        }
    }

    /// Allocate `layout.size()` bytes with the given alignment.
    ///
    /// Returns a non-null pointer to the allocated region. Aborts on OOM.
    #[inline]
    pub(crate) fn alloc(&self, layout: Layout) -> NonNull<u8> {
        if layout.size() == 0 {
            // Safety: layout.align() is always a non-zero power of two.
            return unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
        }

        let ptr = self.ptr.get().as_ptr() as usize;
        let aligned = (ptr + layout.align() - 1) & !(layout.align() - 1);
        let new_ptr = aligned + layout.size();

        if new_ptr <= self.end.get().as_ptr() as usize {
            // Safety: new_ptr is within the current slab's bounds.
            unsafe {
                self.ptr.set(NonNull::new_unchecked(new_ptr as *mut u8));
                NonNull::new_unchecked(aligned as *mut u8)
            }
        } else {
            self.alloc_slow(layout)
        }
    }

    #[cold]
    #[inline(never)]
    fn alloc_slow(&self, layout: Layout) -> NonNull<u8> {
        self.grow(layout);

        let ptr = self.ptr.get().as_ptr() as usize;
        let aligned = (ptr + layout.align() - 1) & !(layout.align() - 1);
        let new_ptr = aligned + layout.size();
        debug_assert!(new_ptr <= self.end.get().as_ptr() as usize);

        // Safety: grow() guarantees the new slab is large enough.
        unsafe {
            self.ptr.set(NonNull::new_unchecked(new_ptr as *mut u8));
            NonNull::new_unchecked(aligned as *mut u8)
        }
    }

    /// Allocate an uninitialized array of `len` elements of `T`.
    #[inline]
    pub(crate) fn alloc_array<T>(&self, len: usize) -> NonNull<T> {
        let layout = Layout::array::<T>(len).expect("layout overflow");
        self.alloc(layout).cast()
    }

    /// Move `value` into the arena. The destructor of `T` will **not** run;
    /// use `register_cleanup` if it must.
    #[inline]
    pub(crate) fn alloc_value<T>(&self, value: T) -> NonNull<T> {
        let ptr = self.alloc(Layout::new::<T>()).cast::<T>();
        // Safety: ptr is freshly allocated with T's layout.
        unsafe { ptr.as_ptr().write(value) };
        ptr
    }

    /// Copy a byte slice into the arena, returning a slice that lives as long
    /// as the arena.
    pub fn copy_slice<'a>(&'a self, bytes: &[u8]) -> &'a [u8] {
        if bytes.is_empty() {
            return &[];
        }
        let dst = self.alloc_array::<u8>(bytes.len());
        // Safety: dst is a fresh region of bytes.len() bytes; the regions
        // cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            std::slice::from_raw_parts(dst.as_ptr(), bytes.len())
        }
    }

    /// Grow an earlier allocation of `old_size` bytes to `new_size` bytes.
    ///
    /// If `ptr` is the most recent allocation the region is extended in place
    /// when the slab has room; otherwise a new region is allocated and the
    /// old contents copied. The old region is never freed.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc`/`realloc` on this arena with
    /// a size of exactly `old_size` bytes, and `new_size >= old_size`.
    pub(crate) unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> NonNull<u8> {
        debug_assert!(new_size >= old_size);
        let bump = self.ptr.get().as_ptr() as usize;
        let base = ptr.as_ptr() as usize;
        if base + old_size == bump && base + new_size <= self.end.get().as_ptr() as usize {
            // Safety: extending the most recent allocation within the slab.
            unsafe {
                self.ptr
                    .set(NonNull::new_unchecked((base + new_size) as *mut u8));
            }
            return ptr;
        }
        let layout = Layout::from_size_align(new_size, 8).expect("layout overflow");
        let fresh = self.alloc(layout);
        if old_size > 0 {
            // Safety: both regions are valid for old_size bytes and disjoint.
            unsafe {
                ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size);
            }
        }
        fresh
    }

    /// Register a destructor to run for `object` when the arena is dropped.
    ///
    /// Destructors run newest-first, before any slab is released. `object`
    /// must stay valid until then (it normally lives in this arena).
    pub(crate) fn register_cleanup<T>(&self, object: NonNull<T>) {
        unsafe fn drop_object<T>(p: NonNull<u8>) {
            // Safety: p was registered as a valid, initialized T.
            unsafe { ptr::drop_in_place(p.cast::<T>().as_ptr()) }
        }
        let node = self.alloc_value(CleanupNode {
            prev: self.cleanup.get(),
            object: object.cast(),
            dropper: drop_object::<T>,
        });
        self.cleanup.set(Some(node));
    }

    /// Bytes handed out so far, counted across all slabs.
    #[cfg(test)]
    pub(crate) fn allocated_bytes(&self) -> usize {
        let mut total = 0usize;
        let mut current = self.slab.get();
        loop {
            // Safety: current is either a heap slab or the static sentinel.
            let header = unsafe { current.as_ref() };
            if header.size == 0 {
                break;
            }
            total += header.size - HEADER_SIZE;
            match header.prev {
                Some(p) => current = p,
                None => break,
            }
        }
        total - (self.end.get().as_ptr() as usize - self.ptr.get().as_ptr() as usize)
    }

    fn grow(&self, layout: Layout) {
        let current_size = unsafe { self.slab.get().as_ref().size };

        let min_slab = HEADER_SIZE
            .checked_add(layout.align() - 1)
            .and_then(|s| s.checked_add(layout.size()))
            .expect("layout overflow");

        let new_size = current_size
            .saturating_mul(2)
            .max(min_slab)
            .max(INITIAL_SLAB_SIZE);

        let slab_layout =
            Layout::from_size_align(new_size, SLAB_ALIGN).expect("slab layout overflow");

        let raw = unsafe { std::alloc::alloc(slab_layout) };
        let Some(base) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(slab_layout);
        };

        // Safety: base points to a freshly allocated region of new_size bytes.
        unsafe {
            let header_ptr = base.as_ptr().cast::<SlabHeader>();
            header_ptr.write(SlabHeader {
                prev: Some(self.slab.get()),
                size: new_size,
            });

            self.slab.set(NonNull::new_unchecked(header_ptr));
            self.ptr
                .set(NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE)));
            self.end
                .set(NonNull::new_unchecked(base.as_ptr().add(new_size)));
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Run registered destructors newest-first. The records and their
        // objects live in arena memory, which is still intact here.
        let mut cleanup = self.cleanup.get();
        while let Some(node) = cleanup {
            // Safety: node was written by register_cleanup and never moved.
            let node = unsafe { node.as_ref() };
            // Safety: register_cleanup's contract keeps the object valid.
            unsafe { (node.dropper)(node.object) };
            cleanup = node.prev;
        }

        let mut current = self.slab.get();
        loop {
            // Safety: current is either a heap slab or the static sentinel.
            let header = unsafe { current.as_ref() };
            if header.size == 0 {
                break;
            }
            let prev = header.prev;
            // Safety: header.size and SLAB_ALIGN match the layout used in grow().
            let slab_layout = unsafe { Layout::from_size_align_unchecked(header.size, SLAB_ALIGN) };
            unsafe {
                std::alloc::dealloc(current.as_ptr().cast(), slab_layout);
            }
            match prev {
                Some(p) => current = p,
                None => break,
            }
        }
    }
}

#[cfg(test)]
#[path = "./arena_tests.rs"]
mod tests;
