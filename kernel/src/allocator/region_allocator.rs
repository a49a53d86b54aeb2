use core::{alloc::Layout, ptr::NonNull};

use spin::Mutex;

use super::{AllocError, PhysAlloc};
use crate::debug;

/// Bump allocator over one contiguous region.
pub struct RegionAllocator {
    name: &'static str,
    next: usize,
    end: usize,
}

impl RegionAllocator {
    /// # Safety
    /// `[base, base + size)` must be valid, writable, non-null memory that
    /// belongs to this allocator alone for the rest of the kernel's life.
    pub unsafe fn new(name: &'static str, base: usize, size: usize) -> Self {
        Self {
            name,
            next: base,
            end: base + size,
        }
    }

    pub fn remaining(&self) -> usize {
        self.end - self.next
    }

    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let exhausted = AllocError::Exhausted {
            pool: self.name,
            requested: layout.size(),
            remaining: self.remaining(),
        };

        // `Layout` guarantees a power-of-two alignment
        let mask = layout.align() - 1;
        let start = match self.next.checked_add(mask) {
            Some(addr) => addr & !mask,
            None => return Err(exhausted),
        };
        let end = match start.checked_add(layout.size()) {
            Some(end) if end <= self.end => end,
            _ => return Err(exhausted),
        };
        let ptr = NonNull::new(start as *mut u8).ok_or(exhausted)?;

        self.next = end;
        unsafe {
            ptr.as_ptr().write_bytes(0, layout.size());
        }
        debug!(
            "{}Pool::allocate: {:?} bytes at {:#x}, {:?} left",
            self.name,
            layout.size(),
            start,
            self.remaining()
        );
        Ok(ptr)
    }
}

unsafe impl PhysAlloc for Mutex<RegionAllocator> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.lock().allocate(layout)
    }

    fn name(&self) -> &'static str {
        self.lock().name
    }
}

#[cfg(test)]
impl RegionAllocator {
    /// a pool over a leaked heap buffer
    pub fn leaked(name: &'static str, size: usize) -> Mutex<Self> {
        let region: &'static mut [u8] = Box::leak(vec![0xa5u8; size].into_boxed_slice());
        Mutex::new(unsafe { Self::new(name, region.as_mut_ptr() as usize, size) })
    }
}
