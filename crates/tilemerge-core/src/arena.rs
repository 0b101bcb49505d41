// SPDX-License-Identifier: CEPL-1.0
//! Bump allocator for short-lived scratch data.
//!
//! Allocations borrow the arena immutably, so any number of scratch slices can
//! be alive at once. Rewinding to a [`Watermark`] needs `&mut self`, which the
//! borrow checker only grants once every slice handed out since has been
//! dropped.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::Cell;
use std::ptr::NonNull;

use thiserror::Error;

/// Strictest alignment the arena hands out.
const MAX_ALIGN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("scratch arena exhausted: need {needed} bytes, {available} available")]
    Exhausted { needed: usize, available: usize },
    #[error("alignment {0} exceeds the arena maximum of {MAX_ALIGN}")]
    Alignment(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermark(usize);

pub struct ScratchArena {
    base: NonNull<u8>,
    layout: Layout,
    top: Cell<usize>,
    peak: Cell<usize>,
}

impl ScratchArena {
    pub fn new(capacity: usize) -> Self {
        let layout = match Layout::from_size_align(capacity.max(1), MAX_ALIGN) {
            Ok(l) => l,
            Err(_) => handle_alloc_error(Layout::new::<u8>()),
        };
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout));
        Self {
            base,
            layout,
            top: Cell::new(0),
            peak: Cell::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn used(&self) -> usize {
        self.top.get()
    }

    /// Highest `used()` ever observed; handy for sizing the arena.
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    pub fn mark(&self) -> Watermark {
        Watermark(self.top.get())
    }

    pub fn restore(&mut self, mark: Watermark) {
        debug_assert!(mark.0 <= self.top.get(), "watermark from the future");
        self.top.set(mark.0.min(self.top.get()));
    }

    pub fn reset(&mut self) {
        self.top.set(0);
    }

    /// Runs `f` with the arena and rewinds everything it allocated afterwards.
    pub fn scope<R>(&mut self, f: impl FnOnce(&ScratchArena) -> R) -> R {
        let mark = self.mark();
        let out = f(self);
        self.restore(mark);
        out
    }

    fn bump<T>(&self, len: usize) -> Result<NonNull<T>, ArenaError> {
        let align = std::mem::align_of::<T>();
        if align > MAX_ALIGN {
            return Err(ArenaError::Alignment(align));
        }
        let bytes = std::mem::size_of::<T>()
            .checked_mul(len)
            .ok_or(ArenaError::Exhausted {
                needed: usize::MAX,
                available: self.capacity() - self.used(),
            })?;
        let start = (self.top.get() + align - 1) & !(align - 1);
        let end = start.checked_add(bytes).filter(|&e| e <= self.capacity());
        let Some(end) = end else {
            return Err(ArenaError::Exhausted {
                needed: bytes,
                available: self.capacity().saturating_sub(start),
            });
        };
        self.top.set(end);
        self.peak.set(self.peak.get().max(end));
        // SAFETY: start <= capacity, so the offset stays inside the allocation.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start).cast::<T>()) })
    }

    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<&mut [T], ArenaError> {
        let ptr = self.bump::<T>(src.len())?;
        // SAFETY: the region [ptr, ptr + len) was just reserved, is aligned for T
        // and is not reachable through any other live reference.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), src.len()))
        }
    }

    pub fn alloc_slice_fill<T: Copy>(&self, len: usize, value: T) -> Result<&mut [T], ArenaError> {
        let ptr = self.bump::<T>(len)?;
        // SAFETY: see alloc_slice_copy; every element is written before the
        // slice is formed.
        unsafe {
            for i in 0..len {
                ptr.as_ptr().add(i).write(value);
            }
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), len))
        }
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        // SAFETY: base was returned by alloc with this exact layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for ScratchArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchArena")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("peak", &self.peak())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_stay_valid_side_by_side() {
        let arena = ScratchArena::new(256);
        let a = arena.alloc_slice_copy(&[1u32, 2, 3]).unwrap();
        let b = arena.alloc_slice_fill(4, 7u8).unwrap();
        a[0] = 10;
        assert_eq!(a, &[10, 2, 3]);
        assert_eq!(b, &[7, 7, 7, 7]);
    }

    #[test]
    fn allocations_are_aligned() {
        let arena = ScratchArena::new(256);
        let _ = arena.alloc_slice_copy(&[1u8]).unwrap();
        let wide = arena.alloc_slice_copy(&[1u64, 2]).unwrap();
        assert_eq!(wide.as_ptr() as usize % std::mem::align_of::<u64>(), 0);
    }

    #[test]
    fn restore_rewinds_to_watermark() {
        let mut arena = ScratchArena::new(128);
        let _ = arena.alloc_slice_fill(8, 0u32).unwrap();
        let mark = arena.mark();
        let _ = arena.alloc_slice_fill(8, 0u32).unwrap();
        assert_eq!(arena.used(), 64);
        arena.restore(mark);
        assert_eq!(arena.used(), 32);
        assert_eq!(arena.peak(), 64);
    }

    #[test]
    fn scope_releases_everything_it_pushed() {
        let mut arena = ScratchArena::new(128);
        let sum = arena.scope(|s| {
            let v = s.alloc_slice_copy(&[1u16, 2, 3]).unwrap();
            v.iter().map(|&x| x as u32).sum::<u32>()
        });
        assert_eq!(sum, 6);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn exhaustion_is_reported_not_overrun() {
        let arena = ScratchArena::new(16);
        let err = arena.alloc_slice_fill(5, 0u32).unwrap_err();
        assert_eq!(
            err,
            ArenaError::Exhausted {
                needed: 20,
                available: 16
            }
        );
        assert_eq!(arena.used(), 0);
    }
}
