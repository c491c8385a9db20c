//! Raw pointers that can be moved into rayon workers.
//!
//! Whoever creates one of these guarantees that the pointee outlives every
//! access and that concurrent writes never target the same element.

use std::ops::Deref;

pub struct ThreadSafeConstPtr<T> {
    ptr: *const T,
}
unsafe impl<T> Sync for ThreadSafeConstPtr<T> {}
unsafe impl<T> Send for ThreadSafeConstPtr<T> {}
impl<T> ThreadSafeConstPtr<T> {
    pub fn new(ptr: *const T) -> ThreadSafeConstPtr<T> {
        ThreadSafeConstPtr { ptr }
    }

    pub fn null() -> ThreadSafeConstPtr<T> {
        ThreadSafeConstPtr { ptr: std::ptr::null() }
    }
}
impl<T: Copy> ThreadSafeConstPtr<T> {
    /// # Safety
    /// `idx` must be in bounds of the allocation this pointer was created from.
    #[inline(always)]
    pub unsafe fn read(&self, idx: usize) -> T {
        *self.ptr.add(idx)
    }
}
impl<T> Deref for ThreadSafeConstPtr<T> {
    type Target = *const T;
    fn deref(&self) -> &Self::Target {
        &self.ptr
    }
}
impl<T> Copy for ThreadSafeConstPtr<T> {}
impl<T> Clone for ThreadSafeConstPtr<T> {
    fn clone(&self) -> Self {
        ThreadSafeConstPtr { ptr: self.ptr }
    }
}

pub struct ThreadSafeMutPtr<T> {
    ptr: *mut T,
}
unsafe impl<T> Sync for ThreadSafeMutPtr<T> {}
unsafe impl<T> Send for ThreadSafeMutPtr<T> {}
impl<T> ThreadSafeMutPtr<T> {
    pub fn new(ptr: *mut T) -> ThreadSafeMutPtr<T> {
        ThreadSafeMutPtr { ptr }
    }

    pub fn null() -> ThreadSafeMutPtr<T> {
        ThreadSafeMutPtr {
            ptr: std::ptr::null_mut(),
        }
    }

    /// Exclusive reference to the element at `idx`.
    ///
    /// # Safety
    /// `idx` must be in bounds and no other reference to that element may be
    /// alive while the returned one is used.
    #[inline(always)]
    pub unsafe fn element_mut<'a>(&self, idx: usize) -> &'a mut T {
        &mut *self.ptr.add(idx)
    }
}
impl<T: Copy> ThreadSafeMutPtr<T> {
    /// # Safety
    /// `idx` must be in bounds and not written concurrently.
    #[inline(always)]
    pub unsafe fn read(&self, idx: usize) -> T {
        *self.ptr.add(idx)
    }

    /// # Safety
    /// `idx` must be in bounds and not accessed concurrently by another thread.
    #[inline(always)]
    pub unsafe fn write(&self, idx: usize, value: T) {
        *self.ptr.add(idx) = value;
    }
}
impl<T> Deref for ThreadSafeMutPtr<T> {
    type Target = *mut T;
    fn deref(&self) -> &Self::Target {
        &self.ptr
    }
}
impl<T> Copy for ThreadSafeMutPtr<T> {}
impl<T> Clone for ThreadSafeMutPtr<T> {
    fn clone(&self) -> Self {
        ThreadSafeMutPtr { ptr: self.ptr }
    }
}

#[test]
fn thread_safe_mut_ptr_disjoint_writes() {
    use rayon::prelude::*;

    let mut values = vec![0usize; 1000];
    let ptr = ThreadSafeMutPtr::new(values.as_mut_ptr());
    (0..1000usize).into_par_iter().for_each(|i| unsafe {
        ptr.write(i, i * 2);
    });
    assert!(values.iter().enumerate().all(|(i, &v)| v == i * 2));
}
