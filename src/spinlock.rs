//! # SpinLock
//!
//! Test-and-set lock guarding the slow path of
//! [`LazySingleton`](crate::LazySingleton). Critical sections under this lock
//! are a handful of instructions, except for the one-time construction of the
//! singleton value, so spinning with [`BackOff`] is preferable to parking.
//!
//! The lock is released by [`SpinGuard`]'s `Drop`, which also runs while a
//! panic unwinds through the critical section. A constructor that fails or
//! panics can therefore never leave the lock held.
//!
//! The lock also counts acquisitions that had to wait. Tests use it to prove
//! that concurrent first callers really raced for the slow path.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{
    AtomicBool, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::BackOff;

/// A spin-based mutual exclusion primitive.
pub struct SpinLock<T> {
    data: UnsafeCell<T>,
    locked: AtomicBool,
    contended: AtomicUsize,
}

/// Releases the [`SpinLock`] when dropped.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Drop for SpinGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Release)
    }
}

impl<T> SpinLock<T> {
    /// Creates an unlocked lock around `data`.
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        SpinLock {
            data: UnsafeCell::new(data),
            locked: AtomicBool::new(false),
            contended: AtomicUsize::new(0),
        }
    }

    /// Acquires the lock, spinning with backoff until it is free.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        if let Some(guard) = self.try_lock() {
            return guard;
        }

        self.contended.fetch_add(1, Relaxed);
        let backoff = BackOff::new();
        loop {
            // Test before test-and-set so waiters spin on a shared cache line.
            while self.is_locked() {
                backoff.wait();
            }
            if let Some(guard) = self.try_lock() {
                return guard;
            }
        }
    }

    /// Acquires the lock only if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.locked.swap(true, Acquire) {
            None
        } else {
            Some(SpinGuard { lock: self })
        }
    }

    /// Whether some guard currently holds the lock.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Acquire)
    }

    /// Number of [`lock`](Self::lock) calls that found the lock held.
    pub fn contended_acquisitions(&self) -> usize {
        self.contended.load(Relaxed)
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while `locked` is held by this thread.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` makes the access unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

// SAFETY: SpinLock enforces mutual exclusion via atomic operations.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}
