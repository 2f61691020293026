//! Interruptible blocking lock for the gateway paths
//!
//! Synchronous and control operations on one session are serialized through a
//! single lock. A caller blocked on that lock can be told to give up via a
//! [`CancelToken`]; the abandoned wait performs no device access and returns a
//! retryable outcome. Teardown uses the uncancelable variant to drain an
//! in-flight transfer before releasing session resources.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Signal that aborts a pending lock wait.
///
/// Clones share the same underlying flag, so a token handed to a blocked
/// caller can be fired from any other thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Re-arm the token so the owner can retry after an interrupted wait.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

/// The lock wait was cancelled; nothing was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Interval at which a blocked waiter rechecks its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// A blocking mutex whose acquisition can be abandoned by a cancel token.
///
/// Admission goes through a condvar-gated flag; the data itself sits in a
/// plain `Mutex` that only the admitted holder ever locks, so the guard needs
/// no unsafe code.
pub struct InterruptibleMutex<T> {
    gate: Mutex<bool>,
    released: Condvar,
    data: Mutex<T>,
}

impl<T> InterruptibleMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            gate: Mutex::new(false),
            released: Condvar::new(),
            data: Mutex::new(value),
        }
    }

    /// Acquire the lock, giving up if `cancel` fires before admission.
    ///
    /// A token that is already cancelled fails the acquisition immediately
    /// without waiting.
    pub fn lock(&self, cancel: &CancelToken) -> Result<InterruptibleGuard<'_, T>, Interrupted> {
        let mut held = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if cancel.is_cancelled() {
                return Err(Interrupted);
            }
            if !*held {
                break;
            }
            let (gate, _timed_out) = self
                .released
                .wait_timeout(held, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            held = gate;
        }
        *held = true;
        drop(held);
        Ok(self.admitted())
    }

    /// Acquire the lock unconditionally.
    ///
    /// Used by teardown to drain an in-flight transfer; never called from a
    /// client context.
    pub fn lock_uncancelable(&self) -> InterruptibleGuard<'_, T> {
        let mut held = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        *held = true;
        drop(held);
        self.admitted()
    }

    fn admitted(&self) -> InterruptibleGuard<'_, T> {
        // Uncontended: only the thread that won the gate locks the data.
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        InterruptibleGuard {
            data: Some(data),
            owner: self,
        }
    }
}

/// RAII guard for [`InterruptibleMutex`]. Releases the lock on every exit
/// path, panics included.
pub struct InterruptibleGuard<'a, T> {
    data: Option<MutexGuard<'a, T>>,
    owner: &'a InterruptibleMutex<T>,
}

impl<T> Deref for InterruptibleGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data.as_ref().expect("guard accessed after release")
    }
}

impl<T> DerefMut for InterruptibleGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data.as_mut().expect("guard accessed after release")
    }
}

impl<T> Drop for InterruptibleGuard<'_, T> {
    fn drop(&mut self) {
        // Release the data mutex before opening the gate.
        self.data.take();
        let mut held = self
            .owner
            .gate
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *held = false;
        drop(held);
        self.owner.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_lock_and_mutate() {
        let lock = InterruptibleMutex::new(0u32);
        let token = CancelToken::new();

        {
            let mut guard = lock.lock(&token).unwrap();
            *guard += 1;
        }
        assert_eq!(*lock.lock_uncancelable(), 1);
    }

    #[test]
    fn test_precancelled_token_fails_immediately() {
        let lock = InterruptibleMutex::new(());
        let token = CancelToken::new();
        token.cancel();

        assert_eq!(lock.lock(&token).err(), Some(Interrupted));
    }

    #[test]
    fn test_contended_wait_is_cancellable() {
        let lock = Arc::new(InterruptibleMutex::new(()));
        let token = CancelToken::new();

        let guard = lock.lock_uncancelable();

        let waiter_lock = lock.clone();
        let waiter_token = token.clone();
        let waiter = thread::spawn(move || waiter_lock.lock(&waiter_token).err());

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert_eq!(waiter.join().unwrap(), Some(Interrupted));
        drop(guard);

        // The lock is still usable after an abandoned wait.
        token.reset();
        assert!(lock.lock(&token).is_ok());
    }

    #[test]
    fn test_serializes_concurrent_holders() {
        let lock = Arc::new(InterruptibleMutex::new(Vec::new()));
        let mut threads = Vec::new();

        for i in 0..4u32 {
            let lock = lock.clone();
            threads.push(thread::spawn(move || {
                let token = CancelToken::new();
                let mut guard = lock.lock(&token).unwrap();
                guard.push(i);
                thread::sleep(Duration::from_millis(10));
                guard.push(i);
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        // Each holder's two pushes are adjacent when access is exclusive.
        let values = lock.lock_uncancelable();
        for pair in values.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
