//! First-come-first-served asynchronous mutual exclusion
//!
//! [`Mutex`] serializes critical sections between tasks without parking an OS
//! thread per waiter. Waiters are queued and granted the lock strictly in the
//! order they called [`Mutex::acquire`]; a released lock is handed to the oldest
//! waiter, so a newcomer can never overtake the queue.
//!
//! The lock is released whenever its guard is dropped: on normal return, on an
//! early `?` return, and while unwinding from a panic. The lock is not poisoned by
//! a panicking holder.
//!
//! The lock is not reentrant. A task that calls `acquire` again while it still
//! holds the guard waits for itself forever.
//!
//! # Example
//!
//! ```
//! use blob_ingest::mutex::Mutex;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let counter = Mutex::new(0u64);
//! counter.with_lock(|n| *n += 1).await;
//! assert_eq!(*counter.acquire().await, 1);
//! # }
//! ```

use futures::future::BoxFuture;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Asynchronous FIFO mutex guarding a value of type `T`
pub struct Mutex<T> {
    // tokio's mutex queues waiters on a fair semaphore
    inner: tokio::sync::Mutex<T>,
    waiters: AtomicUsize,
}

/// Release handle returned by [`Mutex::acquire`]
///
/// Dropping the guard (or calling [`MutexGuard::release`]) hands the lock to the
/// next waiter.
#[derive(Debug)]
pub struct MutexGuard<'a, T> {
    guard: tokio::sync::MutexGuard<'a, T>,
}

/// Decrements the waiter count even if the acquiring future is cancelled
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Mutex<T> {
    /// Create an unlocked mutex
    pub fn new(value: T) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(value),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Wait for this caller's turn and take the lock
    pub async fn acquire(&self) -> MutexGuard<'_, T> {
        // try_lock cannot barge: a released permit goes to the queued waiter first
        if let Ok(guard) = self.inner.try_lock() {
            return MutexGuard { guard };
        }

        let queued = self.waiters.fetch_add(1, Ordering::SeqCst) + 1;
        let _waiting = Waiting(&self.waiters);
        tracing::trace!(waiters = queued, "lock contended, queueing");

        let guard = self.inner.lock().await;
        MutexGuard { guard }
    }

    /// Take the lock only if nobody holds it
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock().ok().map(|guard| MutexGuard { guard })
    }

    /// Number of tasks currently suspended in [`Mutex::acquire`]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Run `f` on the guarded value while holding the lock
    ///
    /// The lock is released before the result (or a panic raised by `f`) reaches
    /// the caller.
    pub async fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire().await;
        f(&mut guard)
    }

    /// Run an asynchronous critical section while holding the lock
    ///
    /// The lock stays held across every suspension point of the returned future
    /// and is released on every exit path, including an `Err` result or a panic.
    ///
    /// ```
    /// use blob_ingest::mutex::Mutex;
    /// use futures::FutureExt;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let cache: Mutex<Option<String>> = Mutex::new(None);
    /// let value = cache
    ///     .with_lock_async(|slot| {
    ///         async move {
    ///             if slot.is_none() {
    ///                 tokio::task::yield_now().await;
    ///                 *slot = Some("fresh".to_string());
    ///             }
    ///             slot.clone()
    ///         }
    ///         .boxed()
    ///     })
    ///     .await;
    /// assert_eq!(value.as_deref(), Some("fresh"));
    /// # }
    /// ```
    pub async fn with_lock_async<R, F>(&self, f: F) -> R
    where
        F: for<'g> FnOnce(&'g mut T) -> BoxFuture<'g, R>,
    {
        let mut guard = self.acquire().await;
        f(&mut guard).await
    }

    /// Mutable access without locking (requires exclusive ownership)
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the mutex and return the guarded value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.inner.try_lock().is_err())
            .field("waiters", &self.waiters())
            .finish()
    }
}

impl<T> MutexGuard<'_, T> {
    /// Release the lock explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
