//! Cancellable wait/notify primitives.
//!
//! Nothing here can preempt a thread. Every blocking call takes a [`CancelToken`]
//! and returns [`Error::Cancelled`] once the token fires, so long waits stay
//! interruptible from the caller's environment (for example a user pressing stop).
//!
//! - [`CancellableLock`] is a mutex whose guard can temporarily release the lock
//!   while waiting on cancellation or on a [`WaitableEvent`].
//! - [`WaitableEvent`] is an auto-reset signal whose [`EventSignal`] handle can be
//!   handed to a completion callback running on any thread.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, after, never, select};

use crate::error::{Error, Result};

/// Cooperative cancellation signal shared between a caller and the code it drives.
///
/// Cloning is cheap; all clones observe the same signal. Once cancelled a token
/// stays cancelled.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    // Dropping the sender disconnects `fired`, which wakes every receiver at once.
    trigger: Mutex<Option<Sender<()>>>,
    fired: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                fired: rx,
            }),
        }
    }

    /// Signal cancellation and wake every thread blocked on this token.
    ///
    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(trigger);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Fail with [`Error::Cancelled`] if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block for up to `timeout` or until cancelled.
    ///
    /// Returns `true` if the token fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.fired.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }

    /// Sleep for `pause`, failing early if cancelled.
    pub fn sleep(&self, pause: Duration) -> Result<()> {
        if self.wait_timeout(pause) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Receiver that becomes ready (disconnected) when the token fires.
    pub(crate) fn fired(&self) -> &Receiver<()> {
        &self.inner.fired
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Mutual exclusion with cancellation-aware waits.
///
/// Poisoning is ignored: the protected state is handed to the next locker as-is.
pub struct CancellableLock<T> {
    inner: Mutex<T>,
}

impl<T> CancellableLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock. It is released when the guard goes out of scope.
    pub fn lock(&self) -> CancellableGuard<'_, T> {
        CancellableGuard {
            lock: self,
            guard: Some(self.acquire()),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped holder of a [`CancellableLock`].
pub struct CancellableGuard<'a, T> {
    lock: &'a CancellableLock<T>,
    // Only vacated for the duration of `unlocked`.
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> CancellableGuard<'_, T> {
    /// Release the lock, wait up to `timeout` for cancellation, then re-acquire.
    ///
    /// Returns [`Error::Cancelled`] if the token fired. The lock is held again on
    /// both paths.
    pub fn wait(&mut self, cancel: &CancelToken, timeout: Duration) -> Result<()> {
        if self.unlocked(|| cancel.wait_timeout(timeout)) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Release the lock, wait for `event`, cancellation or `timeout`, then re-acquire.
    ///
    /// `None` waits without a deadline. Returns `true` when the event was signalled
    /// and `false` on timeout.
    pub fn wait_for_event(
        &mut self,
        event: &WaitableEvent,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.unlocked(|| event.wait(cancel, timeout))
    }

    /// Release the lock, sleep for `pause`, then re-acquire.
    pub fn drop_and_reacquire(&mut self, pause: Duration) {
        self.unlocked(|| thread::sleep(pause));
    }

    fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        drop(self.guard.take());
        let out = f();
        self.guard = Some(self.lock.acquire());
        out
    }
}

impl<T> Deref for CancellableGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(g) => g,
            None => unreachable!("lock guard accessed while released"),
        }
    }
}

impl<T> DerefMut for CancellableGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(g) => g,
            None => unreachable!("lock guard accessed while released"),
        }
    }
}

/// Auto-reset event for "async operation completed" notifications.
///
/// A signal raised before anyone waits is kept until the next wait consumes it.
/// Repeated signals before a wait collapse into one.
pub struct WaitableEvent {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WaitableEvent {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self { tx, rx }
    }

    /// Duplicate a handle that can signal this event from another thread.
    pub fn signal_handle(&self) -> EventSignal {
        EventSignal {
            tx: self.tx.clone(),
        }
    }

    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }

    /// Block until signalled, cancelled, or `timeout` elapses.
    ///
    /// Returns `true` when signalled, `false` on timeout.
    pub fn wait(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<bool> {
        cancel.check()?;
        if self.rx.try_recv().is_ok() {
            return Ok(true);
        }
        let deadline = match timeout {
            Some(t) => after(t),
            None => never::<Instant>(),
        };
        select! {
            recv(self.rx) -> _ => Ok(true),
            recv(cancel.fired()) -> _ => Err(Error::Cancelled),
            recv(deadline) -> _ => Ok(false),
        }
    }
}

impl Default for WaitableEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, `Send` handle that signals a [`WaitableEvent`].
///
/// Signalling after the event is gone is a no-op.
#[derive(Clone, Debug)]
pub struct EventSignal {
    tx: Sender<()>,
}

impl EventSignal {
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }
}
