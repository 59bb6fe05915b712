//! Host collaborators for interactive login.
//!
//! The credential prompt must run on the host's UI thread, so the coordinator
//! never calls [`CredentialPrompt`] directly; it schedules the call through a
//! [`MainThread`].

use std::fmt;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Username and password entered by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the user did with a credential prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptOutcome {
    Entered(Credentials),
    Cancelled,
}

/// Asks the user for credentials. `message` explains why a previous attempt failed.
pub trait CredentialPrompt: Send + Sync {
    fn prompt(&self, message: Option<&str>) -> PromptOutcome;
}

/// A boxed unit of work for the UI thread.
pub type MainThreadTask = Box<dyn FnOnce() + Send + 'static>;

/// Schedules work onto the host's UI/main thread.
///
/// Implementations must not run the task on the calling thread: callers may be
/// holding locks the task needs.
pub trait MainThread: Send + Sync {
    fn run(&self, task: MainThreadTask);
}

/// Runs every task on a fresh background thread. For hosts without a UI loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedThread;

impl MainThread for DetachedThread {
    fn run(&self, task: MainThreadTask) {
        thread::spawn(task);
    }
}

/// Task queue drained by whichever thread the host designates as "main".
///
/// [`MainThreadQueue::handle`] gives the scheduling side; the owning thread calls
/// [`run_pending`](Self::run_pending) or [`run_for`](Self::run_for) from its loop.
pub struct MainThreadQueue {
    tx: Sender<MainThreadTask>,
    rx: Receiver<MainThreadTask>,
}

impl MainThreadQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn handle(&self) -> MainThreadHandle {
        MainThreadHandle {
            tx: self.tx.clone(),
        }
    }

    /// Tasks scheduled but not yet run.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Run every task queued right now. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one task and run it. Returns `true` if one ran.
    pub fn run_for(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling side of a [`MainThreadQueue`].
#[derive(Clone)]
pub struct MainThreadHandle {
    tx: Sender<MainThreadTask>,
}

impl MainThread for MainThreadHandle {
    fn run(&self, task: MainThreadTask) {
        if self.tx.send(task).is_err() {
            tracing::warn!("main thread queue closed; task dropped");
        }
    }
}
