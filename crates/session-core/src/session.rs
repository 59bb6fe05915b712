//! Session coordinator: the one place that touches the remote session.
//!
//! Three independent pieces of shared state, each with its own primitive:
//! - the remote session itself, behind a [`CancellableLock`]; every SDK call is
//!   serialized through it,
//! - the login state machine, behind a plain mutex + condvar so waiters never
//!   hold the session lock,
//! - the decoder slot, a lock-free compare-and-set cell so ownership checks on
//!   the decode hot path never block behind a long SDK call.
//!
//! The session is created lazily on first use and lives until [`SessionCoordinator::shutdown`].

use std::fmt;
use std::num::NonZeroU64;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use stream_input_types::{ConnectionState, LoginState, SessionStatus};

use crate::config::SessionConfig;
use crate::error::{Error, RemoteError, RemoteErrorKind, Result};
use crate::prompt::{CredentialPrompt, MainThread, PromptOutcome};
use crate::pump::{EventPump, PumpTarget};
use crate::queue::BoundedAudioQueue;
use crate::remote::{RemoteConnector, RemoteSession, SessionEvent};
use crate::sync::{CancelToken, CancellableGuard, CancellableLock, WaitableEvent};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a decoder instance competing for the decoder slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        loop {
            let raw = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = NonZeroU64::new(raw) {
                return Self(id);
            }
        }
    }

    /// `None` for zero, which the slot uses to mean "unowned".
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decoder#{}", self.0)
    }
}

enum SessionSlot {
    Uninit,
    Live(Box<dyn RemoteSession>),
    ShutDown,
}

/// Exclusive access to the remote session. Dropping it releases the session lock.
pub struct SessionGuard<'a> {
    inner: CancellableGuard<'a, SessionSlot>,
}

impl SessionGuard<'_> {
    /// Release the session lock while waiting for `event`; see
    /// [`CancellableGuard::wait_for_event`].
    pub fn wait_for_event(
        &mut self,
        event: &WaitableEvent,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let signalled = self.inner.wait_for_event(event, cancel, timeout)?;
        self.ensure_live()?;
        Ok(signalled)
    }

    /// Release the session lock while waiting on `cancel`; see [`CancellableGuard::wait`].
    pub fn wait(&mut self, cancel: &CancelToken, timeout: Duration) -> Result<()> {
        self.inner.wait(cancel, timeout)?;
        self.ensure_live()
    }

    // The slot can be shut down while the lock is released.
    fn ensure_live(&self) -> Result<()> {
        match &*self.inner {
            SessionSlot::Live(_) => Ok(()),
            _ => Err(Error::ShutDown),
        }
    }
}

impl Deref for SessionGuard<'_> {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        match &*self.inner {
            SessionSlot::Live(session) => session.as_ref(),
            _ => unreachable!("session guard outlived its session"),
        }
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut *self.inner {
            SessionSlot::Live(session) => session.as_mut(),
            _ => unreachable!("session guard outlived its session"),
        }
    }
}

#[derive(Debug, Default)]
struct LoginInner {
    state: LoginState,
    last_error: Option<String>,
    // Set when the user cancelled the prompt; waiters fail with `LoginDenied`.
    denied: Option<String>,
}

/// Serializes access to the remote session and arbitrates the decoder slot.
pub struct SessionCoordinator {
    config: SessionConfig,
    connector: Arc<dyn RemoteConnector>,
    prompt: Arc<dyn CredentialPrompt>,
    main_thread: Arc<dyn MainThread>,
    session: CancellableLock<SessionSlot>,
    login: Mutex<LoginInner>,
    login_changed: Condvar,
    decoder_owner: AtomicU64,
    queue: BoundedAudioQueue,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    pump: Mutex<Option<EventPump>>,
    shut_down: AtomicBool,
    self_ref: Weak<SessionCoordinator>,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn RemoteConnector>,
        prompt: Arc<dyn CredentialPrompt>,
        main_thread: Arc<dyn MainThread>,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Arc::new_cyclic(|self_ref| Self {
            queue: BoundedAudioQueue::from_config(&config),
            config,
            connector,
            prompt,
            main_thread,
            session: CancellableLock::new(SessionSlot::Uninit),
            login: Mutex::new(LoginInner::default()),
            login_changed: Condvar::new(),
            decoder_owner: AtomicU64::new(0),
            wake_tx,
            wake_rx,
            pump: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Audio queue fed by the remote session's delivery callback.
    pub fn audio_queue(&self) -> &BoundedAudioQueue {
        &self.queue
    }

    /// Lock the remote session without any login precondition, creating it on first use.
    pub fn lock_session(&self) -> Result<SessionGuard<'_>> {
        let mut guard = self.session.lock();
        if matches!(*guard, SessionSlot::Uninit) {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(Error::ShutDown);
            }
            let sink = EventSink {
                coordinator: self.self_ref.clone(),
            };
            let session = self
                .connector
                .connect(sink)
                .map_err(|e| Error::remote("creating session", e))?;
            *guard = SessionSlot::Live(session);
            self.start_pump();
            tracing::info!("remote session created");
        }
        if matches!(*guard, SessionSlot::Live(_)) {
            Ok(SessionGuard { inner: guard })
        } else {
            Err(Error::ShutDown)
        }
    }

    /// Lock the remote session once it is logged in.
    ///
    /// Triggers a relogin or credential prompt if needed, then waits, polling
    /// `cancel` every `login_poll`.
    pub fn acquire_handle(&self, cancel: &CancelToken) -> Result<SessionGuard<'_>> {
        self.ensure_logged_in()?;
        self.wait_for_login(cancel)?;
        self.lock_session()
    }

    /// Start a login attempt if the remote connection is not usable.
    ///
    /// Silent relogin with stored credentials first; without stored credentials
    /// a single credential prompt is scheduled, unless one is already outstanding.
    pub fn ensure_logged_in(&self) -> Result<()> {
        let mut session = self.lock_session()?;
        let state = session.connection_state();
        match state {
            ConnectionState::LoggedIn | ConnectionState::Offline => {
                drop(session);
                self.observe_usable_connection();
            }
            ConnectionState::LoggedOut
            | ConnectionState::Undefined
            | ConnectionState::Disconnected => match session.relogin() {
                Ok(()) => {
                    drop(session);
                    tracing::debug!(connection = ?state, "relogin requested");
                    self.login_lock().denied = None;
                }
                Err(err) if err.kind == RemoteErrorKind::NoCredentials => {
                    drop(session);
                    self.begin_prompt_if_idle();
                }
                Err(err) => {
                    tracing::warn!(connection = ?state, error = %err, "relogin failed");
                }
            },
        }
        Ok(())
    }

    fn observe_usable_connection(&self) {
        let mut login = self.login_lock();
        if login.state == LoginState::LoggedOut {
            login.state = LoginState::LoggedIn;
            login.denied = None;
            drop(login);
            self.login_changed.notify_all();
        }
    }

    fn begin_prompt_if_idle(&self) {
        let mut login = self.login_lock();
        if login.state == LoginState::LoggingIn {
            return;
        }
        login.state = LoginState::LoggingIn;
        login.denied = None;
        drop(login);
        self.schedule_prompt(None);
    }

    fn schedule_prompt(&self, message: Option<String>) {
        tracing::info!(retry = message.is_some(), "requesting credentials");
        let coordinator = self.self_ref.clone();
        let prompt = self.prompt.clone();
        self.main_thread.run(Box::new(move || {
            let outcome = prompt.prompt(message.as_deref());
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_prompt_outcome(outcome, message);
            }
        }));
    }

    fn on_prompt_outcome(&self, outcome: PromptOutcome, message: Option<String>) {
        match outcome {
            PromptOutcome::Cancelled => {
                let mut login = self.login_lock();
                if login.state == LoginState::LoggingIn {
                    login.state = LoginState::LoggedOut;
                }
                login.denied = Some(message.unwrap_or_else(|| "login cancelled".to_string()));
                drop(login);
                tracing::info!("credential prompt cancelled");
                self.login_changed.notify_all();
            }
            PromptOutcome::Entered(credentials) => {
                let result = match self.lock_session() {
                    Ok(mut session) => session.login(&credentials),
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot log in without a session");
                        self.abandon_login(err.to_string());
                        return;
                    }
                };
                if let Err(err) = result {
                    self.on_login_result(Err(err));
                }
            }
        }
    }

    fn abandon_login(&self, reason: String) {
        let mut login = self.login_lock();
        login.state = LoginState::LoggedOut;
        login.denied = Some(reason);
        drop(login);
        self.login_changed.notify_all();
    }

    /// Block until logged in, the user declines, or `cancel` fires.
    fn wait_for_login(&self, cancel: &CancelToken) -> Result<()> {
        let mut login = self.login_lock();
        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(Error::ShutDown);
            }
            if login.state == LoginState::LoggedIn {
                return Ok(());
            }
            if let Some(reason) = &login.denied {
                return Err(Error::LoginDenied {
                    reason: reason.clone(),
                });
            }
            let (g, _timeout) = self
                .login_changed
                .wait_timeout(login, self.config.login_poll)
                .unwrap_or_else(PoisonError::into_inner);
            login = g;
            cancel.check()?;
        }
    }

    /// Login completion from the remote session (any thread).
    ///
    /// A failure while a prompt-driven attempt is active re-prompts with the
    /// remote's message.
    pub fn on_login_result(&self, result: std::result::Result<(), RemoteError>) {
        let mut login = self.login_lock();
        let mut reprompt = None;
        match result {
            Ok(()) => {
                login.state = LoginState::LoggedIn;
                login.last_error = None;
                login.denied = None;
                tracing::info!("logged in");
            }
            Err(err) => {
                tracing::warn!(error = %err, "login failed");
                login.last_error = Some(err.message.clone());
                if login.state == LoginState::LoggingIn {
                    reprompt = Some(err.message);
                } else {
                    // Silent relogin failed; nobody is going to answer a prompt.
                    login.state = LoginState::LoggedOut;
                    login.denied = Some(err.message);
                }
            }
        }
        drop(login);
        self.login_changed.notify_all();
        if let Some(message) = reprompt {
            self.schedule_prompt(Some(message));
        }
    }

    /// The remote session logged out (any thread).
    ///
    /// Arriving while a silent relogin is pending, it ends that attempt and
    /// waiters fail with [`Error::LoginDenied`]. An outstanding prompt is left alone.
    pub fn on_logged_out(&self) {
        let mut login = self.login_lock();
        match login.state {
            LoginState::LoggedIn => login.state = LoginState::LoggedOut,
            LoginState::LoggedOut if login.denied.is_none() => {
                login.denied = Some("logged out by remote service".to_string());
            }
            _ => {}
        }
        drop(login);
        tracing::info!("logged out");
        self.login_changed.notify_all();
    }

    pub fn login_state(&self) -> LoginState {
        self.login_lock().state
    }

    fn login_lock(&self) -> MutexGuard<'_, LoginInner> {
        self.login.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the decoder slot for `owner`.
    ///
    /// Fails with [`Error::DecoderBusy`] if anyone (including `owner`) already holds
    /// it, or [`Error::DecoderRace`] if a concurrent claim got there first.
    pub fn take_decoder_slot(&self, owner: OwnerId) -> Result<()> {
        if let Some(holder) = OwnerId::from_raw(self.decoder_owner.load(Ordering::Acquire)) {
            return Err(Error::DecoderBusy { holder });
        }
        match self.decoder_owner.compare_exchange(
            0,
            owner.get(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!(owner = %owner, "decoder slot taken");
                Ok(())
            }
            Err(_) => Err(Error::DecoderRace),
        }
    }

    /// Release the decoder slot if, and only if, `owner` holds it.
    pub fn release_decoder_slot(&self, owner: OwnerId) {
        if self
            .decoder_owner
            .compare_exchange(owner.get(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(owner = %owner, "decoder slot released");
        }
    }

    /// Fail with [`Error::CoordinationBugFatal`] unless `owner` holds the decoder slot.
    pub fn ensure_decoder_slot(&self, owner: OwnerId) -> Result<()> {
        if self.has_decoder_slot(owner) {
            Ok(())
        } else {
            tracing::error!(owner = %owner, "decoder slot not held by active decoder");
            Err(Error::CoordinationBugFatal { owner })
        }
    }

    pub fn has_decoder_slot(&self, owner: OwnerId) -> bool {
        self.decoder_owner.load(Ordering::Acquire) == owner.get()
    }

    pub fn decoder_owner(&self) -> Option<OwnerId> {
        OwnerId::from_raw(self.decoder_owner.load(Ordering::Acquire))
    }

    /// Ask the event pump to run soon. Never blocks.
    pub fn process_events(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn start_pump(&self) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_some() {
            return;
        }
        let target: Weak<dyn PumpTarget> = self.self_ref.clone();
        match EventPump::spawn(target, self.wake_rx.clone(), self.config.pump_error_backoff) {
            Ok(handle) => {
                *pump = Some(handle);
                drop(pump);
                // Run one round right away; the session may have work queued from creation.
                self.process_events();
            }
            Err(err) => tracing::error!(error = %err, "failed to spawn event pump"),
        }
    }

    /// Route a typed SDK callback to its handler.
    pub fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::LoginCompleted(result) => self.on_login_result(result),
            SessionEvent::LoggedOut => self.on_logged_out(),
            SessionEvent::WakeRequested => self.process_events(),
            SessionEvent::TrackEnded => {
                if !self.queue.add_end_of_track() {
                    tracing::warn!("end of track marker dropped");
                }
            }
            SessionEvent::PlayTokenLost => {
                tracing::warn!("play token lost (account in use elsewhere)");
            }
            SessionEvent::StartPlayback => {}
            SessionEvent::Log(line) => tracing::debug!(remote = %line, "remote session log"),
            SessionEvent::MessageToUser(message) => {
                tracing::warn!(message = %message, "message from remote service");
            }
        }
    }

    /// Audio delivery from the remote session. Returns the frames accepted.
    ///
    /// Zero frames marks a discontinuity and flushes the queue. A soft-full queue
    /// accepts nothing, which the remote treats as "slow down" and re-delivers.
    pub fn on_audio_delivery(&self, samples: &[i16], sample_rate: u32, channels: u16) -> usize {
        if channels == 0 {
            return 0;
        }
        let frames = samples.len() / channels as usize;
        if frames == 0 {
            self.queue.flush();
            return 0;
        }
        if self.queue.is_full() {
            return 0;
        }
        let whole = frames * channels as usize;
        if self.queue.add(samples[..whole].to_vec(), sample_rate, channels) {
            frames
        } else {
            0
        }
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> SessionStatus {
        let login = self.login_lock();
        let (login_state, last_login_error) = (login.state, login.last_error.clone());
        drop(login);
        let session_created = matches!(*self.session.lock(), SessionSlot::Live(_));
        SessionStatus {
            session_created,
            login_state,
            last_login_error,
            decoder_owner: self.decoder_owner().map(OwnerId::get),
            queued_segments: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            dropped_segments: self.queue.dropped_segments(),
        }
    }

    /// Stop the event pump and destroy the remote session.
    ///
    /// Waiters fail with [`Error::ShutDown`]; later calls do not recreate the session.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.stop();
        }
        let old = std::mem::replace(&mut *self.session.lock(), SessionSlot::ShutDown);
        drop(old);
        self.queue.flush();
        self.login_changed.notify_all();
        tracing::info!("session coordinator shut down");
    }
}

impl PumpTarget for SessionCoordinator {
    fn pump_events(&self) -> Option<std::result::Result<Duration, RemoteError>> {
        let mut slot = self.session.lock();
        match &mut *slot {
            SessionSlot::Live(session) => Some(session.process_events()),
            _ => None,
        }
    }
}

/// Callback endpoint handed to the remote session.
///
/// Holds only a weak reference: callbacks arriving after the coordinator is
/// gone are ignored.
#[derive(Clone)]
pub struct EventSink {
    coordinator: Weak<SessionCoordinator>,
}

impl EventSink {
    /// A sink connected to nothing. Every callback is a no-op.
    pub fn detached() -> Self {
        Self {
            coordinator: Weak::new(),
        }
    }

    pub fn dispatch(&self, event: SessionEvent) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.handle_event(event);
        }
    }

    /// Deliver interleaved PCM. Returns the number of frames accepted.
    pub fn deliver(&self, samples: &[i16], sample_rate: u32, channels: u16) -> usize {
        match self.coordinator.upgrade() {
            Some(coordinator) => coordinator.on_audio_delivery(samples, sample_rate, channels),
            None => 0,
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("attached", &(self.coordinator.strong_count() > 0))
            .finish()
    }
}
