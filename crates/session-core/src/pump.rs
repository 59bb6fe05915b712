//! Dedicated thread driving the remote session's internal event loop.
//!
//! The SDK tells us how long until it next needs attention, and can ask for an
//! early wake from any thread. The pump sleeps until whichever comes first, runs
//! one round under the session lock, and re-arms. Errors are logged and absorbed;
//! the pump only exits on [`EventPump::stop`] or once its target is gone.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, after, never, select};

use crate::error::RemoteError;

/// Something the pump can drive. Returns `None` once there is nothing to pump.
pub(crate) trait PumpTarget: Send + Sync {
    fn pump_events(&self) -> Option<Result<Duration, RemoteError>>;
}

/// Handle to the running pump thread. Dropping it stops the thread.
pub struct EventPump {
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl EventPump {
    /// Spawn the pump. `wake_rx` carries early-wake requests.
    pub(crate) fn spawn(
        target: Weak<dyn PumpTarget>,
        wake_rx: Receiver<()>,
        error_backoff: Duration,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let join = thread::Builder::new()
            .name("remote-event-pump".to_string())
            .spawn(move || pump_thread_main(target, wake_rx, stop_rx, error_backoff))?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }

    /// Stop the pump and wait for it to exit.
    ///
    /// Called from the pump thread itself (last owner dropped mid-round), the
    /// thread is detached instead of joined.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(join) = self.join.take() {
            if join.thread().id() == thread::current().id() {
                return;
            }
            let _ = join.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pump_thread_main(
    target: Weak<dyn PumpTarget>,
    wake_rx: Receiver<()>,
    stop_rx: Receiver<()>,
    error_backoff: Duration,
) {
    tracing::debug!("event pump started");
    let mut next_due: Option<Duration> = None;
    loop {
        let timeout = match next_due {
            Some(d) => after(d),
            None => never::<Instant>(),
        };
        select! {
            recv(stop_rx) -> _ => break,
            recv(wake_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            recv(timeout) -> _ => {}
        }

        let Some(target) = target.upgrade() else {
            break;
        };
        match target.pump_events() {
            Some(Ok(due)) => next_due = Some(due),
            Some(Err(err)) => {
                tracing::warn!(
                    error = %err,
                    retry_in_ms = error_backoff.as_millis() as u64,
                    "remote event processing failed"
                );
                next_due = Some(error_backoff);
            }
            None => break,
        }
    }
    tracing::debug!("event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct ScriptedTarget {
        rounds: AtomicUsize,
        script: Mutex<Vec<Option<Result<Duration, RemoteError>>>>,
        fallback: Option<Result<Duration, RemoteError>>,
    }

    impl ScriptedTarget {
        fn new(
            mut script: Vec<Option<Result<Duration, RemoteError>>>,
            fallback: Option<Result<Duration, RemoteError>>,
        ) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                rounds: AtomicUsize::new(0),
                script: Mutex::new(script),
                fallback,
            })
        }

        fn rounds(&self) -> usize {
            self.rounds.load(Ordering::SeqCst)
        }
    }

    impl PumpTarget for ScriptedTarget {
        fn pump_events(&self) -> Option<Result<Duration, RemoteError>> {
            self.rounds.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn spawn_with(target: &Arc<ScriptedTarget>, wake_rx: Receiver<()>, backoff: Duration) -> EventPump {
        let as_dyn: Arc<dyn PumpTarget> = target.clone();
        let weak = Arc::downgrade(&as_dyn);
        EventPump::spawn(weak, wake_rx, backoff).unwrap()
    }

    #[test]
    fn idle_pump_waits_for_wake() {
        let target = ScriptedTarget::new(vec![], Some(Ok(Duration::from_secs(60))));
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let pump = spawn_with(&target, wake_rx, Duration::from_secs(60));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(target.rounds(), 0);

        wake_tx.try_send(()).unwrap();
        assert!(wait_for(|| target.rounds() == 1));
        pump.stop();
    }

    #[test]
    fn pump_rearms_on_reported_interval() {
        let target = ScriptedTarget::new(vec![], Some(Ok(Duration::from_millis(5))));
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let pump = spawn_with(&target, wake_rx, Duration::from_secs(60));

        wake_tx.try_send(()).unwrap();
        assert!(wait_for(|| target.rounds() >= 5));
        pump.stop();
    }

    #[test]
    fn pump_survives_remote_errors() {
        let failure = RemoteError::new(RemoteErrorKind::Network, "connection reset");
        let target = ScriptedTarget::new(
            vec![Some(Err(failure.clone())), Some(Err(failure))],
            Some(Ok(Duration::from_secs(60))),
        );
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let pump = spawn_with(&target, wake_rx, Duration::from_millis(5));

        wake_tx.try_send(()).unwrap();
        assert!(wait_for(|| target.rounds() == 3));
        pump.stop();
    }

    #[test]
    fn pump_exits_when_target_is_gone() {
        let target = ScriptedTarget::new(vec![], Some(Ok(Duration::from_secs(60))));
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let mut pump = spawn_with(&target, wake_rx, Duration::from_secs(60));
        drop(target);

        wake_tx.try_send(()).unwrap();
        let join = pump.join.take().unwrap();
        assert!(wait_for(|| join.is_finished()));
        join.join().unwrap();
    }

    #[test]
    fn pump_exits_when_target_reports_nothing_to_do() {
        let target = ScriptedTarget::new(vec![None], Some(Ok(Duration::from_secs(60))));
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let mut pump = spawn_with(&target, wake_rx, Duration::from_secs(60));

        wake_tx.try_send(()).unwrap();
        let join = pump.join.take().unwrap();
        assert!(wait_for(|| join.is_finished()));
        assert_eq!(target.rounds(), 1);
    }
}
