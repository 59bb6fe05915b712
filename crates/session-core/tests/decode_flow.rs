use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use session_core::prompt::{CredentialPrompt, Credentials, DetachedThread, MainThreadQueue, PromptOutcome};
use session_core::sim::{SimCatalog, SimRemote, SimStats, SimTrack, sample_at};
use session_core::{
    AudioFrames, CancelToken, Error, RemoteInput, SessionConfig, SessionCoordinator,
};
use stream_input_types::{LoginState, StreamFormat};

const RATE: u32 = 8_000;

struct ScriptedPrompt {
    answers: Mutex<Vec<PromptOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedPrompt {
    fn new(mut answers: Vec<PromptOutcome>) -> Arc<Self> {
        answers.reverse();
        Arc::new(Self {
            answers: Mutex::new(answers),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialPrompt for ScriptedPrompt {
    fn prompt(&self, _message: Option<&str>) -> PromptOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(PromptOutcome::Cancelled)
    }
}

fn catalog() -> SimCatalog {
    SimCatalog::new()
        .with_track(SimTrack::new("one-second", "One Second", 1_000).loading_for(3))
        .with_track(SimTrack::new("four-seconds", "Four Seconds", 4_000))
        .with_track(SimTrack::new("short", "Short", 100))
        .with_track(SimTrack::new("locked", "Locked", 1_000).region_locked())
        .with_track(SimTrack::new("broken", "Broken", 1_000).broken())
        .with_listing("album", ["one-second", "four-seconds", "short"])
        .with_listing("empty", Vec::<String>::new())
}

fn remote() -> SimRemote {
    SimRemote::new(catalog())
        .with_account("demo", "demo")
        .with_format(StreamFormat {
            sample_rate: RATE,
            channels: 1,
        })
        .with_chunk_frames(400)
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        take_poll: Duration::from_millis(10),
        login_poll: Duration::from_millis(10),
        preload_poll: Duration::from_millis(5),
        ..SessionConfig::default()
    }
}

fn logged_in_with_stats() -> (Arc<SessionCoordinator>, Arc<SimStats>) {
    let remote = remote().with_stored_credentials(Credentials::new("demo", "demo"));
    let stats = remote.stats();
    let coordinator = SessionCoordinator::new(
        fast_config(),
        Arc::new(remote),
        ScriptedPrompt::new(vec![]),
        Arc::new(DetachedThread),
    );
    (coordinator, stats)
}

fn logged_in_coordinator() -> Arc<SessionCoordinator> {
    logged_in_with_stats().0
}

fn decode_to_end(input: &mut RemoteInput, cancel: &CancelToken) -> Vec<i16> {
    let mut out = Vec::new();
    let mut chunk = AudioFrames::default();
    while input.decode_run(&mut chunk, cancel).unwrap() {
        out.extend_from_slice(&chunk.samples);
    }
    out
}

#[test]
fn open_preloads_and_decodes_a_whole_track() {
    let (coordinator, stats) = logged_in_with_stats();
    let cancel = CancelToken::new();

    let mut input = RemoteInput::open(coordinator.clone(), "album", &cancel).unwrap();
    assert_eq!(input.track_count(), 3);
    assert_eq!(input.get_info(0).unwrap().title, "One Second");
    assert_eq!(input.get_info(1).unwrap().duration_secs(), 4.0);
    assert!(input.can_seek());
    assert_eq!(input.dynamic_info(), None);

    input.decode_initialize(0, &cancel).unwrap();
    assert_eq!(coordinator.decoder_owner(), Some(input.owner()));

    let samples = decode_to_end(&mut input, &cancel);
    assert_eq!(samples.len(), RATE as usize);
    assert!(samples.iter().enumerate().all(|(i, s)| *s == sample_at(i)));
    assert_eq!(
        input.dynamic_info(),
        Some(StreamFormat {
            sample_rate: RATE,
            channels: 1,
        })
    );
    // End of track hands the slot back.
    assert_eq!(coordinator.decoder_owner(), None);
    assert_eq!(coordinator.login_state(), LoginState::LoggedIn);
    assert_eq!(stats.connects.load(Ordering::Relaxed), 1);
    assert_eq!(stats.loads.load(Ordering::Relaxed), 1);
    coordinator.shutdown();
}

#[test]
fn consecutive_tracks_reuse_the_slot() {
    let (coordinator, stats) = logged_in_with_stats();
    let cancel = CancelToken::new();
    let mut input = RemoteInput::open(coordinator.clone(), "album", &cancel).unwrap();

    input.decode_initialize(2, &cancel).unwrap();
    assert_eq!(decode_to_end(&mut input, &cancel).len(), 800);
    input.decode_initialize(0, &cancel).unwrap();
    assert_eq!(decode_to_end(&mut input, &cancel).len(), 8_000);
    drop(input);

    // One session for every open; finished tracks need no unload.
    assert_eq!(stats.connects.load(Ordering::Relaxed), 1);
    assert_eq!(stats.loads.load(Ordering::Relaxed), 2);
    assert_eq!(stats.unloads.load(Ordering::Relaxed), 0);
    coordinator.shutdown();
}

#[test]
fn seek_discards_stale_audio() {
    let coordinator = logged_in_coordinator();
    let cancel = CancelToken::new();
    let mut input = RemoteInput::open(coordinator.clone(), "four-seconds", &cancel).unwrap();
    input.decode_initialize(0, &cancel).unwrap();

    let mut chunk = AudioFrames::default();
    assert!(input.decode_run(&mut chunk, &cancel).unwrap());
    assert_eq!(chunk.samples[0], sample_at(0));

    input.decode_seek(2.0, &cancel).unwrap();
    assert!(input.decode_run(&mut chunk, &cancel).unwrap());
    assert_eq!(chunk.samples[0], sample_at(2 * RATE as usize));

    let rest = decode_to_end(&mut input, &cancel);
    assert_eq!(chunk.samples.len() + rest.len(), 2 * RATE as usize);
    coordinator.shutdown();
}

#[test]
fn seek_past_the_end_finishes_the_track() {
    let coordinator = logged_in_coordinator();
    let cancel = CancelToken::new();
    let mut input = RemoteInput::open(coordinator.clone(), "four-seconds", &cancel).unwrap();
    input.decode_initialize(0, &cancel).unwrap();

    input.decode_seek(1.0e12, &cancel).unwrap();
    assert!(decode_to_end(&mut input, &cancel).is_empty());
    assert_eq!(coordinator.decoder_owner(), None);

    // The session survives and plays the next request normally.
    input.decode_initialize(0, &cancel).unwrap();
    assert_eq!(decode_to_end(&mut input, &cancel).len(), 4 * RATE as usize);
    coordinator.shutdown();
}

#[test]
fn abandoned_decoder_stops_the_remote_player() {
    let (coordinator, stats) = logged_in_with_stats();
    let cancel = CancelToken::new();
    let mut input = RemoteInput::open(coordinator.clone(), "four-seconds", &cancel).unwrap();
    input.decode_initialize(0, &cancel).unwrap();
    let mut chunk = AudioFrames::default();
    assert!(input.decode_run(&mut chunk, &cancel).unwrap());

    drop(input);
    assert_eq!(stats.unloads.load(Ordering::Relaxed), 1);
    assert_eq!(coordinator.decoder_owner(), None);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(coordinator.status().queued_segments, 0);
    coordinator.shutdown();
}

#[test]
fn second_decoder_is_refused_until_first_is_dropped() {
    let coordinator = logged_in_coordinator();
    let cancel = CancelToken::new();
    let mut first = RemoteInput::open(coordinator.clone(), "four-seconds", &cancel).unwrap();
    let mut second = RemoteInput::open(coordinator.clone(), "short", &cancel).unwrap();

    first.decode_initialize(0, &cancel).unwrap();
    assert_eq!(
        second.decode_initialize(0, &cancel),
        Err(Error::DecoderBusy {
            holder: first.owner()
        })
    );

    drop(first);
    assert_eq!(coordinator.decoder_owner(), None);
    second.decode_initialize(0, &cancel).unwrap();
    assert_eq!(decode_to_end(&mut second, &cancel).len(), 800);
    coordinator.shutdown();
}

#[test]
fn decode_without_slot_is_a_coordination_bug() {
    let coordinator = logged_in_coordinator();
    let cancel = CancelToken::new();
    let mut input = RemoteInput::open(coordinator.clone(), "short", &cancel).unwrap();

    let mut chunk = AudioFrames::default();
    assert_eq!(
        input.decode_run(&mut chunk, &cancel),
        Err(Error::CoordinationBugFatal {
            owner: input.owner()
        })
    );
    assert_eq!(
        input.decode_seek(1.0, &cancel),
        Err(Error::CoordinationBugFatal {
            owner: input.owner()
        })
    );
    coordinator.shutdown();
}

#[test]
fn region_locked_track_releases_the_slot() {
    let coordinator = logged_in_coordinator();
    let cancel = CancelToken::new();
    let mut input = RemoteInput::open(coordinator.clone(), "locked", &cancel).unwrap();

    let err = input.decode_initialize(0, &cancel).unwrap_err();
    assert!(
        matches!(
            err,
            Error::RemoteOperationFailed {
                context: "load track (including region check)",
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(coordinator.decoder_owner(), None);
    coordinator.shutdown();
}

#[test]
fn open_reports_listing_and_preload_failures() {
    let coordinator = logged_in_coordinator();
    let cancel = CancelToken::new();

    assert_eq!(
        RemoteInput::open(coordinator.clone(), "empty", &cancel).unwrap_err(),
        Error::NoTracks {
            locator: "empty".to_string()
        }
    );
    assert!(matches!(
        RemoteInput::open(coordinator.clone(), "nowhere", &cancel),
        Err(Error::RemoteOperationFailed {
            context: "browsing",
            ..
        })
    ));
    assert!(matches!(
        RemoteInput::open(coordinator.clone(), "broken", &cancel),
        Err(Error::RemoteOperationFailed {
            context: "preloading track",
            ..
        })
    ));
    coordinator.shutdown();
}

#[test]
fn read_only_and_index_checks() {
    let coordinator = logged_in_coordinator();
    let cancel = CancelToken::new();
    assert_eq!(
        RemoteInput::open_for_write(coordinator.clone(), "short", &cancel).unwrap_err(),
        Error::ReadOnly
    );

    let mut input = RemoteInput::open(coordinator.clone(), "short", &cancel).unwrap();
    let info = input.get_info(0).unwrap();
    assert_eq!(input.retag(0, &info), Err(Error::ReadOnly));
    assert_eq!(
        input.get_info(5).unwrap_err(),
        Error::TrackIndex { index: 5, count: 1 }
    );
    assert_eq!(
        input.decode_initialize(1, &cancel),
        Err(Error::TrackIndex { index: 1, count: 1 })
    );
    assert_eq!(coordinator.decoder_owner(), None);
    coordinator.shutdown();
}

#[test]
fn prompt_supplies_credentials_after_one_rejection() {
    let prompt = ScriptedPrompt::new(vec![
        PromptOutcome::Entered(Credentials::new("demo", "wrong")),
        PromptOutcome::Entered(Credentials::new("demo", "demo")),
    ]);
    let coordinator = SessionCoordinator::new(
        fast_config(),
        Arc::new(remote()),
        prompt.clone(),
        Arc::new(DetachedThread),
    );

    let input = RemoteInput::open(coordinator.clone(), "short", &CancelToken::new()).unwrap();
    assert_eq!(input.track_count(), 1);
    assert_eq!(prompt.calls(), 2);
    assert_eq!(coordinator.login_state(), LoginState::LoggedIn);
    assert_eq!(
        coordinator.status().last_login_error,
        None,
        "a later success clears the failure"
    );
    coordinator.shutdown();
}

#[test]
fn declined_prompt_fails_open() {
    let prompt = ScriptedPrompt::new(vec![PromptOutcome::Cancelled]);
    let coordinator = SessionCoordinator::new(
        fast_config(),
        Arc::new(remote()),
        prompt.clone(),
        Arc::new(DetachedThread),
    );

    let err = RemoteInput::open(coordinator.clone(), "short", &CancelToken::new()).unwrap_err();
    assert!(matches!(err, Error::LoginDenied { .. }), "{err:?}");
    assert_eq!(prompt.calls(), 1);
    coordinator.shutdown();
}

#[test]
fn open_is_cancellable_while_waiting_for_login() {
    // Nobody drains the UI queue, so the prompt never appears.
    let ui = MainThreadQueue::new();
    let coordinator = SessionCoordinator::new(
        fast_config(),
        Arc::new(remote()),
        ScriptedPrompt::new(vec![]),
        Arc::new(ui.handle()),
    );

    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        })
    };
    let start = Instant::now();
    let err = RemoteInput::open(coordinator.clone(), "short", &cancel).unwrap_err();
    assert_eq!(err, Error::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(ui.pending(), 1);
    canceller.join().unwrap();
    coordinator.shutdown();
}

#[test]
fn concurrent_decoders_never_share_the_slot() {
    let coordinator = logged_in_coordinator();
    let plays = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            let plays = plays.clone();
            thread::spawn(move || {
                let cancel = CancelToken::new();
                let mut input = RemoteInput::open(coordinator.clone(), "short", &cancel).unwrap();
                let mut done = 0;
                let mut chunk = AudioFrames::default();
                while done < 10 {
                    match input.decode_initialize(0, &cancel) {
                        Ok(()) => {
                            let mut frames = 0;
                            while input.decode_run(&mut chunk, &cancel).unwrap() {
                                assert_eq!(coordinator.decoder_owner(), Some(input.owner()));
                                frames += chunk.frame_count();
                            }
                            assert_eq!(frames, 800);
                            done += 1;
                            plays.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) if err.is_contention() => {
                            thread::sleep(Duration::from_millis(1));
                        }
                        Err(err) => panic!("unexpected error {err:?}"),
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(plays.load(Ordering::SeqCst), 40);
    assert_eq!(coordinator.decoder_owner(), None);
    coordinator.shutdown();
}

#[test]
fn status_reflects_session_and_slot() {
    let coordinator = logged_in_coordinator();
    let before = coordinator.status();
    assert!(!before.session_created);
    assert_eq!(before.login_state, LoginState::LoggedOut);
    assert_eq!(before.queue_capacity, 255);

    let cancel = CancelToken::new();
    let mut input = RemoteInput::open(coordinator.clone(), "four-seconds", &cancel).unwrap();
    input.decode_initialize(0, &cancel).unwrap();
    let during = coordinator.status();
    assert!(during.session_created);
    assert_eq!(during.login_state, LoginState::LoggedIn);
    assert_eq!(during.decoder_owner, Some(input.owner().get()));

    drop(input);
    coordinator.shutdown();
    assert!(!coordinator.status().session_created);
}
