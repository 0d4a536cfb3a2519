use std::{
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use capture::{
    CaptureSession, InlineExecutor, SessionConfig, SessionPhase, StatusEvent, StatusKind,
    StatusTracker, ThreadExecutor,
};
use crossbeam_channel::Receiver;
use video_ingest::{CaptureSourceDescriptor, DeviceCounters, SyntheticBackend, SyntheticProfile};

const STREAM_URI: &str = "rtsp://camera.test/stream1";

fn fast_config(output_dir: &Path) -> SessionConfig {
    SessionConfig {
        restart_grace: Duration::from_millis(10),
        resolution_settle: Duration::ZERO,
        stabilize_delay: Duration::ZERO,
        stream_probe_delay: Duration::from_millis(5),
        frame_period: Duration::from_millis(5),
        read_retry_delay: Duration::from_millis(5),
        throughput_interval: Duration::from_millis(100),
        stop_timeout: Duration::from_secs(2),
        output_dir: output_dir.to_path_buf(),
        ..SessionConfig::default()
    }
}

struct Harness {
    session: CaptureSession,
    counters: Arc<DeviceCounters>,
    events: Receiver<StatusEvent>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(backend: SyntheticBackend) -> Self {
        Self::with_config(backend, |_| {})
    }

    fn with_config(backend: SyntheticBackend, tweak: impl FnOnce(&mut SessionConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path());
        tweak(&mut config);
        let counters = backend.counters();
        let session = CaptureSession::new(Arc::new(backend), config, Arc::new(InlineExecutor));
        let (_, events) = session.status().subscribe_channel(4096);
        Self {
            session,
            counters,
            events,
            dir,
        }
    }

    /// Block until an event matching `pred` arrives.
    fn wait_for(&self, pred: impl Fn(&StatusKind) -> bool) -> StatusEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if pred(&event.kind) => return event,
                Ok(_) => continue,
                Err(err) => panic!("expected status event never arrived: {err}"),
            }
        }
    }

    fn drain(&self) -> Vec<StatusKind> {
        self.events.try_iter().map(|event| event.kind).collect()
    }
}

fn webcam(index: u32) -> CaptureSourceDescriptor {
    CaptureSourceDescriptor::local(format!("Webcam {index}"), index)
}

fn two_webcams() -> SyntheticBackend {
    SyntheticBackend::new()
        .with_device(0, SyntheticProfile::default())
        .with_device(
            1,
            SyntheticProfile {
                width: 320,
                height: 240,
                ..SyntheticProfile::default()
            },
        )
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn start_streams_frames_until_stopped() {
    let harness = Harness::new(two_webcams());
    let (_, frames) = harness.session.frames().subscribe_channel(8);

    assert!(harness.session.start(webcam(0)));
    assert!(harness.session.is_running());
    assert_eq!(harness.session.phase(), SessionPhase::Running);
    assert_eq!(harness.session.active_source(), Some(webcam(0)));
    assert!(harness.session.snapshot().is_consistent());

    let first = frames.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = frames.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(first.is_rgb());
    assert_eq!(first.pixels.len(), 640 * 480 * 3);
    assert!(second.sequence > first.sequence);

    harness.session.stop();
    assert!(!harness.session.is_running());
    assert_eq!(harness.session.phase(), SessionPhase::Idle);
    assert_eq!(harness.session.active_source(), None);
    assert_eq!(harness.counters.live(), 0);

    let kinds = harness.drain();
    let position = |wanted: &StatusKind| kinds.iter().position(|k| k == wanted).unwrap();
    assert!(position(&StatusKind::Configured) < position(&StatusKind::Connected));
    assert!(position(&StatusKind::Stopping) < position(&StatusKind::Stopped));
}

#[test]
fn stop_on_idle_session_only_reports() {
    let harness = Harness::new(two_webcams());
    harness.session.stop();

    assert_eq!(harness.drain(), vec![StatusKind::AlreadyStopped]);
    assert_eq!(harness.counters.released(), 0);
}

#[test]
fn stopping_twice_tears_down_once() {
    let harness = Harness::new(two_webcams());
    assert!(harness.session.start(webcam(0)));
    harness.session.stop();
    harness.session.stop();

    assert_eq!(harness.counters.opened(), 1);
    assert_eq!(harness.counters.released(), 1);
    let kinds = harness.drain();
    assert_eq!(kinds.iter().filter(|k| **k == StatusKind::Stopped).count(), 1);
    assert_eq!(kinds.last(), Some(&StatusKind::AlreadyStopped));
}

#[test]
fn unopenable_source_fails_cleanly() {
    let harness = Harness::new(two_webcams());

    assert!(!harness.session.start(webcam(7)));
    assert!(!harness.session.is_running());
    assert_eq!(harness.session.phase(), SessionPhase::Idle);
    assert!(harness.drain().contains(&StatusKind::StartFailed));
    assert_eq!(harness.counters.live(), 0);
}

#[test]
fn invalid_descriptor_is_rejected_before_opening() {
    let harness = Harness::new(SyntheticBackend::demo(STREAM_URI));
    let source: CaptureSourceDescriptor = serde_json::from_str(
        r#"{"name":"Broken","kind":"NetworkStream","endpoint":"  "}"#,
    )
    .unwrap();

    assert!(!harness.session.start(source));
    assert_eq!(harness.drain(), vec![StatusKind::StartFailed]);
    assert_eq!(harness.counters.opened(), 0);
}

#[test]
fn silent_source_is_released_and_next_start_succeeds() {
    let backend = two_webcams().with_device(
        2,
        SyntheticProfile {
            empty_reads: u64::MAX,
            ..SyntheticProfile::default()
        },
    );
    let harness = Harness::new(backend);

    assert!(!harness.session.start(webcam(2)));
    assert_eq!(harness.counters.opened(), 1);
    assert_eq!(harness.counters.live(), 0);
    assert_eq!(harness.session.phase(), SessionPhase::Idle);

    assert!(harness.session.start(webcam(0)));
    assert!(harness.session.is_running());
    harness.session.stop();
}

#[test]
fn restarting_replaces_the_device() {
    let harness = Harness::new(two_webcams());

    assert!(harness.session.start(webcam(0)));
    assert!(harness.session.start(webcam(1)));
    assert_eq!(harness.session.active_source(), Some(webcam(1)));
    assert_eq!(harness.counters.peak_live(), 1);
    assert_eq!(harness.counters.released(), 1);

    harness.session.stop();
    assert_eq!(harness.counters.live(), 0);
}

#[test]
fn throughput_is_reported_while_streaming() {
    let harness = Harness::new(two_webcams());
    assert!(harness.session.start(webcam(0)));

    let event = harness.wait_for(|kind| matches!(kind, StatusKind::Throughput { .. }));
    let StatusKind::Throughput { fps } = event.kind else {
        unreachable!()
    };
    // 5 ms frame period caps the rate near 200 fps.
    assert!(fps > 0.0 && fps <= 220.0, "fps = {fps}");
    assert!(event.message.contains("FPS"));
    harness.session.stop();
}

#[test]
fn capture_frame_while_idle_writes_nothing() {
    let harness = Harness::new(two_webcams());
    harness.session.capture_frame();

    assert_eq!(harness.drain(), vec![StatusKind::NotRunning]);
    assert_eq!(std::fs::read_dir(harness.dir.path()).unwrap().count(), 0);
}

#[test]
fn capture_frame_saves_a_jpeg() {
    let harness = Harness::new(two_webcams());
    assert!(harness.session.start(webcam(1)));
    harness.session.capture_frame();

    let event = harness.wait_for(|kind| {
        matches!(kind, StatusKind::StillSaved { .. } | StatusKind::StillFailed)
    });
    let StatusKind::StillSaved { path } = event.kind else {
        panic!("still failed: {}", event.message);
    };
    assert!(path.starts_with(harness.dir.path()));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("Capture_") && name.ends_with(".jpg"), "{name}");

    let decoded = image::open(&path).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (320, 240));
    harness.session.stop();
}

#[test]
fn concurrent_start_and_stop_keep_state_consistent() {
    let harness = Harness::new(two_webcams());
    let session = &harness.session;

    thread::scope(|scope| {
        scope.spawn(|| {
            for round in 0..6 {
                session.start(webcam(round % 2));
            }
        });
        scope.spawn(|| {
            for _ in 0..20 {
                session.stop();
                thread::sleep(Duration::from_millis(3));
            }
        });
        scope.spawn(|| {
            for _ in 0..2_000 {
                let snapshot = session.snapshot();
                assert!(snapshot.is_consistent(), "{snapshot:?}");
            }
        });
    });

    session.stop();
    wait_until(|| session.phase() == SessionPhase::Idle);
    assert!(!session.is_running());
    assert!(harness.counters.peak_live() <= 1);
    assert_eq!(harness.counters.live(), 0);
}

#[test]
fn lost_device_settles_to_idle() {
    let backend = SyntheticBackend::new().with_device(
        0,
        SyntheticProfile {
            lose_after_reads: Some(10),
            ..SyntheticProfile::default()
        },
    );
    let harness = Harness::new(backend);
    assert!(harness.session.start(webcam(0)));

    harness.wait_for(|kind| *kind == StatusKind::DeviceLost);
    assert_eq!(harness.session.phase(), SessionPhase::Idle);
    assert!(!harness.session.is_running());
    assert_eq!(harness.counters.live(), 0);

    harness.session.stop();
    assert_eq!(harness.drain().last(), Some(&StatusKind::AlreadyStopped));
    assert_eq!(harness.counters.released(), 1);
}

fn stalling_webcam() -> SyntheticBackend {
    SyntheticBackend::new().with_device(
        0,
        SyntheticProfile {
            // The probe read succeeds, everything after it is empty.
            stall_after_reads: Some(1),
            ..SyntheticProfile::default()
        },
    )
}

#[test]
fn transient_read_failures_keep_the_loop_alive() {
    let harness = Harness::new(stalling_webcam());
    assert!(harness.session.start(webcam(0)));

    for _ in 0..3 {
        harness.wait_for(|kind| *kind == StatusKind::ReadFailed);
    }
    assert!(harness.session.is_running());
    harness.session.stop();
    assert_eq!(harness.counters.live(), 0);
}

#[test]
fn read_failure_limit_counts_as_device_lost() {
    let harness = Harness::with_config(stalling_webcam(), |config| {
        config.max_consecutive_read_failures = Some(3);
    });
    assert!(harness.session.start(webcam(0)));

    let lost = harness.wait_for(|kind| *kind == StatusKind::DeviceLost);
    assert!(lost.message.contains("3 consecutive read failures"), "{}", lost.message);
    assert_eq!(harness.session.phase(), SessionPhase::Idle);
    assert_eq!(harness.counters.live(), 0);
}

#[test]
fn slow_read_triggers_forced_teardown() {
    let backend = SyntheticBackend::new().with_device(
        0,
        SyntheticProfile {
            read_latency: Duration::from_millis(400),
            ..SyntheticProfile::default()
        },
    );
    let harness = Harness::with_config(backend, |config| {
        config.stop_timeout = Duration::from_millis(50);
    });
    assert!(harness.session.start(webcam(0)));
    // Let the worker enter its first slow read.
    thread::sleep(Duration::from_millis(50));

    harness.session.stop();
    assert!(!harness.session.is_running());
    assert_eq!(harness.session.phase(), SessionPhase::Idle);
    assert_eq!(harness.counters.live(), 0);

    let kinds = harness.drain();
    let timeout = kinds
        .iter()
        .position(|k| *k == StatusKind::StopTimeout)
        .unwrap();
    let stopped = kinds.iter().position(|k| *k == StatusKind::Stopped).unwrap();
    assert!(timeout < stopped);

    // The detached worker still reports its own exit once the read returns.
    harness.wait_for(|kind| *kind == StatusKind::Cancelled);
}

#[test]
fn detached_worker_exit_does_not_end_the_next_run() {
    let backend = SyntheticBackend::new()
        .with_device(
            0,
            SyntheticProfile {
                read_latency: Duration::from_millis(300),
                ..SyntheticProfile::default()
            },
        )
        .with_device(1, SyntheticProfile::default());
    let harness = Harness::with_config(backend, |config| {
        config.stop_timeout = Duration::from_millis(50);
        // Keep throughput events from re-asserting the running hint.
        config.throughput_interval = Duration::from_secs(30);
    });
    assert!(harness.session.start(webcam(0)));
    thread::sleep(Duration::from_millis(50));
    harness.session.stop();
    assert!(harness.session.start(webcam(1)));

    // Outlast the slow read the first worker is still blocked in.
    thread::sleep(Duration::from_millis(700));
    assert!(harness.session.is_running());

    let mut tracker = StatusTracker::new();
    let kinds: Vec<StatusKind> = harness
        .events
        .try_iter()
        .map(|event| {
            tracker.apply(&event);
            event.kind
        })
        .collect();
    assert!(tracker.is_running(), "events: {kinds:?}");
    let streaming = kinds
        .iter()
        .rposition(|k| *k == StatusKind::StreamingStarted)
        .unwrap();
    assert!(!kinds[streaming..].contains(&StatusKind::Cancelled));

    harness.session.stop();
    assert_eq!(harness.counters.live(), 0);
}

#[test]
fn preferred_api_failure_falls_back() {
    let backend = SyntheticBackend::new().with_device(
        0,
        SyntheticProfile {
            preferred_api_fails: true,
            ..SyntheticProfile::default()
        },
    );
    let harness = Harness::new(backend);

    assert!(harness.session.start(webcam(0)));
    harness.session.stop();
    let kinds = harness.drain();
    assert!(kinds.contains(&StatusKind::ApiFallback));
    assert!(kinds.contains(&StatusKind::Connected));
}

#[test]
fn stop_cancels_a_start_in_progress() {
    let backend = SyntheticBackend::new().with_stream(
        STREAM_URI,
        SyntheticProfile {
            empty_reads: 3,
            ..SyntheticProfile::default()
        },
    );
    let harness = Harness::with_config(backend, |config| {
        config.stream_probe_delay = Duration::from_secs(2);
    });
    let session = &harness.session;
    let stream = CaptureSourceDescriptor::network("Stream", STREAM_URI).unwrap();

    thread::scope(|scope| {
        let starter = scope.spawn(|| session.start(stream));
        wait_until(|| session.phase() == SessionPhase::Configuring);
        let begun = Instant::now();
        session.stop();
        assert!(!starter.join().unwrap());
        assert!(begun.elapsed() < Duration::from_secs(1));
    });

    assert_eq!(session.phase(), SessionPhase::Idle);
    assert_eq!(harness.counters.live(), 0);
    let kinds = harness.drain();
    assert!(kinds.contains(&StatusKind::Cancelled));
    assert!(!kinds.contains(&StatusKind::Connected));
}

#[test]
fn panicking_backend_does_not_escape_start() {
    let backend = two_webcams().with_device(
        3,
        SyntheticProfile {
            panic_on_open: true,
            ..SyntheticProfile::default()
        },
    );
    let harness = Harness::new(backend);

    assert!(!harness.session.start(webcam(3)));
    assert_eq!(harness.session.phase(), SessionPhase::Idle);
    assert!(harness.drain().contains(&StatusKind::StartFailed));
    assert!(harness.session.start(webcam(0)));
    harness.session.stop();
}

#[test]
fn tracker_follows_session_lifecycle() {
    let harness = Harness::new(two_webcams());
    let mut tracker = StatusTracker::new();

    assert!(harness.session.start(webcam(0)));
    for event in harness.events.try_iter() {
        tracker.apply(&event);
    }
    assert!(tracker.is_running());

    harness.session.stop();
    for event in harness.events.try_iter() {
        tracker.apply(&event);
    }
    assert!(!tracker.is_running());
    assert_eq!(tracker.snapshot().message, "Camera stopped");
}

#[test]
fn frames_are_delivered_on_the_executor_thread() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(ThreadExecutor::new("frame-delivery").unwrap());
    let session = CaptureSession::new(
        Arc::new(two_webcams()),
        fast_config(dir.path()),
        executor,
    );
    let (tx, rx) = crossbeam_channel::bounded(4);
    session.frames().subscribe(move |frame| {
        let name = thread::current().name().map(str::to_string);
        let _ = tx.try_send((frame.sequence, name));
    });

    assert!(session.start(webcam(0)));
    let (sequence, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(sequence >= 1);
    assert_eq!(name.as_deref(), Some("frame-delivery"));
    session.stop();
}
