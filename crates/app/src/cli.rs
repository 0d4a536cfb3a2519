use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Once,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use capture::{
    CaptureSession, Severity, StatusEvent, StatusKind, StatusTracker, ThreadExecutor,
};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};
use video_ingest::{
    parse_device_index, CaptureBackend, CaptureSourceDescriptor, DeviceResolver, SyntheticBackend,
};

use crate::config::{AppConfig, BackendKind, Command, ListArgs, SnapshotArgs, StreamArgs};

const STILL_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run(command: Command, config: &AppConfig) -> Result<()> {
    let backend = build_backend(config)?;
    match command {
        Command::List(args) => list(backend, config, &args),
        Command::Stream(args) => stream(backend, config, &args),
        Command::Snapshot(args) => snapshot(backend, config, &args),
    }
}

fn build_backend(config: &AppConfig) -> Result<Arc<dyn CaptureBackend>> {
    match config.backend {
        BackendKind::Synthetic => Ok(Arc::new(SyntheticBackend::demo(&config.stream_uri))),
        #[cfg(feature = "opencv")]
        BackendKind::Opencv => Ok(Arc::new(video_ingest::OpenCvBackend::new())),
        #[cfg(not(feature = "opencv"))]
        BackendKind::Opencv => bail!("camctl was built without the `opencv` feature"),
    }
}

/// No argument selects device 0; otherwise an index, `/dev/videoN` or URI.
pub(crate) fn resolve_source(arg: Option<&str>) -> Result<CaptureSourceDescriptor> {
    let Some(endpoint) = arg else {
        return Ok(CaptureSourceDescriptor::local("Default Webcam", 0));
    };
    let name = match parse_device_index(endpoint) {
        Some(index) => format!("Webcam {index}"),
        None => "RTSP Camera".to_string(),
    };
    CaptureSourceDescriptor::from_endpoint(name, endpoint)
        .with_context(|| format!("invalid source {endpoint:?}"))
}

fn list(backend: Arc<dyn CaptureBackend>, config: &AppConfig, args: &ListArgs) -> Result<()> {
    let resolver = DeviceResolver::new(backend)
        .with_probe_limit(args.max_index)
        .with_stream_example(config.stream_uri.clone());
    let sources = resolver.default_sources();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&sources)?);
        return Ok(());
    }
    for source in &sources {
        println!(
            "{:<20} {:<7} {}",
            source.name(),
            source.kind().label(),
            source.endpoint()
        );
    }
    Ok(())
}

fn open_session(
    backend: Arc<dyn CaptureBackend>,
    config: &AppConfig,
) -> Result<(CaptureSession, Receiver<StatusEvent>)> {
    let executor =
        ThreadExecutor::new("camctl-delivery").context("failed to spawn delivery thread")?;
    let session = CaptureSession::new(backend, config.session.clone(), Arc::new(executor));
    let (_, events) = session.status().subscribe_channel(256);
    Ok((session, events))
}

fn shutdown_flag() -> Arc<AtomicBool> {
    static CTRL_HANDLER: Once = Once::new();
    static SHUTDOWN: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

    let shutdown = SHUTDOWN
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone();
    CTRL_HANDLER.call_once(|| {
        let handler_shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
    shutdown
}

fn stream(backend: Arc<dyn CaptureBackend>, config: &AppConfig, args: &StreamArgs) -> Result<()> {
    let source = resolve_source(args.source.as_deref())?;
    let shutdown = shutdown_flag();
    let (session, events) = open_session(backend, config)?;

    let frames = Arc::new(AtomicU64::new(0));
    let frame_counter = frames.clone();
    session.frames().subscribe(move |_| {
        frame_counter.fetch_add(1, Ordering::Relaxed);
    });

    if !session.start(source.clone()) {
        bail!("failed to start {}", source.display_info());
    }
    if args.snapshot {
        session.capture_frame();
    }

    let deadline = args
        .seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut tracker = StatusTracker::new();
    let mut lost = None;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("interrupted, stopping");
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let status = tracker.apply(&event);
                if !status.is_running && status.severity == Severity::Error {
                    lost = Some(status.message.clone());
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    session.stop();
    for event in events.try_iter() {
        tracker.apply(&event);
    }
    let last = tracker.snapshot();
    info!(
        frames = frames.load(Ordering::Relaxed),
        running = last.is_running,
        "stream of {} finished: {}",
        source.display_info(),
        last.message
    );
    match lost {
        Some(message) => bail!("{message}"),
        None => Ok(()),
    }
}

fn snapshot(
    backend: Arc<dyn CaptureBackend>,
    config: &AppConfig,
    args: &SnapshotArgs,
) -> Result<()> {
    let source = resolve_source(args.source.as_deref())?;
    let (session, events) = open_session(backend, config)?;

    if !session.start(source.clone()) {
        bail!("failed to start {}", source.display_info());
    }
    session.capture_frame();
    let outcome = wait_for_still(&events);
    session.stop();

    let path = outcome?;
    println!("{}", path.display());
    Ok(())
}

fn wait_for_still(events: &Receiver<StatusEvent>) -> Result<std::path::PathBuf> {
    let deadline = Instant::now() + STILL_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events
            .recv_timeout(remaining)
            .context("timed out waiting for the still to be written")?;
        match event.kind {
            StatusKind::StillSaved { path } => return Ok(path),
            StatusKind::StillFailed | StatusKind::DeviceLost | StatusKind::LoopFault => {
                bail!("{}", event.message)
            }
            _ => {}
        }
    }
}
