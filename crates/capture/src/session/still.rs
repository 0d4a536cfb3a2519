//! One-shot JPEG stills taken from a running device.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;
use tracing::debug;
use video_ingest::{normalize, CaptureDevice, CaptureError, DeviceHandle, NormalizedFrame};

use crate::{
    config::SessionConfig,
    status::{StatusKind, StatusReporter},
    telemetry::{self, panic_message},
};

#[derive(Debug, Error)]
pub(crate) enum StillError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("device returned an empty frame")]
    EmptyFrame,
    #[error("{channels}-channel frame cannot be stored as JPEG")]
    UnsupportedLayout { channels: u8 },
    #[error("cannot write {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// `Capture_<yyyyMMdd_HHmmss>.jpg` in local time.
pub fn still_file_name(at: DateTime<Local>) -> String {
    at.format("Capture_%Y%m%d_%H%M%S.jpg").to_string()
}

/// Create the first free file for `file_name` in `dir`. A second still within
/// the same second gets a numeric suffix instead of overwriting the first;
/// `create_new` makes the claim atomic across concurrent writers.
fn create_unique(dir: &Path, file_name: &str) -> Result<(PathBuf, File), StillError> {
    let stem = file_name.trim_end_matches(".jpg");
    for n in 1u32.. {
        let path = match n {
            1 => dir.join(file_name),
            n => dir.join(format!("{stem}_{n}.jpg")),
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(StillError::Io { path, source }),
        }
    }
    Err(StillError::Io {
        path: dir.join(file_name),
        source: io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"),
    })
}

pub(crate) fn write_jpeg(
    frame: &NormalizedFrame,
    dir: &Path,
    quality: u8,
    at: DateTime<Local>,
) -> Result<PathBuf, StillError> {
    let rgb = frame
        .to_rgb_image()
        .ok_or(StillError::UnsupportedLayout {
            channels: frame.channels,
        })?;

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| StillError::Io { path, source }
    };
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let (path, file) = create_unique(dir, &still_file_name(at))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100)).encode_image(&rgb)?;
    writer.flush().map_err(io_err(&path))?;
    Ok(path)
}

/// Read one frame from `device` and store it under `dir`.
pub(crate) fn capture_still(
    device: &dyn CaptureDevice,
    dir: &Path,
    quality: u8,
) -> Result<(PathBuf, NormalizedFrame), StillError> {
    let raw = device.read()?;
    let frame = normalize(&raw)?.ok_or(StillError::EmptyFrame)?;
    let path = write_jpeg(&frame, dir, quality, Local::now())?;
    Ok((path, frame))
}

/// Take a still on a throwaway thread and report the outcome.
pub(crate) fn spawn_still(device: DeviceHandle, config: &SessionConfig, status: StatusReporter) {
    let dir = config.output_dir.clone();
    let quality = config.still_quality;
    let reporter = status.clone();

    let spawned = telemetry::spawn_thread("capture-still", move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            capture_still(device.as_ref(), &dir, quality)
        }));
        match outcome {
            Ok(Ok((path, frame))) => {
                debug!(path = %path.display(), "still written");
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                reporter.report(
                    StatusKind::StillSaved { path },
                    format!("Image saved: {name} ({}x{})", frame.width, frame.height),
                );
            }
            Ok(Err(err)) => {
                reporter.report(StatusKind::StillFailed, format!("Failed to capture frame: {err}"));
            }
            Err(payload) => {
                reporter.report(
                    StatusKind::StillFailed,
                    format!("Capture error: {}", panic_message(payload.as_ref())),
                );
            }
        }
    });

    if let Err(err) = spawned {
        status.report(
            StatusKind::StillFailed,
            format!("Capture error: cannot spawn still thread: {err}"),
        );
    }
}
