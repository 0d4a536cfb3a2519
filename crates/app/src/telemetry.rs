//! Tracing subscriber and Prometheus recorder setup for the CLI.

use std::{path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{filter_fn, EnvFilter},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the subscriber installed and flushes the Chrome trace on drop.
pub(crate) struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install the global metrics recorder once and return its handle.
pub(crate) fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).context("metrics recorder already installed")?;

    let upkeep_handle = handle.clone();
    if let Err(err) = capture::telemetry::spawn_thread("prometheus-upkeep", move || loop {
        thread::sleep(Duration::from_secs(5));
        upkeep_handle.run_upkeep();
    }) {
        tracing::warn!("failed to spawn prometheus upkeep thread: {err}");
    }

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the fmt subscriber (`RUST_LOG`, default `info`) and, when a path is
/// given, a Chrome trace layer recording spans.
pub(crate) fn enter_runtime(chrome_trace_path: Option<&Path>) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match chrome_trace_path {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

fn build_chrome_layer(
    path: &Path,
) -> std::io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
