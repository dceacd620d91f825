//! # Logging Initialization
//!
//! Centralized setup of the `tracing` subscriber used by processes embedding
//! the suspend controller. The controller itself only emits events; it never
//! installs a subscriber on its own.
//!
//! - **Environment Filter (`EnvFilter`)**: verbosity comes from `RUST_LOG`. When
//!   unset, `log_level` applies to every crate and `quiesce_core` logs at
//!   `debug`.
//! - **File Logging**: with `log_to_file = true`, events go to a daily rolling
//!   file in the user cache directory (`directories`), written through a
//!   non-blocking `tracing_appender` worker without ANSI colors.
//! - **Stderr Logging**: with `log_to_file = false`, or when the cache directory
//!   is unavailable or not writable, events go to stderr with ANSI colors.
//! - **OpenTelemetry** (feature `opentelemetry`): spans are also exported over
//!   OTLP/HTTP when `OTEL_EXPORTER_OTLP_ENDPOINT` or `QUIESCE_TRACING` is set.
//!
//! Initialization runs once per process; later calls are no-ops.

use anyhow::Result;
use directories::ProjectDirs;
#[cfg(feature = "opentelemetry")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "opentelemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "opentelemetry")]
use opentelemetry_sdk::{
    Resource,
    trace::{self as sdktrace, SdkTracerProvider},
};
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

const LOG_FILE_NAME: &str = "quiesce.log";

/// Initialize verbose logging for tests.
///
/// This configures a `trace`-level subscriber that logs to stderr.
pub fn init_test_logging() {
    // Another subscriber may already be installed by the test harness.
    let _ = init_logging("trace", false);
}

/// Initializes the logging system.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for sinks that can fail.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},quiesce_core=debug")));

        if log_to_file && let Some(proj_dirs) = ProjectDirs::from("com", "Quiesce", "quiesce") {
            let log_dir = proj_dirs.cache_dir();

            // tracing_appender::rolling::daily panics on permission errors,
            // so check that the directory is usable first.
            if can_write_to(log_dir) {
                let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false));

                #[cfg(feature = "opentelemetry")]
                let subscriber = subscriber.with(init_otel());

                if subscriber.try_init().is_ok() {
                    // Leaked on purpose: the worker flushes until process exit.
                    Box::leak(Box::new(guard));
                }
                return;
            }
        }

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true));

        #[cfg(feature = "opentelemetry")]
        let subscriber = subscriber.with(init_otel());

        let _ = subscriber.try_init();
    });

    Ok(())
}

#[cfg(feature = "opentelemetry")]
fn init_otel<S>() -> Option<tracing_opentelemetry::OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
        || std::env::var("QUIESCE_TRACING").is_ok()
    {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint("http://localhost:4318/v1/traces")
            .build()
            .ok()?;

        let resource = Resource::builder().with_service_name("quiesce").build();

        let provider = SdkTracerProvider::builder()
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build();

        let tracer = provider.tracer("quiesce");

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    }
}

/// Create `dir` if needed and check that a file can be written in it.
fn can_write_to(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let probe = dir.join(".quiesce_log_probe");
    match std::fs::write(&probe, "probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
