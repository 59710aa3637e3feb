use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::infra::http::RATE_LIMITED_METRIC;
use crate::infra::toolchain::{COMPILE_DURATION_METRIC, COMPILE_TOTAL_METRIC};

use super::error::InfraError;

const LOG_FILE_PREFIX: &str = "latex-compiler";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Keeps background log writers alive; dropping it flushes buffered file output.
#[must_use = "dropping the guard stops file logging"]
pub struct TelemetryGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<TelemetryGuard, InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    let (file_layer, file_writer) = match logging.file_directory.as_ref() {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix("log")
                .build(directory)
                .map_err(|err| {
                    InfraError::telemetry(format!("failed to open log directory: {err}"))
                })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })?;

    Ok(TelemetryGuard {
        _file_writer: file_writer,
    })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            COMPILE_TOTAL_METRIC,
            Unit::Count,
            "Total number of compilation jobs, labelled by outcome."
        );
        describe_histogram!(
            COMPILE_DURATION_METRIC,
            Unit::Milliseconds,
            "Wall-clock time spent running the toolchain in milliseconds."
        );
        describe_counter!(
            RATE_LIMITED_METRIC,
            Unit::Count,
            "Total number of requests rejected by the rate limiter."
        );
    });
}
