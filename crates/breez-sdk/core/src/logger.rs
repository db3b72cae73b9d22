use std::fs::OpenOptions;

use tracing::{Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{
        FormatFields,
        format::{DefaultFields, Writer},
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::{SdkError, models::{LogEntry, Logger}};

const DEFAULT_LOG_FILTER: &str =
    "debug,h2=warn,rustls=warn,hyper=warn,hyper_util=warn,tower=warn,reqwest=warn";

/// Forwards formatted tracing events to the application-provided [`Logger`].
struct GlobalSdkLogger {
    log_listener: Option<Box<dyn Logger>>,
}

impl<S: Subscriber> Layer<S> for GlobalSdkLogger {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(listener) = &self.log_listener {
            let level = *event.metadata().level();
            if level > Level::INFO {
                return;
            }
            let mut line = String::new();
            if DefaultFields::new()
                .format_fields(Writer::new(&mut line), event)
                .is_ok()
            {
                listener.log(LogEntry {
                    line,
                    level: level.to_string(),
                });
            }
        }
    }
}

/// Initializes the global tracing subscriber. When `log_dir` is set, logs are
/// appended to `sdk.log` in that directory. May only be called once per
/// process.
pub fn init_logging(
    log_dir: Option<&str>,
    app_logger: Option<Box<dyn Logger>>,
    log_filter: Option<&str>,
) -> Result<(), SdkError> {
    let filter = EnvFilter::new(log_filter.unwrap_or(DEFAULT_LOG_FILTER));
    let logger_layer = GlobalSdkLogger {
        log_listener: app_logger,
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(logger_layer);

    match log_dir {
        Some(log_dir) => {
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(format!("{log_dir}/sdk.log"))
                .map_err(|e| SdkError::Generic(format!("Failed to open log file: {e}")))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_line_number(true)
                        .with_writer(log_file),
                )
                .try_init()
        }
        None => registry.try_init(),
    }
    .map_err(|e| SdkError::Generic(format!("Failed to initialize logging: {e}")))?;

    Ok(())
}
