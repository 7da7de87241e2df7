//! Logging configuration and initialization

use crate::config::LoggingConfig;
use crate::error::{Result, WatermarkError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging system with stderr output at `info`
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    init_logging_with(&LoggingConfig::default())
}

/// Initialize the logging system from configuration.
///
/// `RUST_LOG` wins over the configured level. When a log file is configured
/// the returned guard must be kept alive for buffered lines to be flushed.
pub fn init_logging_with(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.output_path {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().ok_or_else(|| WatermarkError::Logging {
                message: format!("Log path {} has no file name", path.display()),
            })?;
            let appender = tracing_appender::rolling::never(
                directory.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
    {
        Ok(()) => Ok(guard),
        Err(e) => {
            let error_msg = e.to_string();
            if error_msg.contains("a global default trace dispatcher has already been set") {
                // Already initialized by an earlier call or the host application
                Ok(None)
            } else {
                Err(WatermarkError::Logging {
                    message: format!("Failed to initialize logging: {}", e),
                })
            }
        }
    }
}
