//! Logging configuration
//!
//! Initializes tracing for the application.

use crate::config::LogFormat;

/// Initializes logging with the specified level; `RUST_LOG` takes precedence.
///
/// Only the first call installs a subscriber.
pub fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug", LogFormat::Text);
        init_logging("info", LogFormat::Json);
    }
}
