//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Build the log filter: `RUST_LOG` wins, otherwise `default_level`
pub fn log_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
///
/// Thread names are included so lines from the `usb-event-pump` thread can be
/// told apart from the main thread.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = log_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_accepts_directives() {
        assert!(log_filter("info").is_ok());
        assert!(log_filter("device=trace,warn").is_ok());
    }

    #[test]
    fn test_second_init_is_an_error() {
        let _ = setup_logging("warn");
        assert!(matches!(
            setup_logging("warn"),
            Err(crate::Error::Logging(_))
        ));
    }
}
