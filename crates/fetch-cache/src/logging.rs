use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, Logging};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => {
            "INFO,\
             hyper=WARN,\
             reqwest=WARN"
        }
        LevelFilter::DEBUG => {
            "INFO,\
             fetch_cache=DEBUG,\
             fetchcli=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             fetch_cache=TRACE,\
             fetchcli=TRACE"
        }
    }
}

/// Initializes logging for the process.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in
/// the configuration.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init_logging(config: &Logging) {
    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_string());

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let fmt_layer = match (config.format, console::user_attended_stderr()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&rust_log)))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log() {
        assert_eq!(get_rust_log(LevelFilter::OFF), "");
        assert_eq!(
            get_rust_log(LevelFilter::DEBUG),
            "INFO,fetch_cache=DEBUG,fetchcli=DEBUG"
        );
        // every level produces a valid filter
        for level in [
            LevelFilter::ERROR,
            LevelFilter::WARN,
            LevelFilter::INFO,
            LevelFilter::TRACE,
        ] {
            EnvFilter::try_new(get_rust_log(level)).unwrap();
        }
    }
}
