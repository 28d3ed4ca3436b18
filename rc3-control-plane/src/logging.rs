use crate::config::{DevelopmentConfig, GeneralConfig};
use tracing::error;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Install the global tracing subscriber. `RUST_LOG` wins over
/// `general.log_level` when set.
pub fn init(general: &GeneralConfig, development: &DevelopmentConfig) {
    let (level, recognized) = parse_level(&general.log_level);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    if development.pretty_logging {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stdout),
            )
            .init();
    }

    if !recognized {
        error!(
            log_level = %general.log_level,
            "Log level not recognized; defaulting to debug"
        );
    }
}

fn parse_level(level: &str) -> (LevelFilter, bool) {
    match level.to_ascii_lowercase().as_str() {
        "trace" => (LevelFilter::TRACE, true),
        "debug" => (LevelFilter::DEBUG, true),
        "info" => (LevelFilter::INFO, true),
        "warn" => (LevelFilter::WARN, true),
        "error" | "fatal" | "panic" => (LevelFilter::ERROR, true),
        "off" => (LevelFilter::OFF, true),
        _ => (LevelFilter::DEBUG, false),
    }
}
