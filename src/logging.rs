//! Logging setup: rolling file output plus a coloured console in text mode.

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Noisy dependencies capped unless explicitly overridden in `log_targets`.
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "hyper=warn"];

fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// `EnvFilter` directives derived from config: base level, dependency caps,
/// then per-target overrides (later directives win).
pub fn filter_directives(config: &AppConfig) -> String {
    let mut parts = vec![config.log_level.clone()];
    for quiet in QUIET_TARGETS {
        let target = quiet.split('=').next().unwrap_or_default();
        let overridden = config
            .log_targets
            .iter()
            .any(|t| t.split('=').next() == Some(target));
        if !overridden {
            parts.push((*quiet).to_string());
        }
    }
    parts.extend(config.log_targets.iter().cloned());
    parts.join(",")
}

/// Install the global subscriber. Keep the guard alive for the process lifetime.
///
/// `RUST_LOG` takes precedence over the configured directives.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(false)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .with(fmt::layer().with_target(false).with_ansi(true))
            .init();
    }

    guard
}
