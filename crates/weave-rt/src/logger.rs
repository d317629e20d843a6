// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Log output for embedders.
//!
//! The runtime only emits `tracing` events. Hosts that do not install a
//! subscriber of their own can call [`init`] for plain `[LEVEL] message`
//! lines on stderr.
//!
//! ```
//! weave_rt::logger::init_with_level(weave_rt::logger::LogLevel::Debug);
//! tracing::debug!("scheduler output enabled");
//! ```

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Install the default subscriber at INFO.
pub fn init() {
    init_with_level(LogLevel::default());
}

/// Install the default subscriber at `level`. Does nothing if a global
/// subscriber is already set.
pub fn init_with_level(level: LogLevel) {
    let filter = LevelFilter::from_level(level.into());

    // No timestamps, no module path, no colour.
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .with_level(true)
        .with_ansi(false)
        .compact()
        .with_filter(filter);

    let _ = Registry::default().with(layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_tracing() {
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
        assert_eq!(tracing::Level::from(LogLevel::Warn), tracing::Level::WARN);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn init_twice_is_harmless() {
        init();
        init_with_level(LogLevel::Debug);
        tracing::info!("still running");
    }
}
