//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. explicit level passed by the caller (e.g. the wrapper's `--debug` flag)
//! 2. `JOBRACK_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`
//!
//! Output goes to stderr so that stdout of a wrapper process stays free for
//! the job itself.

use tracing_subscriber::fmt;

pub const LOG_ENV_VAR: &str = "JOBRACK_LOG";

/// Install the global fmt subscriber.
///
/// Calling it again is harmless: the second installation is ignored.
pub fn init_logging(level: Option<&str>) {
    let level = resolve_level(level, std::env::var(LOG_ENV_VAR).ok().as_deref());

    let _ = fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_level(explicit: Option<&str>, env: Option<&str>) -> tracing::Level {
    explicit
        .and_then(parse_level_str)
        .or_else(|| env.and_then(parse_level_str))
        .unwrap_or(tracing::Level::INFO)
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_precedence() {
        assert_eq!(resolve_level(Some("debug"), Some("warn")), tracing::Level::DEBUG);
        assert_eq!(resolve_level(None, Some("warn")), tracing::Level::WARN);
        assert_eq!(resolve_level(Some("loud"), None), tracing::Level::INFO);
        assert_eq!(resolve_level(None, None), tracing::Level::INFO);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(Some("error"));
        init_logging(Some("debug"));
    }
}
