//! Logging bootstrap: level and optional file target from configuration.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;

use crate::error::{ RelayError, Result };

/// Map a conf-file level name onto a tracing filter.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level {
        "fatal" | "error" => Ok(LevelFilter::ERROR),
        "warning" | "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        other => Err(RelayError::config(format!("unknown log level '{other}'"))),
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops (the first subscriber wins), which keeps tests happy.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = parse_level(level)?;
    let builder = tracing_subscriber::fmt().with_max_level(filter).with_target(false);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions
                ::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    RelayError::config(format!("cannot open log file {}: {e}", path.display()))
                })?;
            let _ = builder.with_ansi(false).with_writer(Arc::new(file)).try_init();
        }
        None => {
            let _ = builder.try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level("error").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("fatal").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("warning").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("trace").unwrap(), LevelFilter::TRACE);
        assert!(parse_level("loud").is_err());
    }
}
