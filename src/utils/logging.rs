use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::level_filters::LevelFilter;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{format::FmtSpan, writer::BoxMakeWriter},
    EnvFilter,
};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is unset
    pub level: Level,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include source code locations
    pub source_location: bool,
    /// Whether to log span open and close events
    pub log_spans: bool,
    /// Output file path (None for stderr)
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            timestamps: true,
            source_location: false,
            log_spans: false,
            file_path: None,
        }
    }
}

/// Install the global subscriber. Only the first call has an effect.
pub fn setup_logging(config: LogConfig) -> Result<(), String> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = build_subscriber(&config).and_then(|subscriber| {
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| format!("Failed to set global subscriber: {}", e))
        });
    });

    result
}

fn build_subscriber(config: &LogConfig) -> Result<Box<dyn Subscriber + Send + Sync>, String> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let writer = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Failed to open log file: {}", e))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file_path.is_none())
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if config.timestamps {
        Ok(Box::new(builder.finish()))
    } else {
        Ok(Box::new(builder.without_time().finish()))
    }
}

/// Run `f` under a subscriber that records every event as plain text
#[cfg(test)]
pub(crate) fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let buffer = Buffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .without_time()
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (result, logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_log_initialization_is_idempotent() {
        assert!(setup_logging(LogConfig::default()).is_ok());
        assert!(setup_logging(LogConfig {
            level: Level::DEBUG,
            ..Default::default()
        })
        .is_ok());
    }

    #[test]
    fn test_file_logging() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("ingest.log");

        let subscriber = build_subscriber(&LogConfig {
            file_path: Some(log_path.clone()),
            timestamps: false,
            ..Default::default()
        })
        .unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(pages = 12, "Prompt truncated to fit within max token limit.");
            tracing::debug!("below the configured level");
        });

        let contents = fs::read_to_string(log_path).unwrap();
        assert!(contents.contains("Prompt truncated to fit within max token limit."));
        assert!(contents.contains("pages=12"));
        assert!(!contents.contains("below the configured level"));
    }

    #[test]
    fn test_capture_logs_records_levels() {
        let (value, logs) = capture_logs(|| {
            tracing::warn!(kept_tokens = 3, "trimmed");
            tracing::trace!("fine");
            7
        });
        assert_eq!(value, 7);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("kept_tokens=3"));
        assert!(logs.contains("TRACE"));
    }

    #[test]
    fn test_unwritable_log_file() {
        let dir = tempdir().unwrap();
        let result = build_subscriber(&LogConfig {
            file_path: Some(dir.path().join("missing").join("app.log")),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
