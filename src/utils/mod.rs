//! Utility functions for logging setup

mod logging;

pub use logging::{setup_logging, LogConfig};

#[cfg(test)]
pub(crate) use logging::capture_logs;
