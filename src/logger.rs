//! Per-task execution logger.
//!
//! The engine reports per-file outcomes through a plain callback so the
//! sink stays swappable: the daemon forwards into `tracing`, tests capture
//! lines in memory.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warn,
    Error,
    Succeed,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Succeed => "SUCCEED",
        };
        f.write_str(s)
    }
}

/// Callback logger handed through the Runner and Watcher.
pub type Logger = Arc<dyn Fn(Level, &str) + Send + Sync>;

/// Logger that forwards into the process-wide `tracing` subscriber, tagged
/// with the task name. SUCCEED maps to info with an explicit outcome field.
pub fn tracing_logger(task: impl Into<String>) -> Logger {
    let task = task.into();
    Arc::new(move |level, msg| match level {
        Level::Info => tracing::info!(task = %task, "{msg}"),
        Level::Warn => tracing::warn!(task = %task, "{msg}"),
        Level::Error => tracing::error!(task = %task, "{msg}"),
        Level::Succeed => tracing::info!(task = %task, outcome = "succeed", "{msg}"),
    })
}

/// Logger that prints to stdout, for CLI one-shots.
pub fn stdout_logger() -> Logger {
    Arc::new(|level, msg| println!("[{level}] {msg}"))
}
