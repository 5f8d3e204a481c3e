//! Process-wide logging setup.
//!
//! - Debug builds: console + file output (debug level)
//! - Release builds: file output only (info level)

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_DIR_NAME: &str = ".hlinkd";
const LOG_FILE_PREFIX: &str = "hlinkd.log";
const LOG_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

pub fn init() {
    let is_debug = cfg!(debug_assertions);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if is_debug { "debug" } else { "info" };
        EnvFilter::new(format!("hlinkd={level},warn"))
    });

    let file_appender = setup_file_appender();
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(file_appender);

    let console_layer = is_debug.then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();
}

fn setup_file_appender() -> RollingFileAppender {
    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(LOG_DIR_NAME)
        .join("logs");

    fs::create_dir_all(&log_dir).ok();
    cleanup_old_logs(&log_dir);

    RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX)
}

fn cleanup_old_logs(log_dir: &PathBuf) {
    let max_age = Duration::from_secs(LOG_MAX_AGE_SECS);
    let Ok(entries) = fs::read_dir(log_dir) else { return };
    let now = SystemTime::now();

    for entry in entries.flatten() {
        let expired = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);

        if expired {
            let _ = fs::remove_file(entry.path());
        }
    }
}
