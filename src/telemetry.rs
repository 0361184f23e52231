//! Logging setup. Builds a `tracing` subscriber from the `LOG_LEVEL` and
//! `LOG_FILE` settings: always a console layer, plus a plain-text file layer
//! when a path is configured.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops (tests and embedding applications may have their own).
pub fn init(settings: &Settings) {
    let level = settings.get_str("LOG_LEVEL", "info");
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_file = settings.get_str("LOG_FILE", "");
    let file_layer = if log_file.is_empty() {
        None
    } else {
        match OpenOptions::new().create(true).append(true).open(&log_file) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            ),
            Err(err) => {
                eprintln!("failed to open log file {log_file:?}: {err}");
                None
            }
        }
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init();
}
