/*!
 * Logging and tracing initialization
 *
 * Every resumable transfer runs inside a `transfer` span carrying the
 * operation, bucket and key, and part workers re-enter it, so each log line
 * of a transfer can be attributed to it. Stdout output is compact and shows
 * the span context; file output is JSON with the span fields attached.
 */

use std::fs::File;
use std::path::Path;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::checkpoint::OpType;
use crate::config::ClientConfig;
use crate::error::{Result, VaultError};

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &ClientConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(config)))
        .map_err(|e| VaultError::Validate(format!("Failed to create log filter: {}", e)))?;

    if let Some(ref log_path) = config.log_file {
        init_file_logging(log_path, env_filter)
    } else {
        init_stdout_logging(env_filter, config.verbose)
    }
}

/// Span covering one resumable transfer
pub fn transfer_span(op_type: OpType, bucket: &str, key: &str) -> Span {
    tracing::info_span!("transfer", op = %op_type, bucket = bucket, key = key)
}

fn effective_level(config: &ClientConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.log_level.to_tracing_level()
    }
}

/// Filter for the crate's targets
///
/// The in-memory store logs every stored part; it stays at info unless
/// tracing is asked for explicitly.
fn filter_directives(config: &ClientConfig) -> String {
    let level = effective_level(config);
    if level == Level::TRACE {
        format!("objvault={}", level)
    } else {
        format!("objvault={},objvault::transport::memory=info", level)
    }
}

/// Initialize logging to stdout/stderr
///
/// In verbose mode every finished transfer span is reported with its timing.
fn init_stdout_logging(env_filter: EnvFilter, verbose: bool) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_span_events(if verbose { FmtSpan::CLOSE } else { FmtSpan::NONE })
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| VaultError::Validate(format!("Logging already initialized: {}", e)))
}

/// Initialize logging to a file, one JSON object per line
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| VaultError::Validate(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json()
        .with_current_span(true)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| VaultError::Validate(format!("Logging already initialized: {}", e)))
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("objvault=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}
