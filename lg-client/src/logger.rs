//! Logging init, identical in shape to this workspace's existing
//! `flexi_logger`-based setup: a file sink, buffered writes, and a custom
//! per-line format carrying timestamp, level, source location and thread
//! name.

use flexi_logger::{DeferredNow, FileSpec, Logger, LoggerHandle, WriteMode};
use log::Record;
use std::io::Write;
use std::thread;

/// Initializes the logger with custom formatting. The returned handle must
/// be kept alive for the duration of the process; dropping it stops logging.
pub fn init_logger(level: &str) -> Result<LoggerHandle, Box<dyn std::error::Error>> {
    let spec = format!("lg_client={level}");
    let handle = Logger::try_with_str(spec)?
        .log_to_file(FileSpec::default().directory("logs").suppress_timestamp())
        .append()
        .write_mode(WriteMode::BufferAndFlush)
        .format(log_format)
        .start()?;
    Ok(handle)
}

fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} [{:<5}] [{}:{}] [{}] {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        record.level(),
        record.file().unwrap_or("<unknown>"),
        record.line().unwrap_or(0),
        thread::current().name().unwrap_or("<unnamed>"),
        &record.args()
    )
}
