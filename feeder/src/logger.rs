use flexi_logger::{DeferredNow, FileSpec, FlexiLoggerError, Logger, LoggerHandle, WriteMode};
use log::Record;
use std::io::Write;

/// Initializes the file logger with custom formatting.
///
/// Logs land under /data/local/tmp so the daemon works the same whether it
/// was started by init or from an adb shell.
pub fn init_logger() -> Result<LoggerHandle, FlexiLoggerError> {
    let handle = Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("/data/local/tmp/vcam_logs")
                .suppress_timestamp(),
        )
        .append()
        .write_mode(WriteMode::BufferAndFlush)
        .format(log_format)
        .start()?;
    Ok(handle)
}

/// One line per record: millisecond timestamp, level, emitting module, and
/// the message. Milliseconds matter when correlating publishes against
/// `last_update_ms`; the daemon is single-threaded, so no thread field.
fn log_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} {:<5} {}: {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}
