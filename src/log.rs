//! Terminal backend for the [`log`] facade, emitting messages based on
//! severity levels.
//!
//! The library only logs through the facade macros; binaries decide whether
//! to install this backend with [`init`].

use std::{mem, time};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

static LOGGER: Logger = Logger;

/// Writes log records to the terminal.
///
/// - [Level::Info], [Level::Debug] and [Level::Trace] records are printed to
///   `stdout`.
/// - [Level::Warn] and [Level::Error] records are printed to `stderr`.
///
/// Each line includes a local timestamp, the severity level, and the target
/// of the record.
#[derive(Debug)]
pub struct Logger;

/// Installs [Logger] as the global logger, showing records up to `level`.
///
/// # Errors
///
/// Returns an error if a global logger was already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);

    Ok(())
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = timestamp();
        let target = record.target();
        let msg = record.args();

        match record.level() {
            Level::Error => {
                eprintln!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;31mERROR\x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Warn => {
                eprintln!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;33mWARN \x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Info => {
                println!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;32mINFO \x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Debug => {
                println!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;34mDEBUG\x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
            Level::Trace => {
                println!(
                    "[\x1b[1;37m{timestamp}\x1b[0m] \x1b[1;35mTRACE\x1b[0m [\x1b[1;37m{target}\x1b[0m] {msg}"
                );
            }
        }
    }

    fn flush(&self) {}
}

/// Formats the current local time as `YYYY-MM-DD HH:MM:SS`.
fn timestamp() -> String {
    let now = time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let time = now as libc::time_t;
    let mut tm: libc::tm = unsafe { mem::zeroed() };

    // `localtime_r` instead of `localtime`: records arrive from every
    // connection thread.
    if unsafe { libc::localtime_r(&time, &mut tm) }.is_null() {
        return "UNKNOWN".to_string();
    }

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}
