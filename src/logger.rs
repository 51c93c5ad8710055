//! Logging infrastructure
//!
//! Diagnostics go through the `log` crate. Every record is stamped with the
//! current simulation cycle and handed to a sink function installed at
//! [`init`], so the library stays `no_std` while a binary or test can print
//! to wherever it likes.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// Receives one formatted record: level, cycle stamp, message
pub type Sink = fn(Level, u64, fmt::Arguments<'_>);

/// Cycle counter, advanced by whoever drives the clock
static CYCLE: AtomicU64 = AtomicU64::new(0);

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Current cycle stamp
pub fn cycle() -> u64 {
    CYCLE.load(Ordering::Relaxed)
}

pub fn set_cycle(cycle: u64) {
    CYCLE.store(cycle, Ordering::Relaxed);
}

/// Level tag, padded to five columns; `color` adds ANSI escapes
pub fn level_tag(level: Level, color: bool) -> &'static str {
    match (level, color) {
        (Level::Error, true) => "\x1b[31mERROR\x1b[0m",
        (Level::Warn, true) => "\x1b[33mWARN\x1b[0m ",
        (Level::Info, true) => "\x1b[32mINFO\x1b[0m ",
        (Level::Debug, true) => "\x1b[34mDEBUG\x1b[0m",
        (Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
        (Level::Error, false) => "ERROR",
        (Level::Warn, false) => "WARN ",
        (Level::Info, false) => "INFO ",
        (Level::Debug, false) => "DEBUG",
        (Level::Trace, false) => "TRACE",
    }
}

struct CycleLogger;

impl log::Log for CycleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Copy the sink out so a sink that logs cannot deadlock
        let sink = *SINK.lock();
        if let Some(sink) = sink {
            sink(record.level(), cycle(), *record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: CycleLogger = CycleLogger;

/// Install the logger with the given sink and maximum level
///
/// Fails if another logger was installed first; the sink is replaced either
/// way.
pub fn init(sink: Sink, level: LevelFilter) -> Result<(), log::SetLoggerError> {
    *SINK.lock() = Some(sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
