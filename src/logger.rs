use alloc::collections::VecDeque;
use alloc::string::String;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use spin::{Mutex, RwLock};

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());
static RING_ENABLED: AtomicBool = AtomicBool::new(true);

static SINK: RwLock<Option<&'static dyn LogSink>> = RwLock::new(None);
static TIME_SOURCE: RwLock<Option<fn() -> u64>> = RwLock::new(None);

/// Records kept for post-mortem dumps.
pub const LOG_RING_CAPACITY: usize = 128;

lazy_static::lazy_static! {
    static ref LOG_RING: Mutex<VecDeque<LogRecord>> =
        Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY));
}

/// Severity, most severe first. The discriminant is the console priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    PANIC = 0,
    FATAL = 1,
    ERROR = 2,
    WARN = 3,
    INFO = 4,
    DEBUG = 5,
    TRACE = 6,
}

const LEVELS: [(LogLevel, &str); 7] = [
    (LogLevel::PANIC, "PANIC"),
    (LogLevel::FATAL, "FATAL"),
    (LogLevel::ERROR, "ERROR"),
    (LogLevel::WARN, "WARN"),
    (LogLevel::INFO, "INFO"),
    (LogLevel::DEBUG, "DEBUG"),
    (LogLevel::TRACE, "TRACE"),
];

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        LEVELS[self as usize].1
    }

    pub const fn priority(self) -> u8 {
        self as u8
    }

    /// Anything past `TRACE` clamps to it.
    pub fn from_priority(value: u8) -> Self {
        LEVELS[(value as usize).min(LEVELS.len() - 1)].0
    }

    /// Level name in any case, `warning`, or a numeric priority.
    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("warning") {
            return Some(LogLevel::WARN);
        }
        if let Some(&(level, _)) = LEVELS.iter().find(|(_, name)| name.eq_ignore_ascii_case(value)) {
            return Some(level);
        }
        value.parse::<u8>().ok().map(LogLevel::from_priority)
    }
}

/// Destination for formatted log lines.
///
/// The kernel image installs its console here; hosts and tests install
/// whatever they like. Sinks must not log themselves.
pub trait LogSink: Sync {
    fn write_line(&self, level: LogLevel, timestamp: u64, line: &str);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub timestamp: u64,
    pub message: String,
}

pub fn set_sink(sink: &'static dyn LogSink) {
    *SINK.write() = Some(sink);
}

pub fn clear_sink() {
    *SINK.write() = None;
}

/// Install the timestamp source used to stamp records (ticks, microseconds,
/// whatever the platform counts in).
pub fn set_time_source(source: fn() -> u64) {
    *TIME_SOURCE.write() = Some(source);
}

pub fn set_ring_enabled(enabled: bool) {
    RING_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    let current = LOG_LEVEL.load(Ordering::Relaxed);
    if level.priority() > current {
        return;
    }

    let sink = *SINK.read();
    let keep = RING_ENABLED.load(Ordering::Relaxed);
    if sink.is_none() && !keep {
        return;
    }

    let timestamp = timestamp();
    let mut line = PlainLogBuffer::new();
    // Overlong messages are cut at the buffer size.
    let _ = line.write_fmt(args);
    let text = line.as_str();

    if let Some(sink) = sink {
        sink.write_line(level, timestamp, text);
    }

    if keep {
        let mut ring = LOG_RING.lock();
        if ring.len() == LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(LogRecord {
            level,
            timestamp,
            message: String::from(text),
        });
    }
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn parse_level_directive(cmdline: &str) -> Option<LogLevel> {
    let mut found = None;
    for token in cmdline.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("log") || key.eq_ignore_ascii_case("loglevel") {
                if let Some(level) = LogLevel::from_str(value) {
                    found = Some(level);
                }
            }
        } else if token.eq_ignore_ascii_case("quiet") {
            found = Some(LogLevel::WARN);
        } else if token.eq_ignore_ascii_case("debug") {
            found = Some(LogLevel::DEBUG);
        }
    }
    found
}

/// Copy of the retained records, oldest first.
pub fn ring_snapshot() -> alloc::vec::Vec<LogRecord> {
    LOG_RING.lock().iter().cloned().collect()
}

pub fn clear_ring() {
    LOG_RING.lock().clear();
}

fn timestamp() -> u64 {
    match *TIME_SOURCE.read() {
        Some(source) => source(),
        None => 0,
    }
}

/// Formats `[timestamp] [LEVEL] message` the way console sinks print it.
pub struct LineDisplay<'a> {
    pub level: LogLevel,
    pub timestamp: u64,
    pub message: &'a str,
}

impl fmt::Display for LineDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>10}] [{:<5}] {}",
            self.timestamp,
            self.level.as_str(),
            self.message
        )
    }
}

struct PlainLogBuffer {
    buf: [u8; 512],
    len: usize,
}

impl PlainLogBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; 512],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Pieces are only ever cut at char boundaries.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl Write for PlainLogBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take < s.len() {
            return Err(fmt::Error);
        }
        Ok(())
    }
}
