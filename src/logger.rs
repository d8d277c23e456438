//! Engine logging: an installable host sink plus breadcrumb categories.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

/// Sink invoked for every emitted log line.
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Install (or replace) the process-wide log sink.
pub fn install_sink<F>(sink: F, min_level: LogLevel)
where
    F: Fn(LogLevel, &str) + Send + Sync + 'static,
{
    LOGGER.install_sink(Arc::new(sink), min_level);
}

pub fn clear_sink() {
    LOGGER.clear_sink();
}

pub fn set_breadcrumb_mask(mask: BreadcrumbFlags) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const FLOW   = 0b0000_0001;
        const PACKET = 0b0000_0010;
        const SOCKET = 0b0000_0100;
        const WINDOW = 0b0000_1000;
        const PURGE  = 0b0001_0000;
        const POLL   = 0b0010_0000;
        const ALL    = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone)]
struct SinkInner {
    sink: LogSink,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<SinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[pivotun-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: LogSink, min_level: LogLevel) {
        let mut guard = self.sink.lock();
        *guard = Some(SinkInner {
            sink,
            breadcrumbs: BreadcrumbFlags::empty(),
            min_level,
        });
    }

    fn clear_sink(&self) {
        *self.sink.lock() = None;
    }

    fn set_breadcrumb_mask(&self, mask: BreadcrumbFlags) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = mask;
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let inner = {
            let guard = self.sink.lock();
            guard.clone()
        };
        let Some(inner) = inner else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {}", self.prefix, message)
        } else {
            format!("{} [{}] {}", self.prefix, label_for(breadcrumbs), message)
        };
        (inner.sink)(level, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::FLOW) {
        "FLOW"
    } else if flags.contains(BreadcrumbFlags::PACKET) {
        "PACKET"
    } else if flags.contains(BreadcrumbFlags::SOCKET) {
        "SOCKET"
    } else if flags.contains(BreadcrumbFlags::WINDOW) {
        "WINDOW"
    } else if flags.contains(BreadcrumbFlags::PURGE) {
        "PURGE"
    } else if flags.contains(BreadcrumbFlags::POLL) {
        "POLL"
    } else {
        "LOG"
    }
}
