use std::io::Write;

use chrono::Local;

/// Log severities, ordered so a configured level also admits everything less
/// chatty than itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::None => "",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn color(self) -> &'static str {
        match self {
            LogLevel::None => "",
            LogLevel::Error => "\x1b[31m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Debug => "\x1b[36m",
        }
    }
}

/// Stderr logger for the gateway. The level is fixed at construction. Regular
/// lines carry the same second-resolution timestamp the dispatcher logs next
/// to each chosen endpoint; the health-check counter goes through
/// `progress`/`progress_done` so it can overwrite itself on stdout without
/// tearing the log.
#[derive(Clone)]
pub struct Logger {
    level: LogLevel,
    colored: bool,
}

impl Logger {
    pub fn new(level: LogLevel, colored: bool) -> Self {
        Self { level, colored }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub(crate) fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::None && level <= self.level
    }

    fn write(&self, level: LogLevel, msg: &str) {
        if !self.enabled(level) {
            return;
        }
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        if self.colored {
            eprintln!("{timestamp} {}{:<5}\x1b[0m {msg}", level.color(), level.label());
        } else {
            eprintln!("{timestamp} {:<5} {msg}", level.label());
        }
    }

    pub fn error(&self, msg: &str) {
        self.write(LogLevel::Error, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.write(LogLevel::Warn, msg);
    }

    pub fn info(&self, msg: &str) {
        self.write(LogLevel::Info, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.write(LogLevel::Debug, msg);
    }

    /// Overwrite the current progress line (the probe counter).
    pub fn progress(&self, msg: &str) {
        if self.level == LogLevel::None {
            return;
        }
        print!("\r{msg}");
        let _ = std::io::stdout().flush();
    }

    /// Finish a progress line so regular output starts fresh.
    pub fn progress_done(&self) {
        if self.level != LogLevel::None {
            println!();
        }
    }
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.error(&format!($($arg)*))
    };
}
