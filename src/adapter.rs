use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::GliderConfig;
use crate::log_warn;
use crate::logger::Logger;

const DEFAULT_PORT_START: u16 = 55000;
const DEFAULT_PORT_END: u16 = 59999;
const DEFAULT_MAX_CONNECTORS: usize = 128;
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Resolved settings for the external protocol adapter. `bin == None` means
/// the adapter is unavailable and every non-SOCKS5 endpoint gets skipped.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub bin: Option<PathBuf>,
    pub port_start: u16,
    pub port_end: u16,
    pub max_connectors: usize,
    pub start_timeout: Duration,
    pub max_backoff: Duration,
    pub verbose: bool,
}

impl AdapterSettings {
    pub fn enabled(&self) -> bool {
        self.bin.is_some()
    }
}

/// Fill in defaults and locate the adapter binary. An explicit `bin` wins;
/// otherwise PATH is searched for `glider`.
pub fn resolve(cfg: &GliderConfig, logger: &Logger) -> AdapterSettings {
    let port_start = if cfg.local_port_start == 0 {
        DEFAULT_PORT_START
    } else {
        cfg.local_port_start
    };
    let port_end = if cfg.local_port_end == 0 {
        DEFAULT_PORT_END
    } else {
        cfg.local_port_end
    };
    let max_connectors = if cfg.max_connectors == 0 {
        DEFAULT_MAX_CONNECTORS
    } else {
        cfg.max_connectors
    };
    let start_timeout = if cfg.start_timeout_sec == 0 {
        DEFAULT_START_TIMEOUT
    } else {
        Duration::from_secs(cfg.start_timeout_sec)
    };
    let max_backoff = if cfg.max_backoff_sec == 0 {
        DEFAULT_MAX_BACKOFF
    } else {
        Duration::from_secs(cfg.max_backoff_sec)
    };

    let bin = if cfg.bin.is_empty() {
        match find_in_path("glider") {
            Some(path) => Some(path),
            None => {
                log_warn!(
                    logger,
                    "glider binary not found, non-socks5 endpoints will be skipped"
                );
                None
            }
        }
    } else {
        Some(PathBuf::from(&cfg.bin))
    };

    AdapterSettings {
        bin,
        port_start,
        port_end,
        max_connectors,
        start_timeout,
        max_backoff,
        verbose: cfg.verbose,
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
