use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use anyhow::bail;

/// In-process loopback port pool for adapter connectors. A candidate is only
/// handed out after a successful bind-and-close probe, so ports taken by other
/// processes are skipped.
pub struct PortPool {
    start: u16,
    end: u16,
    held: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Find a free TCP port on 127.0.0.1 within the configured range.
    pub fn allocate(&self) -> anyhow::Result<u16> {
        if self.start == 0 || self.end == 0 || self.end < self.start {
            bail!("invalid local port range: {}-{}", self.start, self.end);
        }

        let mut held = self.held.lock().unwrap();
        for port in self.start..=self.end {
            if held.contains(&port) {
                continue;
            }
            match TcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => {
                    drop(listener);
                    held.insert(port);
                    return Ok(port);
                }
                Err(_) => continue,
            }
        }
        bail!("no available ports in range {}-{}", self.start, self.end)
    }

    pub fn release(&self, port: u16) {
        self.held.lock().unwrap().remove(&port);
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}
