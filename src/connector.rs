use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterSettings;
use crate::endpoint::{Endpoint, Kind};
use crate::logger::Logger;
use crate::ports::PortPool;
use crate::{log_debug, log_info, log_warn};

/// A running adapter child process listening on a loopback SOCKS5 port and
/// forwarding to one non-SOCKS5 upstream.
#[derive(Debug)]
pub struct Connector {
    pub endpoint: Endpoint,
    pub port: u16,
    pub pid: Option<u32>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Connector {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. The supervisor task kills the child and releases the port
    /// once the cancellation lands.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }
}

struct RetryState {
    next_attempt: Instant,
    delay: Duration,
}

#[derive(Default)]
struct RegistryInner {
    connectors: HashMap<String, Arc<Connector>>,
    backoff: HashMap<String, RetryState>,
}

/// Registry of live connectors, keyed by `Endpoint.raw`. At most one live
/// connector per key; spawn failures back off exponentially up to the
/// configured cap.
#[derive(Default)]
pub struct ConnectorRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(
        &self,
        settings: &AdapterSettings,
        ports: &Arc<PortPool>,
        logger: &Logger,
        endpoint: &Endpoint,
    ) -> anyhow::Result<Arc<Connector>> {
        if endpoint.kind == Kind::Socks5 {
            bail!("socks5 endpoint does not need a connector");
        }
        let Some(bin) = settings.bin.as_ref() else {
            bail!("adapter is disabled, cannot handle {} endpoint {}", endpoint.kind, endpoint.raw);
        };

        let key = endpoint.raw.clone();
        let connector = {
            let mut inner = self.inner.lock().await;

            if let Some(existing) = inner.connectors.get(&key) {
                if !existing.is_closed() {
                    return Ok(existing.clone());
                }
            }

            if let Some(retry) = inner.backoff.get(&key) {
                if Instant::now() < retry.next_attempt {
                    bail!("adapter spawn for {key} is backing off");
                }
            }

            let live = inner.connectors.values().filter(|c| !c.is_closed()).count();
            if live >= settings.max_connectors {
                bail!("connector limit reached ({} live)", live);
            }

            let port = ports
                .allocate()
                .context("allocate local port for connector")?;

            let listen = format!("socks5://127.0.0.1:{port}");
            let mut command = Command::new(bin);
            command
                .arg("-listen")
                .arg(&listen)
                .arg("-forward")
                .arg(endpoint.url.as_str())
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            if settings.verbose {
                command.arg("-verbose");
            }

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(err) => {
                    ports.release(port);
                    let delay = next_backoff(inner.backoff.get(&key), settings.max_backoff);
                    inner.backoff.insert(
                        key.clone(),
                        RetryState {
                            next_attempt: Instant::now() + delay,
                            delay,
                        },
                    );
                    return Err(err).with_context(|| format!("spawn adapter for {key}"));
                }
            };
            inner.backoff.remove(&key);

            let pid = child.id();
            let closed = Arc::new(AtomicBool::new(false));
            let cancel = CancellationToken::new();
            log_debug!(logger, "adapter for {key} listening on {listen} pid={pid:?}");

            // Supervise the child: mark closed and free the port whether it
            // exits on its own or is cancelled.
            {
                let closed = closed.clone();
                let cancel = cancel.clone();
                let ports = ports.clone();
                let logger = logger.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        status = child.wait() => {
                            match status {
                                Ok(status) => log_info!(logger, "adapter for {key} exited: {status}"),
                                Err(err) => log_warn!(logger, "adapter wait for {key} failed: {err}"),
                            }
                        }
                        _ = cancel.cancelled() => {
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                        }
                    }
                    closed.store(true, Ordering::SeqCst);
                    ports.release(port);
                });
            }

            let connector = Arc::new(Connector {
                endpoint: endpoint.clone(),
                port,
                pid,
                closed,
                cancel,
            });
            inner.connectors.insert(key.clone(), connector.clone());
            connector
        };

        // Best-effort readiness wait outside the registry lock; a slow start
        // just means the first dial through this connector may still race it.
        self.wait_ready(connector.port, settings.start_timeout).await;
        Ok(connector)
    }

    async fn wait_ready(&self, port: u16, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Close and deregister every connector. Called on graceful shutdown.
    pub async fn cleanup_all(&self) {
        let mut inner = self.inner.lock().await;
        for connector in inner.connectors.values() {
            connector.close();
        }
        inner.connectors.clear();
    }
}

fn next_backoff(previous: Option<&RetryState>, cap: Duration) -> Duration {
    match previous {
        Some(retry) => (retry.delay * 2).min(cap),
        None => Duration::from_secs(1),
    }
}
