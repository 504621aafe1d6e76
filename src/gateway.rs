use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapter::AdapterSettings;
use crate::connector::{Connector, ConnectorRegistry};
use crate::endpoint::Endpoint;
use crate::logger::Logger;
use crate::ports::PortPool;
use crate::state::PoolState;
use crate::{log_error, log_warn};

/// The long-lived gateway value. Owns the pool state, the connector registry
/// and the port pool; everything that used to be process-global lives here.
/// Lock order when both are needed: connector registry before port pool.
pub struct Gateway {
    pub logger: Logger,
    pub state: Mutex<PoolState>,
    pub connectors: ConnectorRegistry,
    pub adapter: AdapterSettings,
    pub ports: Arc<PortPool>,
    pub timeout_secs: u64,
    pub failover: bool,
    pub last_data_file: PathBuf,
}

impl Gateway {
    pub fn new(
        logger: Logger,
        adapter: AdapterSettings,
        timeout_secs: u64,
        failover: bool,
        last_data_file: PathBuf,
    ) -> Arc<Self> {
        let ports = Arc::new(PortPool::new(adapter.port_start, adapter.port_end));
        Arc::new(Self {
            logger,
            state: Mutex::new(PoolState::default()),
            connectors: ConnectorRegistry::new(),
            adapter,
            ports,
            timeout_secs,
            failover,
            last_data_file,
        })
    }

    pub fn dial_timeout(&self) -> Duration {
        if self.timeout_secs > 0 {
            Duration::from_secs(self.timeout_secs)
        } else {
            Duration::ZERO
        }
    }

    /// Pick the endpoint for one dispatch attempt: round-robin by default,
    /// pinned to the cursor in failover mode.
    pub fn select_for_dispatch(&self) -> Option<Endpoint> {
        let mut state = self.state.lock().unwrap();
        if state.effective_len() == 0 {
            log_error!(self.logger, "no proxies left, rerun after refreshing sources");
            return None;
        }
        if state.effective_len() <= 2 {
            log_warn!(
                self.logger,
                "only {} proxies left: {:?}",
                state.effective_len(),
                state.effective_raw()
            );
        }
        if self.failover {
            state.current_endpoint()
        } else {
            state.next_endpoint()
        }
    }

    pub fn evict(&self, endpoint: &Endpoint) {
        self.state.lock().unwrap().evict(endpoint);
    }

    pub fn advance_cursor(&self) {
        self.state.lock().unwrap().advance_cursor();
    }

    /// Cursor advance driven by the keyboard switch; reports the new current
    /// endpoint as (raw, 1-based index, total).
    pub fn switch_to_next(&self) -> Option<(String, usize, usize)> {
        let mut state = self.state.lock().unwrap();
        state.advance_cursor();
        let endpoint = state.current_endpoint()?;
        Some((endpoint.raw, state.cursor() + 1, state.effective_len()))
    }

    pub fn effective_len(&self) -> usize {
        self.state.lock().unwrap().effective_len()
    }

    pub fn effective_snapshot(&self) -> Vec<String> {
        self.state.lock().unwrap().effective_snapshot()
    }

    pub fn raw_snapshot(&self) -> Vec<String> {
        self.state.lock().unwrap().raw_list.clone()
    }

    pub fn replace_raw_list(&self, lines: Vec<String>) {
        self.state.lock().unwrap().raw_list = lines;
    }

    pub async fn connector_for(&self, endpoint: &Endpoint) -> anyhow::Result<Arc<Connector>> {
        self.connectors
            .get_or_create(&self.adapter, &self.ports, &self.logger, endpoint)
            .await
    }
}
