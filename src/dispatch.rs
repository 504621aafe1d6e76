use std::sync::Arc;

use anyhow::anyhow;
use tokio::net::TcpStream;

use crate::dialer;
use crate::endpoint::{Endpoint, Kind};
use crate::gateway::Gateway;
use crate::log_info;
use crate::log_warn;

/// Upper bound on per-connection retries before the failure surfaces to the
/// SOCKS5 client.
const MAX_DIAL_ATTEMPTS: usize = 10;

/// The per-connection dial hook. Rotation mode advances the cursor on every
/// connection and evicts endpoints whose dial fails; failover mode stays
/// pinned to the cursor and only advances (without evicting) on failure.
///
/// The last per-endpoint failure stays in the returned error chain so the
/// listener can map it to a SOCKS5 reply code.
pub async fn dispatch(
    gateway: &Arc<Gateway>,
    network: &str,
    addr: &str,
) -> anyhow::Result<TcpStream> {
    let mut last_err: Option<anyhow::Error> = None;
    for _ in 0..MAX_DIAL_ATTEMPTS {
        let Some(endpoint) = gateway.select_for_dispatch() else {
            return Err(surface(last_err, "no proxies available".to_string()));
        };
        log_info!(gateway.logger, "{}", endpoint.display());

        let socks_addr = match endpoint.kind {
            Kind::Socks5 => endpoint.host_port(),
            _ => match gateway.connector_for(&endpoint).await {
                Ok(connector) => format!("127.0.0.1:{}", connector.port),
                Err(err) => {
                    note_failure(gateway, &endpoint, &format!("connector error: {err:#}"));
                    last_err = Some(err);
                    continue;
                }
            },
        };

        endpoint.ensure_dialer(gateway.timeout_secs);
        match dialer::dial_endpoint(&endpoint, &socks_addr, network, addr, gateway.dial_timeout())
            .await
        {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                note_failure(gateway, &endpoint, &format!("{err:#}"));
                last_err = Some(err);
            }
        }
    }
    Err(surface(
        last_err,
        format!("all proxies failed after {MAX_DIAL_ATTEMPTS} attempts"),
    ))
}

fn surface(last_err: Option<anyhow::Error>, msg: String) -> anyhow::Error {
    match last_err {
        Some(err) => err.context(msg),
        None => anyhow!(msg),
    }
}

fn note_failure(gateway: &Arc<Gateway>, endpoint: &Endpoint, reason: &str) {
    if gateway.failover {
        log_warn!(
            gateway.logger,
            "{} failed ({reason}), moving to the next proxy",
            endpoint.display()
        );
        gateway.advance_cursor();
    } else {
        log_warn!(
            gateway.logger,
            "{} is invalid ({reason}), dropping it and switching",
            endpoint.display()
        );
        gateway.evict(endpoint);
    }
}
