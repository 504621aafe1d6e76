use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::header::{REFERER, USER_AGENT};
use tokio::sync::Semaphore;

use crate::config::CheckSocksConfig;
use crate::endpoint::{self, Endpoint, Kind};
use crate::gateway::Gateway;
use crate::{log_info, log_warn};

const PROBE_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36 Edg/112.0.1722.17";
const PROBE_REFERER: &str = "https://www.baidu.com/s?ie=utf-8&wd=ip";

/// Classification rules for one check cycle. With the geolocation switch open
/// the keyword rule is ignored entirely and only the include/exclude lists
/// apply.
struct ProbeRules {
    url: String,
    geolocate: bool,
    keyword: String,
    include: Vec<String>,
    exclude: Vec<String>,
    timeout: Duration,
}

impl ProbeRules {
    fn from_config(cfg: &CheckSocksConfig) -> Self {
        let geolocate = cfg.check_geolocate.switch == "open";
        let url = if geolocate {
            cfg.check_geolocate.check_url.clone()
        } else {
            cfg.check_url.clone()
        };
        Self {
            url,
            geolocate,
            keyword: cfg.check_rsp_keywords.clone(),
            include: cfg.check_geolocate.include_keywords.clone(),
            exclude: cfg.check_geolocate.exclude_keywords.clone(),
            timeout: Duration::from_secs(cfg.timeout),
        }
    }

    fn matches(&self, body: &str) -> bool {
        if !self.geolocate {
            return body.contains(&self.keyword);
        }
        for keyword in &self.exclude {
            if body.contains(keyword) {
                return false;
            }
        }
        for keyword in &self.include {
            if !body.contains(keyword) {
                return false;
            }
        }
        true
    }
}

/// Probe every endpoint built from `lines` with bounded concurrency, then
/// atomically swap the effective set with the survivors (in completion
/// order) and reset the cursor.
pub async fn check_endpoints(gateway: &Arc<Gateway>, cfg: &CheckSocksConfig, lines: &[String]) {
    let start = Instant::now();
    let max_concurrent = cfg.max_concurrent_req.max(1);
    let rules = Arc::new(ProbeRules::from_config(cfg));

    let endpoints = endpoint::build_endpoints(lines, &gateway.logger);
    gateway
        .state
        .lock()
        .unwrap()
        .replace_endpoints(endpoints.clone());

    let total = endpoints.len();
    log_info!(
        gateway.logger,
        "checking {total} proxies, concurrency [ {max_concurrent} ], timeout [ {}s ]",
        cfg.timeout
    );

    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let counter = Arc::new(AtomicUsize::new(0));
    let survivors: Arc<Mutex<Vec<Endpoint>>> = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::with_capacity(total);
    for ep in endpoints {
        ep.ensure_dialer(cfg.timeout);
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let gateway = gateway.clone();
        let rules = rules.clone();
        let counter = counter.clone();
        let survivors = survivors.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            probe_one(&gateway, ep, &rules, &counter, total, &survivors).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let survivors = std::mem::take(&mut *survivors.lock().unwrap());
    let usable = survivors.len();
    gateway.state.lock().unwrap().replace_effective(survivors);

    let secs = start.elapsed().as_secs().max(1);
    gateway.logger.progress_done();
    log_info!(gateway.logger, "check finished in [ {secs}s ], [ {usable} ] proxies usable");
}

async fn probe_one(
    gateway: &Arc<Gateway>,
    endpoint: Endpoint,
    rules: &ProbeRules,
    counter: &AtomicUsize,
    total: usize,
    survivors: &Mutex<Vec<Endpoint>>,
) {
    let num = counter.fetch_add(1, Ordering::SeqCst) + 1;
    gateway
        .logger
        .progress(&format!("checking proxy [ {num}/{total} ]...                    "));

    // Probe through the endpoint itself for socks5, through its adapter
    // connector otherwise.
    let proxy_addr = match endpoint.kind {
        Kind::Socks5 => endpoint.host_port(),
        _ => {
            if !gateway.adapter.enabled() {
                return;
            }
            match gateway.connector_for(&endpoint).await {
                Ok(connector) => format!("127.0.0.1:{}", connector.port),
                Err(err) => {
                    log_warn!(
                        gateway.logger,
                        "connector failed, skipping endpoint {}: {err:#}",
                        endpoint.raw
                    );
                    return;
                }
            }
        }
    };

    let Ok(proxy) = reqwest::Proxy::all(format!("socks5h://{proxy_addr}")) else {
        return;
    };
    let mut builder = reqwest::Client::builder()
        .proxy(proxy)
        .danger_accept_invalid_certs(true);
    if !rules.timeout.is_zero() {
        builder = builder.timeout(rules.timeout);
    }
    let Ok(client) = builder.build() else {
        return;
    };

    let response = match client
        .get(&rules.url)
        .header(USER_AGENT, PROBE_UA)
        .header(REFERER, PROBE_REFERER)
        .send()
        .await
    {
        Ok(response) => response,
        Err(_) => return,
    };
    let body = match response.text().await {
        Ok(body) => body,
        Err(_) => return,
    };

    if rules.matches(&body) {
        survivors.lock().unwrap().push(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckGeolocateConfig;
    use crate::gateway::test_support::quiet_gateway;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Fake SOCKS5 proxy that accepts CONNECT and then answers any HTTP
    /// request with a canned body.
    async fn socks5_with_http_body(body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut head = [0u8; 2];
                    stream.read_exact(&mut head).await.unwrap();
                    let mut methods = vec![0u8; head[1] as usize];
                    stream.read_exact(&mut methods).await.unwrap();
                    stream.write_all(&[0x05, 0x00]).await.unwrap();

                    let mut request = [0u8; 4];
                    stream.read_exact(&mut request).await.unwrap();
                    match request[3] {
                        0x01 => {
                            let mut rest = [0u8; 6];
                            stream.read_exact(&mut rest).await.unwrap();
                        }
                        0x03 => {
                            let mut len = [0u8; 1];
                            stream.read_exact(&mut len).await.unwrap();
                            let mut rest = vec![0u8; len[0] as usize + 2];
                            stream.read_exact(&mut rest).await.unwrap();
                        }
                        _ => return,
                    }
                    stream
                        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();

                    // Swallow the HTTP request head, then answer.
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(reply.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn check_config(keyword: &str) -> CheckSocksConfig {
        CheckSocksConfig {
            check_url: "http://probe.example/ip".to_string(),
            check_rsp_keywords: keyword.to_string(),
            max_concurrent_req: 4,
            timeout: 3,
            check_geolocate: CheckGeolocateConfig::default(),
        }
    }

    #[tokio::test]
    async fn keeps_matching_and_drops_dead() {
        let gateway = quiet_gateway(false, 3);
        let good = socks5_with_http_body("your ip is 203.0.113.9").await;
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            addr
        };
        let lines = vec![good.to_string(), dead.to_string()];
        check_endpoints(&gateway, &check_config("203.0.113.9"), &lines).await;

        assert_eq!(gateway.effective_snapshot(), vec![good.to_string()]);
        assert_eq!(gateway.state.lock().unwrap().cursor(), 0);
    }

    #[tokio::test]
    async fn keyword_mismatch_rejects() {
        let gateway = quiet_gateway(false, 3);
        let upstream = socks5_with_http_body("some other page").await;
        let lines = vec![upstream.to_string()];
        check_endpoints(&gateway, &check_config("expected-keyword"), &lines).await;
        assert_eq!(gateway.effective_len(), 0);
    }

    #[tokio::test]
    async fn geolocation_rules_override_keyword() {
        let gateway = quiet_gateway(false, 3);
        let upstream = socks5_with_http_body(r#"{"country":"NL","ip":"203.0.113.9"}"#).await;
        let mut cfg = check_config("never-present");
        cfg.check_geolocate = CheckGeolocateConfig {
            switch: "open".to_string(),
            check_url: "http://geo.example/json".to_string(),
            exclude_keywords: vec!["\"country\":\"CN\"".to_string()],
            include_keywords: vec!["\"country\":\"NL\"".to_string()],
        };
        let lines = vec![upstream.to_string()];
        check_endpoints(&gateway, &cfg, &lines).await;
        // The keyword never matches, but geolocation mode ignores it.
        assert_eq!(gateway.effective_len(), 1);
    }

    #[tokio::test]
    async fn exclude_keyword_rejects() {
        let gateway = quiet_gateway(false, 3);
        let upstream = socks5_with_http_body(r#"{"country":"CN"}"#).await;
        let mut cfg = check_config("");
        cfg.check_geolocate = CheckGeolocateConfig {
            switch: "open".to_string(),
            check_url: "http://geo.example/json".to_string(),
            exclude_keywords: vec!["\"country\":\"CN\"".to_string()],
            include_keywords: Vec::new(),
        };
        check_endpoints(&gateway, &cfg, &[upstream.to_string()]).await;
        assert_eq!(gateway.effective_len(), 0);
    }

    #[tokio::test]
    async fn serialized_probing_still_completes() {
        let gateway = quiet_gateway(false, 3);
        let a = socks5_with_http_body("pool-ok").await;
        let b = socks5_with_http_body("pool-ok").await;
        let mut cfg = check_config("pool-ok");
        cfg.max_concurrent_req = 1;
        let lines = vec![a.to_string(), b.to_string()];
        check_endpoints(&gateway, &cfg, &lines).await;
        assert_eq!(gateway.effective_len(), 2);
    }
}
