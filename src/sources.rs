use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use reqwest::header::USER_AGENT;
use serde::Deserialize;

use crate::config::{Config, FofaConfig, HunterConfig, QuakeConfig};
use crate::endpoint;
use crate::gateway::Gateway;
use crate::logger::Logger;
use crate::{log_info, log_warn};

pub const DEFAULT_LAST_DATA_FILE: &str = "lastData.txt";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36 Edg/112.0.1722.17";

const SWITCH_OPEN: &str = "open";

/// Read raw endpoint lines from the last-data file. Comments and blank lines
/// are dropped here; a missing file is not an error.
pub fn read_lines_from_file(path: &std::path::Path, logger: &Logger) -> Vec<String> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) => {
            log_warn!(logger, "read {} failed: {err}", path.display());
            return Vec::new();
        }
    };
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Persist the current effective set, one raw per line, for the next start.
pub fn write_lines_to_file(gateway: &Gateway) -> anyhow::Result<()> {
    let lines = gateway.effective_snapshot();
    let file = fs::File::create(&gateway.last_data_file)
        .with_context(|| format!("create {}", gateway.last_data_file.display()))?;
    let mut writer = BufWriter::new(file);
    for line in &lines {
        if line.trim().is_empty() {
            continue;
        }
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Drop duplicate raw lines, keeping the first occurrence of each.
pub fn remove_duplicates(list: &mut Vec<String>) {
    let mut seen = HashSet::new();
    list.retain(|line| seen.insert(line.clone()));
}

/// Refill the raw list from the last-data file and, when enabled, the remote
/// discovery sources; dedup and rebuild the endpoint slice.
pub async fn collect_sources(gateway: &Arc<Gateway>, config: &Config, include_remote: bool) {
    let mut lines = read_lines_from_file(&gateway.last_data_file, &gateway.logger);

    if include_remote {
        let (fofa, hunter, quake) = tokio::join!(
            fetch_fofa(&config.fofa, &gateway.logger),
            fetch_hunter(&config.hunter, &gateway.logger),
            fetch_quake(&config.quake, &gateway.logger),
        );
        lines.extend(fofa);
        lines.extend(hunter);
        lines.extend(quake);
    }

    remove_duplicates(&mut lines);

    let endpoints = endpoint::build_endpoints(&lines, &gateway.logger);
    let mut state = gateway.state.lock().unwrap();
    state.raw_list = lines;
    state.replace_endpoints(endpoints);
}

fn insecure_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("build http client")
}

// --- FOFA ---

#[derive(Debug, Deserialize)]
struct FofaResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

async fn fetch_fofa(cfg: &FofaConfig, logger: &Logger) -> Vec<String> {
    if cfg.switch != SWITCH_OPEN {
        return Vec::new();
    }
    match fetch_fofa_inner(cfg).await {
        Ok(lines) => {
            log_info!(logger, "FOFA returned {} proxies", lines.len());
            lines
        }
        Err(err) => {
            log_warn!(logger, "FOFA fetch failed: {err:#}");
            Vec::new()
        }
    }
}

async fn fetch_fofa_inner(cfg: &FofaConfig) -> anyhow::Result<Vec<String>> {
    let client = insecure_client()?;
    let qbase64 = STANDARD.encode(&cfg.query_string);
    let body = client
        .get(&cfg.api_url)
        .query(&[
            ("email", cfg.email.as_str()),
            ("key", cfg.key.as_str()),
            ("qbase64", qbase64.as_str()),
            ("size", &cfg.result_size.to_string()),
            ("fields", "host"),
        ])
        .header(USER_AGENT, FETCH_UA)
        .send()
        .await?
        .text()
        .await?;
    parse_fofa_body(&body)
}

fn parse_fofa_body(body: &str) -> anyhow::Result<Vec<String>> {
    let response: FofaResponse = serde_json::from_str(body).context("parse FOFA response")?;
    if response.error {
        anyhow::bail!("FOFA error: {}", response.errmsg);
    }
    let mut lines = Vec::new();
    for row in response.results {
        match row {
            serde_json::Value::String(host) if !host.is_empty() => lines.push(host),
            serde_json::Value::Array(fields) => {
                let mut parts = fields.iter().filter_map(value_to_string);
                if let (Some(ip), Some(port)) = (parts.next(), parts.next()) {
                    lines.push(format!("{ip}:{port}"));
                }
            }
            _ => {}
        }
    }
    Ok(lines)
}

// --- HUNTER ---

#[derive(Debug, Deserialize)]
struct HunterResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: HunterData,
}

#[derive(Debug, Default, Deserialize)]
struct HunterData {
    #[serde(default)]
    arr: Vec<HunterEntry>,
}

#[derive(Debug, Deserialize)]
struct HunterEntry {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    port: serde_json::Value,
}

async fn fetch_hunter(cfg: &HunterConfig, logger: &Logger) -> Vec<String> {
    if cfg.switch != SWITCH_OPEN {
        return Vec::new();
    }
    match fetch_hunter_inner(cfg).await {
        Ok(lines) => {
            log_info!(logger, "HUNTER returned {} proxies", lines.len());
            lines
        }
        Err(err) => {
            log_warn!(logger, "HUNTER fetch failed: {err:#}");
            Vec::new()
        }
    }
}

async fn fetch_hunter_inner(cfg: &HunterConfig) -> anyhow::Result<Vec<String>> {
    let client = insecure_client()?;
    let search = URL_SAFE.encode(&cfg.query_string);
    let body = client
        .get(&cfg.api_url)
        .query(&[
            ("api-key", cfg.key.as_str()),
            ("search", search.as_str()),
            ("page", "1"),
            ("page_size", &cfg.result_size.to_string()),
        ])
        .header(USER_AGENT, FETCH_UA)
        .send()
        .await?
        .text()
        .await?;
    parse_hunter_body(&body)
}

fn parse_hunter_body(body: &str) -> anyhow::Result<Vec<String>> {
    let response: HunterResponse = serde_json::from_str(body).context("parse HUNTER response")?;
    if response.code != 200 {
        anyhow::bail!("HUNTER error {}: {}", response.code, response.message);
    }
    Ok(response
        .data
        .arr
        .iter()
        .filter_map(|entry| {
            let port = value_to_string(&entry.port)?;
            if entry.ip.is_empty() {
                return None;
            }
            Some(format!("{}:{}", entry.ip, port))
        })
        .collect())
}

// --- QUAKE ---

#[derive(Debug, Deserialize)]
struct QuakeResponse {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Vec<QuakeEntry>,
}

#[derive(Debug, Deserialize)]
struct QuakeEntry {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    port: serde_json::Value,
}

async fn fetch_quake(cfg: &QuakeConfig, logger: &Logger) -> Vec<String> {
    if cfg.switch != SWITCH_OPEN {
        return Vec::new();
    }
    match fetch_quake_inner(cfg).await {
        Ok(lines) => {
            log_info!(logger, "QUAKE returned {} proxies", lines.len());
            lines
        }
        Err(err) => {
            log_warn!(logger, "QUAKE fetch failed: {err:#}");
            Vec::new()
        }
    }
}

async fn fetch_quake_inner(cfg: &QuakeConfig) -> anyhow::Result<Vec<String>> {
    let client = insecure_client()?;
    let body = client
        .post(&cfg.api_url)
        .header("X-QuakeToken", &cfg.key)
        .header(USER_AGENT, FETCH_UA)
        .json(&serde_json::json!({
            "query": cfg.query_string,
            "start": 0,
            "size": cfg.result_size,
        }))
        .send()
        .await?
        .text()
        .await?;
    parse_quake_body(&body)
}

fn parse_quake_body(body: &str) -> anyhow::Result<Vec<String>> {
    let response: QuakeResponse = serde_json::from_str(body).context("parse QUAKE response")?;
    let code_ok = matches!(
        &response.code,
        serde_json::Value::Number(n) if n.as_i64() == Some(0)
    );
    if !code_ok {
        anyhow::bail!("QUAKE error {}: {}", response.code, response.message);
    }
    Ok(response
        .data
        .iter()
        .filter_map(|entry| {
            let port = value_to_string(&entry.port)?;
            if entry.ip.is_empty() {
                return None;
            }
            Some(format!("{}:{}", entry.ip, port))
        })
        .collect())
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
