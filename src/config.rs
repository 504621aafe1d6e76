use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Top-level TOML configuration. Every section is optional in the file;
/// missing sections deserialize to their zero values, mirroring the way the
/// upstream discovery switches default to "off".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub task: TaskConfig,
    #[serde(rename = "checkSocks")]
    pub check_socks: CheckSocksConfig,
    #[serde(rename = "FOFA")]
    pub fofa: FofaConfig,
    #[serde(rename = "QUAKE")]
    pub quake: QuakeConfig,
    #[serde(rename = "HUNTER")]
    pub hunter: HunterConfig,
    pub glider: GliderConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "PORT")]
    pub port: u16,
    #[serde(rename = "userName")]
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Cron expression for re-checking the effective set in place.
    #[serde(rename = "periodicChecking")]
    pub periodic_checking: String,
    /// Cron expression for re-ingesting from all sources and rebuilding.
    #[serde(rename = "periodicGetSocks")]
    pub periodic_get_socks: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CheckSocksConfig {
    #[serde(rename = "checkURL")]
    pub check_url: String,
    #[serde(rename = "checkRspKeywords")]
    pub check_rsp_keywords: String,
    #[serde(rename = "maxConcurrentReq")]
    pub max_concurrent_req: usize,
    /// Probe timeout in seconds; doubles as the dispatch dial timeout.
    pub timeout: u64,
    #[serde(rename = "checkGeolocate")]
    pub check_geolocate: CheckGeolocateConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CheckGeolocateConfig {
    /// "open" enables geolocation classification and replaces the check URL.
    pub switch: String,
    #[serde(rename = "checkURL")]
    pub check_url: String,
    #[serde(rename = "excludeKeywords")]
    pub exclude_keywords: Vec<String>,
    #[serde(rename = "includeKeywords")]
    pub include_keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FofaConfig {
    pub switch: String,
    #[serde(rename = "apiUrl")]
    pub api_url: String,
    pub email: String,
    pub key: String,
    #[serde(rename = "queryString")]
    pub query_string: String,
    #[serde(rename = "resultSize")]
    pub result_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuakeConfig {
    pub switch: String,
    #[serde(rename = "apiUrl")]
    pub api_url: String,
    pub key: String,
    #[serde(rename = "queryString")]
    pub query_string: String,
    #[serde(rename = "resultSize")]
    pub result_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HunterConfig {
    pub switch: String,
    #[serde(rename = "apiUrl")]
    pub api_url: String,
    pub key: String,
    #[serde(rename = "queryString")]
    pub query_string: String,
    #[serde(rename = "resultSize")]
    pub result_size: usize,
}

/// Settings for the external protocol adapter binary. When `bin` is empty the
/// PATH is searched; zero numeric fields fall back to the defaults applied in
/// `adapter::resolve`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GliderConfig {
    pub bin: String,
    pub local_port_start: u16,
    pub local_port_end: u16,
    pub max_connectors: usize,
    pub start_timeout_sec: u64,
    pub max_backoff_sec: u64,
    pub verbose: bool,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Config = toml::from_str(&data)
            .with_context(|| format!("parse config file {}", path.display()))?;
        Ok(config)
    }
}
