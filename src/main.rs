#![allow(dead_code)]

mod adapter;
mod checker;
mod config;
mod connector;
mod dialer;
mod dispatch;
mod endpoint;
mod gateway;
mod logger;
mod ports;
mod socks5;
mod sources;
mod state;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncBufReadExt;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::logger::{LogLevel, Logger};
use crate::socks5::Socks5Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "poolgate", version, about = "Proxy-pool gateway: one local SOCKS5 listener in front of many checked upstreams")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Last-data file path; a non-default path disables remote discovery
    #[arg(short, long, default_value = sources::DEFAULT_LAST_DATA_FILE)]
    lastdata: PathBuf,

    /// Failover dispatch mode: switch proxies only when the current one fails
    #[arg(short, long)]
    failover: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = start(args).await {
        exit(err);
    }
}

async fn start(args: Args) -> anyhow::Result<()> {
    let logger = Logger::new(LogLevel::Info, true);
    log_info!(logger, "poolgate {VERSION} starting");
    if args.failover {
        log_info!(
            logger,
            "failover mode enabled: proxies switch only when the current one fails"
        );
    }

    let config = Config::load(&args.config)?;

    // Reject broken cron expressions before doing any network work.
    let checking_schedule = parse_task_schedule(&config.task.periodic_checking)
        .context("task.periodicChecking")?;
    let ingest_schedule = parse_task_schedule(&config.task.periodic_get_socks)
        .context("task.periodicGetSocks")?;

    let adapter = adapter::resolve(&config.glider, &logger);
    let gateway = Gateway::new(
        logger.clone(),
        adapter,
        config.check_socks.timeout,
        args.failover,
        args.lastdata.clone(),
    );
    let config = Arc::new(config);

    // A custom last-data path means "use exactly this list", skipping the
    // remote discovery sources.
    let include_remote = args.lastdata == Path::new(sources::DEFAULT_LAST_DATA_FILE);
    sources::collect_sources(&gateway, &config, include_remote).await;

    let discovered = gateway.raw_snapshot().len();
    if discovered == 0 {
        anyhow::bail!(
            "no proxy data discovered; adjust the config or write host:port lines into {}",
            gateway.last_data_file.display()
        );
    }
    log_info!(logger, "found {discovered} unique proxies, checking availability...");
    let raw_lines = gateway.raw_snapshot();
    checker::check_endpoints(&gateway, &config.check_socks, &raw_lines).await;

    if let Some(schedule) = checking_schedule {
        let gateway = gateway.clone();
        let config = config.clone();
        spawn_cron(schedule, move || {
            let gateway = gateway.clone();
            let config = config.clone();
            async move {
                log_info!(gateway.logger, "=== periodic proxy re-check started ===");
                let snapshot = gateway.effective_snapshot();
                checker::check_endpoints(&gateway, &config.check_socks, &snapshot).await;
                log_info!(gateway.logger, "=== periodic proxy re-check finished ===");
            }
        });
    }

    if let Some(schedule) = ingest_schedule {
        let gateway = gateway.clone();
        let config = config.clone();
        spawn_cron(schedule, move || {
            let gateway = gateway.clone();
            let config = config.clone();
            async move {
                log_info!(gateway.logger, "=== periodic proxy refetch started ===");
                gateway.replace_raw_list(Vec::new());
                sources::collect_sources(&gateway, &config, include_remote).await;
                let lines = gateway.raw_snapshot();
                log_info!(
                    gateway.logger,
                    "found {} unique proxies, checking availability...",
                    lines.len()
                );
                checker::check_endpoints(&gateway, &config.check_socks, &lines).await;
                if gateway.effective_len() != 0 {
                    if let Err(err) = sources::write_lines_to_file(&gateway) {
                        log_error!(gateway.logger, "persist effective proxies failed: {err:#}");
                    }
                }
                log_info!(gateway.logger, "=== periodic proxy refetch finished ===");
            }
        });
    }

    if gateway.effective_len() == 0 {
        anyhow::bail!("no proxies satisfied the check rules; adjust the config");
    }
    if let Err(err) = sources::write_lines_to_file(&gateway) {
        log_error!(logger, "persist effective proxies failed: {err:#}");
    }

    spawn_switch_loop(gateway.clone());
    spawn_shutdown_hook(gateway.clone());

    let server = Socks5Server::new(
        &config.listener.ip,
        config.listener.port,
        &config.listener.user_name,
        &config.listener.password,
        gateway.clone(),
    );
    server.run().await
}

/// Empty expressions disable a task. Plain 5-field cron gets a seconds field
/// prepended, since the parser wants 6.
fn parse_task_schedule(expr: &str) -> anyhow::Result<Option<cron::Schedule>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(None);
    }
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule: cron::Schedule = normalized
        .parse()
        .with_context(|| format!("invalid cron expression {expr:?}"))?;
    Ok(Some(schedule))
}

fn spawn_cron<F, Fut>(schedule: cron::Schedule, task: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(chrono::Local).next() else {
                break;
            };
            let wait = (next - chrono::Local::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            task().await;
        }
    });
}

/// Every newline on stdin advances the cursor and reports the new current
/// proxy.
fn spawn_switch_loop(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        println!("press Enter to switch to the next proxy...");
        while let Ok(Some(_)) = lines.next_line().await {
            match gateway.switch_to_next() {
                Some((raw, index, total)) => {
                    println!("switched to proxy {raw} ({index}/{total})");
                }
                None => println!("no proxies available"),
            }
            println!("press Enter to switch to the next proxy...");
        }
    });
}

fn spawn_shutdown_hook(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            gateway.connectors.cleanup_all().await;
            std::process::exit(0);
        }
    });
}

fn exit(err: anyhow::Error) {
    eprintln!(
        "poolgate-{} {}/{} pid={} error={:#}",
        VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::process::id(),
        err,
    );
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_accepted() {
        let schedule = parse_task_schedule("*/30 * * * *").unwrap();
        assert!(schedule.is_some());
    }

    #[test]
    fn six_field_cron_is_accepted() {
        let schedule = parse_task_schedule("0 */30 * * * *").unwrap();
        assert!(schedule.is_some());
    }

    #[test]
    fn empty_cron_disables_the_task() {
        assert!(parse_task_schedule("").unwrap().is_none());
        assert!(parse_task_schedule("   ").unwrap().is_none());
    }

    #[test]
    fn broken_cron_is_rejected() {
        assert!(parse_task_schedule("not a cron line").is_err());
    }

    #[test]
    fn cli_defaults() {
        let args = Args::parse_from(["poolgate"]);
        assert_eq!(args.config, PathBuf::from("config.toml"));
        assert_eq!(args.lastdata, PathBuf::from("lastData.txt"));
        assert!(!args.failover);
    }

    #[test]
    fn cli_failover_flag() {
        let args = Args::parse_from(["poolgate", "-f", "-c", "/etc/poolgate.toml"]);
        assert!(args.failover);
        assert_eq!(args.config, PathBuf::from("/etc/poolgate.toml"));
    }
}
