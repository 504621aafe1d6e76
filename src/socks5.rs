use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::dispatch;
use crate::gateway::Gateway;
use crate::{log_debug, log_info, log_warn};

const RELAY_BUF_SIZE: usize = 16384;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// The client-facing SOCKS5 listener. Every CONNECT is resolved through the
/// gateway's dispatch hook; with credentials configured, username/password
/// authentication is required with that single pair.
pub struct Socks5Server {
    addr: String,
    auth: Option<(String, String)>,
    gateway: Arc<Gateway>,
}

impl Socks5Server {
    pub fn new(ip: &str, port: u16, user_name: &str, password: &str, gateway: Arc<Gateway>) -> Self {
        let user = user_name.trim();
        let pass = password.trim();
        let auth = if !user.is_empty() && !pass.is_empty() {
            Some((user.to_string(), pass.to_string()))
        } else {
            None
        };
        // An empty listener IP means all interfaces.
        let ip = if ip.is_empty() { "0.0.0.0" } else { ip };
        Self {
            addr: format!("{ip}:{port}"),
            auth,
            gateway,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("bind local listener {}", self.addr))?;
        log_info!(
            self.gateway.logger,
            "clients can now use socks5://{} (remember credentials if configured)",
            self.addr
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let gateway = self.gateway.clone();
            let auth = self.auth.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_client(stream, auth, gateway.clone()).await {
                    log_debug!(gateway.logger, "client {peer}: {err:#}");
                }
            });
        }
    }
}

async fn handle_client<S>(
    mut client: S,
    auth: Option<(String, String)>,
    gateway: Arc<Gateway>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        bail!("unsupported SOCKS version {}", head[0]);
    }
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;

    match &auth {
        Some((user, pass)) => {
            if !methods.contains(&0x02) {
                client.write_all(&[0x05, 0xFF]).await?;
                bail!("client offers no username/password auth");
            }
            client.write_all(&[0x05, 0x02]).await?;
            verify_userpass(&mut client, user, pass).await?;
        }
        None => {
            client.write_all(&[0x05, 0x00]).await?;
        }
    }

    // Request
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[1] != 0x01 {
        reply(&mut client, REP_CMD_NOT_SUPPORTED).await?;
        bail!("unsupported command {:#x}", request[1]);
    }
    let target = match request[3] {
        0x01 => {
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await?;
            let port = read_port(&mut client).await?;
            format!("{}:{port}", std::net::Ipv4Addr::from(buf))
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize];
            client.read_exact(&mut buf).await?;
            let host = String::from_utf8(buf).context("domain is not utf-8")?;
            let port = read_port(&mut client).await?;
            format!("{host}:{port}")
        }
        0x04 => {
            let mut buf = [0u8; 16];
            client.read_exact(&mut buf).await?;
            let port = read_port(&mut client).await?;
            format!("[{}]:{port}", std::net::Ipv6Addr::from(buf))
        }
        atyp => {
            reply(&mut client, REP_ATYP_NOT_SUPPORTED).await?;
            bail!("unsupported address type {atyp}");
        }
    };

    let mut remote = match dispatch::dispatch(&gateway, "tcp", &target).await {
        Ok(remote) => remote,
        Err(err) => {
            log_warn!(gateway.logger, "dispatch for {target} failed: {err:#}");
            reply(&mut client, reply_code_for(&err)).await?;
            return Ok(());
        }
    };
    reply(&mut client, REP_SUCCESS).await?;

    let read_timeout = relay_timeout(&gateway);
    let (tx, rx) = relay(&mut client, &mut remote, read_timeout).await;
    log_debug!(gateway.logger, "{target} relay done TX={tx} RX={rx}");
    Ok(())
}

/// Map a dispatch failure to a SOCKS5 reply: connection-refused dial errors
/// get their own code, everything else is a general failure.
fn reply_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused {
                return REP_CONNECTION_REFUSED;
            }
        }
    }
    REP_GENERAL_FAILURE
}

fn relay_timeout(gateway: &Gateway) -> Duration {
    let dial = gateway.dial_timeout();
    if dial.is_zero() {
        Duration::from_secs(10)
    } else {
        dial + Duration::from_secs(2)
    }
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8) -> anyhow::Result<()> {
    stream
        .write_all(&[0x05, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

async fn verify_userpass<S>(client: &mut S, user: &str, pass: &str) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut user_buf = vec![0u8; head[1] as usize];
    client.read_exact(&mut user_buf).await?;
    let mut len = [0u8; 1];
    client.read_exact(&mut len).await?;
    let mut pass_buf = vec![0u8; len[0] as usize];
    client.read_exact(&mut pass_buf).await?;

    if user_buf == user.as_bytes() && pass_buf == pass.as_bytes() {
        client.write_all(&[0x01, 0x00]).await?;
        Ok(())
    } else {
        client.write_all(&[0x01, 0x01]).await?;
        bail!("bad credentials");
    }
}

/// Pump bytes both ways until either side closes or goes quiet past the read
/// timeout; returns (client→remote, remote→client) byte counts.
async fn relay<A, B>(client: A, remote: B, read_timeout: Duration) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut remote_r, mut remote_w) = tokio::io::split(remote);

    let upstream = async {
        let copied = copy_with_timeout(&mut client_r, &mut remote_w, read_timeout).await;
        let _ = remote_w.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = copy_with_timeout(&mut remote_r, &mut client_w, read_timeout).await;
        let _ = client_w.shutdown().await;
        copied
    };

    let (tx, rx) = tokio::join!(upstream, downstream);
    (tx.unwrap_or(0), rx.unwrap_or(0))
}

async fn copy_with_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = if timeout.is_zero() {
            reader.read(&mut buf).await?
        } else {
            match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read timeout",
                    ))
                }
            }
        };
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
