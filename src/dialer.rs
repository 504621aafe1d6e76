use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::endpoint::Endpoint;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(8);

/// Per-endpoint dial capability: a plain TCP dialer plus the SOCKS5 client
/// handshake toward whatever loopback or upstream SOCKS5 address the caller
/// resolved for the endpoint.
#[derive(Debug)]
pub struct SocksDialer {
    timeout: Duration,
    relay_timeout: Duration,
    auth: Option<(String, String)>,
}

impl SocksDialer {
    pub fn new(timeout_secs: u64, auth: Option<(String, String)>) -> Self {
        let timeout = if timeout_secs > 0 {
            Duration::from_secs(timeout_secs)
        } else {
            DEFAULT_DIAL_TIMEOUT
        };
        Self {
            timeout,
            relay_timeout: timeout + Duration::from_secs(2),
            auth,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read timeout applied to the relayed connection after a successful dial.
    pub fn relay_timeout(&self) -> Duration {
        self.relay_timeout
    }

    /// Connect to `socks_addr` and issue a SOCKS5 CONNECT for `target`
    /// (`host:port`).
    pub async fn dial_through(
        &self,
        socks_addr: &str,
        network: &str,
        target: &str,
    ) -> anyhow::Result<TcpStream> {
        if network != "tcp" {
            bail!("unsupported network {network:?}");
        }

        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(socks_addr))
            .await
            .map_err(|_| anyhow!("connect {socks_addr} timed out"))?
            .with_context(|| format!("connect {socks_addr}"))?;

        // Greeting
        let mut methods = vec![0x00u8];
        if self.auth.is_some() {
            methods.push(0x02);
        }
        stream.write_all(&[0x05, methods.len() as u8]).await?;
        stream.write_all(&methods).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.context("socks greeting reply")?;
        if reply[0] != 0x05 {
            bail!("invalid SOCKS version {}", reply[0]);
        }
        match reply[1] {
            0x00 => {}
            0x02 => {
                let (user, pass) = self
                    .auth
                    .as_ref()
                    .ok_or_else(|| anyhow!("proxy requires auth but no credentials"))?;
                userpass_auth(&mut stream, user, pass).await?;
            }
            0xFF => bail!("no acceptable auth methods"),
            m => bail!("unsupported auth method {m:#x}"),
        }

        // CONNECT
        let (host, port) = split_host_port(target)?;
        let mut request = vec![0x05u8, 0x01, 0x00];
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            request.push(0x01);
            request.extend_from_slice(&v4.octets());
        } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
            request.push(0x04);
            request.extend_from_slice(&v6.octets());
        } else {
            let bytes = host.as_bytes();
            if bytes.len() > 255 {
                bail!("domain too long for SOCKS5");
            }
            request.push(0x03);
            request.push(bytes.len() as u8);
            request.extend_from_slice(bytes);
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.context("socks reply header")?;
        if header[0] != 0x05 {
            bail!("invalid SOCKS version in reply {}", header[0]);
        }
        if header[1] != 0x00 {
            bail!("SOCKS CONNECT failed, REP={:#x}", header[1]);
        }
        match header[3] {
            0x01 => {
                let mut bound = [0u8; 4 + 2];
                stream.read_exact(&mut bound).await?;
            }
            0x04 => {
                let mut bound = [0u8; 16 + 2];
                stream.read_exact(&mut bound).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut bound = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut bound).await?;
            }
            atyp => bail!("unknown ATYP in reply {atyp}"),
        }

        Ok(stream)
    }
}

async fn userpass_auth(stream: &mut TcpStream, user: &str, pass: &str) -> anyhow::Result<()> {
    let user_bytes = user.as_bytes();
    let pass_bytes = pass.as_bytes();
    if user_bytes.len() > 255 || pass_bytes.len() > 255 {
        bail!("username/password too long");
    }
    let mut request = Vec::with_capacity(3 + user_bytes.len() + pass_bytes.len());
    request.push(0x01);
    request.push(user_bytes.len() as u8);
    request.extend_from_slice(user_bytes);
    request.push(pass_bytes.len() as u8);
    request.extend_from_slice(pass_bytes);

    stream.write_all(&request).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x01 || reply[1] != 0x00 {
        bail!("SOCKS auth rejected");
    }
    Ok(())
}

pub fn split_host_port(target: &str) -> anyhow::Result<(String, u16)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid IPv6 address {target:?}"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port in {target:?}"))?
            .parse()
            .with_context(|| format!("invalid port in {target:?}"))?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in {target:?}"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {target:?}"))?;
    Ok((host.to_string(), port))
}

/// Run the endpoint's dialer against a timer. Dropping the dial future on
/// timeout closes any half-open connection.
pub async fn dial_endpoint(
    endpoint: &Endpoint,
    socks_addr: &str,
    network: &str,
    addr: &str,
    timeout: Duration,
) -> anyhow::Result<TcpStream> {
    let dialer = endpoint
        .dialer()
        .ok_or_else(|| anyhow!("endpoint {} has no dialer attached", endpoint.display()))?;

    let timeout = if timeout.is_zero() {
        dialer.timeout()
    } else {
        timeout
    };

    match tokio::time::timeout(timeout, dialer.dial_through(socks_addr, network, addr)).await {
        Ok(result) => result,
        Err(_) => bail!(
            "dial {addr} via {} timed out after {timeout:?}",
            endpoint.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal in-test SOCKS5 server: accepts one client, answers no-auth and
    /// a successful CONNECT, then echoes one buffer.
    async fn fake_socks5_once() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
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
                _ => panic!("unexpected ATYP"),
            }
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn connects_through_socks5() {
        let addr = fake_socks5_once().await;
        let dialer = SocksDialer::new(2, None);
        let mut stream = dialer
            .dial_through(&addr.to_string(), "tcp", "target.example.com:80")
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn refused_connection_errors() {
        let dialer = SocksDialer::new(1, None);
        // Grab a port and close the listener so nothing is there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = dialer
            .dial_through(&addr.to_string(), "tcp", "target.example.com:80")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn silent_server_hits_dial_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Keep the listener open but never answer the handshake.
        let endpoint =
            crate::endpoint::parse_line(&addr.to_string(), &crate::logger::Logger::new(crate::logger::LogLevel::None, false))
                .unwrap()
                .unwrap();
        endpoint.ensure_dialer(1);
        let result = dial_endpoint(
            &endpoint,
            &addr.to_string(),
            "tcp",
            "target.example.com:80",
            Duration::from_millis(200),
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        drop(listener);
    }

    #[tokio::test]
    async fn missing_dialer_is_reported() {
        let endpoint = crate::endpoint::parse_line(
            "1.2.3.4:1080",
            &crate::logger::Logger::new(crate::logger::LogLevel::None, false),
        )
        .unwrap()
        .unwrap();
        let err = dial_endpoint(&endpoint, "1.2.3.4:1080", "tcp", "x:80", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no dialer"));
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(
            split_host_port("example.com:8080").unwrap(),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            split_host_port("[::1]:443").unwrap(),
            ("::1".to_string(), 443)
        );
        assert!(split_host_port("no-port").is_err());
    }
}
