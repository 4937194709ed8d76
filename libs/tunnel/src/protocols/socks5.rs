use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail, ensure};
use hickory_proto::op::Message;
use ip_network::Ipv4Network;
use serde::Deserialize;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;

use crate::codec;
use crate::dns::DNS_PORT;
use crate::pipes::Pipes;
use crate::protocol::{Capabilities, Protocol, TcpConn};
use crate::transfer;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const DIAL_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Proxy address, `host:port`.
    pub host: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub ips: Vec<Ipv4Network>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
}

/// Tunnels TCP through a SOCKS5 proxy (RFC 1928, RFC 1929 auth).
pub struct Socks5Protocol {
    proxy: String,
    auth: Option<(String, String)>,
    domains: Vec<String>,
    fixed: Vec<Ipv4Network>,
    dns_servers: Vec<Ipv4Addr>,
    pipes: Arc<Pipes>,
}

impl Socks5Protocol {
    pub fn new(cfg: Config, pipes: Arc<Pipes>) -> Self {
        let auth = (!cfg.user.is_empty() || !cfg.password.is_empty())
            .then(|| (cfg.user.clone(), cfg.password.clone()));

        let domains = if cfg.domain.is_empty() {
            Vec::new()
        } else {
            vec![cfg.domain]
        };

        Self {
            proxy: cfg.host,
            auth,
            domains,
            fixed: cfg.ips,
            dns_servers: cfg.dns,
            pipes,
        }
    }

    async fn dial(&self, target: SocketAddrV4) -> Result<TcpStream> {
        let mut attempt = 0;

        loop {
            match self.try_dial(target).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt >= DIAL_RETRIES => return Err(e),
                Err(e) => {
                    tracing::warn!(dest = %target, proxy = %self.proxy, "Dial failed, retrying: {e:#}");

                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    async fn try_dial(&self, target: SocketAddrV4) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.proxy)
            .await
            .with_context(|| format!("Failed to connect to proxy {}", self.proxy))?;

        self.handshake(&mut stream)
            .await
            .context("SOCKS5 handshake failed")?;
        connect_command(&mut stream, target)
            .await
            .context("SOCKS5 CONNECT failed")?;

        Ok(stream)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        let greeting: &[u8] = match &self.auth {
            Some(_) => &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USER_PASS],
            None => &[SOCKS_VERSION, 1, METHOD_NONE],
        };

        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;

        ensure!(choice[0] == SOCKS_VERSION, "proxy speaks SOCKS{}", choice[0]);

        match choice[1] {
            METHOD_NONE => Ok(()),
            METHOD_USER_PASS => {
                let (user, password) = self
                    .auth
                    .as_ref()
                    .context("proxy requires credentials but none are configured")?;

                ensure!(user.len() <= 255 && password.len() <= 255, "credentials too long");

                let mut request = vec![0x01, user.len() as u8];
                request.extend_from_slice(user.as_bytes());
                request.push(password.len() as u8);
                request.extend_from_slice(password.as_bytes());

                stream.write_all(&request).await?;

                let mut reply = [0u8; 2];
                stream.read_exact(&mut reply).await?;

                ensure!(reply[1] == 0x00, "proxy rejected the credentials");

                Ok(())
            }
            METHOD_UNACCEPTABLE => bail!("proxy accepted none of the offered auth methods"),
            other => bail!("proxy selected unknown auth method {other:#04x}"),
        }
    }
}

async fn connect_command(stream: &mut TcpStream, target: SocketAddrV4) -> Result<()> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());

    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    ensure!(
        header[1] == 0x00,
        "proxy refused the connection (reply {:#04x})",
        header[1]
    );

    // Drain the bound address, its shape depends on the address type.
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;

            usize::from(len[0])
        }
        other => bail!("proxy replied with unknown address type {other:#04x}"),
    };

    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;

    Ok(())
}

#[async_trait::async_trait]
impl Protocol for Socks5Protocol {
    fn name(&self) -> &'static str {
        "SOC"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    fn fixed_ips(&self) -> &[Ipv4Network] {
        &self.fixed
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::resolve_only().with_tcp()
    }

    async fn resolve(&self, query: Message) -> Result<Message> {
        for server in &self.dns_servers {
            let target = SocketAddrV4::new(*server, DNS_PORT);

            let mut stream = match self.dial(target).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%server, "Failed to reach nameserver via proxy: {e:#}");
                    continue;
                }
            };

            match exchange(&mut stream, &query).await {
                Ok(response) if !response.answers().is_empty() => return Ok(response),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(%server, "DNS exchange via proxy failed: {e:#}");
                    continue;
                }
            }
        }

        bail!("no upstream nameserver produced answers")
    }

    async fn handle_tcp(&self, conn: TcpConn) -> Result<()> {
        let target = conn.local_addr();

        let upstream = self
            .dial(target)
            .await
            .context("Failed to connect through the proxy")?;

        tracing::info!(dest = %target, "Handling TCP connection");

        if let Err(e) = transfer::set_keepalive(&upstream) {
            tracing::debug!("Failed to enable keepalive: {e}");
        }

        transfer::splice(
            &self.pipes,
            self.name(),
            target,
            conn.remote_addr(),
            conn,
            upstream,
        )
        .await;

        Ok(())
    }
}

async fn exchange<S>(stream: &mut S, query: &Message) -> Result<Message>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    codec::write_message(stream, query).await?;

    codec::read_message(stream)
        .await?
        .context("nameserver closed the connection without answering")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_proxy_stub(
        listener: tokio::net::TcpListener,
        expect_auth: bool,
    ) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 2];
            stream.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; usize::from(greeting[1])];
            stream.read_exact(&mut methods).await.unwrap();

            if expect_auth {
                stream.write_all(&[0x05, 0x02]).await.unwrap();

                let mut version = [0u8; 1];
                stream.read_exact(&mut version).await.unwrap();
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                let mut user = vec![0u8; usize::from(len[0])];
                stream.read_exact(&mut user).await.unwrap();
                stream.read_exact(&mut len).await.unwrap();
                let mut password = vec![0u8; usize::from(len[0])];
                stream.read_exact(&mut password).await.unwrap();

                stream.write_all(&[0x01, 0x00]).await.unwrap();
            } else {
                stream.write_all(&[0x05, 0x00]).await.unwrap();
            }

            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.unwrap();
            let mut addr = [0u8; 6];
            stream.read_exact(&mut addr).await.unwrap();

            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            // Echo whatever arrives next so the test can verify the stream.
            let mut payload = vec![0u8; 5];
            stream.read_exact(&mut payload).await.unwrap();
            stream.write_all(&payload).await.unwrap();

            addr.to_vec()
        })
    }

    #[tokio::test]
    async fn connects_without_auth() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let stub = run_proxy_stub(listener, false).await;

        let protocol = Socks5Protocol::new(
            Config {
                user: String::new(),
                password: String::new(),
                host: proxy_addr.to_string(),
                domain: String::new(),
                ips: Vec::new(),
                dns: Vec::new(),
            },
            Arc::new(Pipes::new()),
        );

        let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 443);
        let mut stream = protocol.try_dial(target).await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        let connect_addr = stub.await.unwrap();
        assert_eq!(&connect_addr[..4], &[10, 0, 0, 9]);
        assert_eq!(u16::from_be_bytes([connect_addr[4], connect_addr[5]]), 443);
    }

    #[tokio::test]
    async fn negotiates_username_password() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let stub = run_proxy_stub(listener, true).await;

        let protocol = Socks5Protocol::new(
            Config {
                user: "warp".to_owned(),
                password: "secret".to_owned(),
                host: proxy_addr.to_string(),
                domain: String::new(),
                ips: Vec::new(),
                dns: Vec::new(),
            },
            Arc::new(Pipes::new()),
        );

        let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 80);
        let mut stream = protocol.try_dial(target).await.unwrap();

        stream.write_all(b"probe").await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"probe");

        stub.await.unwrap();
    }
}
