use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail, ensure};
use hickory_proto::op::Message;
use ip_network::Ipv4Network;
use russh::client::{self, AuthResult, Handle};
use serde::Deserialize;
use tokio::io::AsyncReadExt as _;
use tokio::sync::Mutex;

use crate::codec;
use crate::dns::DNS_PORT;
use crate::pipes::Pipes;
use crate::protocol::{Capabilities, Protocol, TcpConn};
use crate::transfer;

const RECONNECT_LIMIT: u32 = 2;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Asks the remote host (macOS) for its first configured nameserver.
const DISCOVER_COMMAND: &str =
    r#"scutil --dns | grep "nameserver\[.\]" | awk '{print $3}' | head -n 1"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub user: String,
    pub password: String,
    /// SSH server, `host` or `host:port` (defaults to port 22).
    pub host: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub ips: Vec<Ipv4Network>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    /// Discover the remote nameserver via `scutil` when `dns` is empty.
    #[serde(default)]
    pub discover_dns: bool,
}

/// Tunnels TCP over SSH `direct-tcpip` channels; resolves DNS through a
/// forwarded TCP connection to the remote-side nameserver.
///
/// UDP is not supported over this transport, and the capability mask says so.
pub struct SshProtocol {
    addr: String,
    user: String,
    password: String,
    domains: Vec<String>,
    fixed: Vec<Ipv4Network>,
    dns_servers: Vec<Ipv4Addr>,
    pipes: Arc<Pipes>,
    client: Mutex<Handle<ClientHandler>>,
}

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host-key verification is not part of this adapter's contract.
        Ok(true)
    }
}

impl SshProtocol {
    pub async fn new(cfg: Config, pipes: Arc<Pipes>) -> Result<Self> {
        let addr = if cfg.host.contains(':') {
            cfg.host.clone()
        } else {
            format!("{}:22", cfg.host)
        };

        let mut handle = connect(&addr, &cfg.user, &cfg.password)
            .await
            .context("Failed to establish SSH session")?;

        let mut dns_servers = cfg.dns.clone();

        if dns_servers.is_empty() && cfg.discover_dns {
            match discover_nameserver(&mut handle).await {
                Ok(Some(server)) => {
                    tracing::info!(%server, "Discovered remote nameserver");
                    dns_servers.push(server);
                }
                Ok(None) => tracing::warn!("Remote host reported no nameserver"),
                Err(e) => tracing::warn!("Nameserver discovery failed: {e:#}"),
            }
        }

        let domains = if cfg.domain.is_empty() {
            Vec::new()
        } else {
            vec![cfg.domain]
        };

        Ok(Self {
            addr,
            user: cfg.user,
            password: cfg.password,
            domains,
            fixed: cfg.ips,
            dns_servers,
            pipes,
            client: Mutex::new(handle),
        })
    }

    /// Opens a forwarding channel, re-dialling the SSH session on failure:
    /// at most two reconnects with a one-second backoff.
    async fn dial(&self, target: SocketAddrV4) -> Result<russh::ChannelStream<client::Msg>> {
        let mut attempt = 0;

        loop {
            {
                let mut client = self.client.lock().await;

                match client
                    .channel_open_direct_tcpip(
                        target.ip().to_string(),
                        u32::from(target.port()),
                        "127.0.0.1",
                        0,
                    )
                    .await
                {
                    Ok(channel) => return Ok(channel.into_stream()),
                    Err(e) if attempt >= RECONNECT_LIMIT => {
                        return Err(anyhow::Error::new(e)
                            .context("Failed to open SSH forwarding channel"));
                    }
                    Err(e) => {
                        tracing::warn!(dest = %target, "SSH channel failed, reconnecting: {e}");
                    }
                }
            }

            attempt += 1;
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            self.reconnect().await?;
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.client.lock().await;

        *guard = connect(&self.addr, &self.user, &self.password)
            .await
            .context("Failed to re-establish SSH session")?;

        tracing::info!(server = %self.addr, "SSH session re-established");

        Ok(())
    }
}

async fn connect(addr: &str, user: &str, password: &str) -> Result<Handle<ClientHandler>> {
    let config = Arc::new(client::Config::default());

    let mut handle = client::connect(config, addr, ClientHandler)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;

    match handle.authenticate_password(user, password).await? {
        AuthResult::Success => Ok(handle),
        AuthResult::Failure { .. } => bail!("SSH authentication rejected"),
    }
}

async fn discover_nameserver(handle: &mut Handle<ClientHandler>) -> Result<Option<Ipv4Addr>> {
    #[allow(unused_mut)]
    let mut channel = handle
        .channel_open_session()
        .await
        .context("Failed to open session channel")?;

    channel
        .exec(true, DISCOVER_COMMAND)
        .await
        .context("Failed to execute discovery command")?;

    let mut output = String::new();
    let mut stream = channel.into_stream();

    tokio::time::timeout(DISCOVER_TIMEOUT, stream.read_to_string(&mut output))
        .await
        .context("Timed out reading discovery output")?
        .context("Failed to read discovery output")?;

    let line = output.lines().next().unwrap_or("").trim();

    if line.is_empty() {
        return Ok(None);
    }

    let server = line
        .parse()
        .with_context(|| format!("Remote nameserver `{line}` is not an IPv4 address"))?;

    Ok(Some(server))
}

#[async_trait::async_trait]
impl Protocol for SshProtocol {
    fn name(&self) -> &'static str {
        "SSH"
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
        ensure!(
            !self.dns_servers.is_empty(),
            "no nameserver configured for the SSH resolver"
        );

        for server in &self.dns_servers {
            let target = SocketAddrV4::new(*server, DNS_PORT);

            let mut stream = match self.dial(target).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(%server, "Failed to reach nameserver over SSH: {e:#}");
                    continue;
                }
            };

            match exchange(&mut stream, &query).await {
                Ok(response) if !response.answers().is_empty() => return Ok(response),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(%server, "DNS exchange over SSH failed: {e:#}");
                    continue;
                }
            }
        }

        bail!("no upstream nameserver produced answers")
    }

    async fn handle_tcp(&self, conn: TcpConn) -> Result<()> {
        let target = conn.local_addr();

        tracing::info!(dest = %target, "Handling TCP connection");

        let upstream = self
            .dial(target)
            .await
            .context("Failed to connect to remote host")?;

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
