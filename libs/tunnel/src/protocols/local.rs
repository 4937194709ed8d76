use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use hickory_proto::op::Message;
use serde::Deserialize;
use tokio::net::UdpSocket;

use crate::dns::DNS_PORT;
use crate::protocol::{Capabilities, Protocol};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
}

/// Resolves through the host's original nameservers; carries no traffic.
///
/// With no claimed domain it matches every query, making it the fallback at
/// the end of the protocol list.
pub struct LocalProtocol {
    servers: Vec<Ipv4Addr>,
}

impl LocalProtocol {
    pub fn new(cfg: Config) -> Result<Self> {
        let servers = if cfg.dns.is_empty() {
            system_resolvers().context("Failed to read system resolvers")?
        } else {
            cfg.dns
        };

        if servers.is_empty() {
            bail!("no nameserver available for the local resolver");
        }

        Ok(Self { servers })
    }

    async fn exchange(&self, server: Ipv4Addr, query: &Message) -> Result<Message> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to bind resolver socket")?;
        socket
            .connect((server, DNS_PORT))
            .await
            .context("Failed to connect resolver socket")?;

        socket
            .send(&query.to_vec().context("Failed to encode query")?)
            .await
            .context("Failed to send query")?;

        // On the public Internet, any MTU > 1500 is very unlikely so 2000 is a safe bet.
        let mut buf = vec![0u8; 2000];
        let n = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .context("Upstream resolver timed out")?
            .context("Failed to receive response")?;

        Message::from_vec(&buf[..n]).context("Failed to parse response")
    }
}

/// The nameservers the host was using before we pointed domains at the TUN.
fn system_resolvers() -> Result<Vec<Ipv4Addr>> {
    let contents = std::fs::read("/etc/resolv.conf")?;
    let config = resolv_conf::Config::parse(&contents)?;

    Ok(config
        .nameservers
        .into_iter()
        .filter_map(|ip| match ip {
            resolv_conf::ScopedIp::V4(ip) => Some(ip),
            resolv_conf::ScopedIp::V6(..) => None,
        })
        .collect())
}

#[async_trait::async_trait]
impl Protocol for LocalProtocol {
    fn name(&self) -> &'static str {
        "LOC"
    }

    fn domains(&self) -> &[String] {
        &[]
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::resolve_only()
    }

    async fn resolve(&self, query: Message) -> Result<Message> {
        for server in &self.servers {
            tracing::debug!(%server, "Forwarding query to system resolver");

            match self.exchange(*server, &query).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(%server, "System resolver failed: {e:#}");
                    continue;
                }
            }
        }

        bail!("no system resolver answered")
    }
}
