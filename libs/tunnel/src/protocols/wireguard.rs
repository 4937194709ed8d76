use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use bytes::Bytes;
use hickory_proto::op::Message;
use ip_network::Ipv4Network;
use netstack::{Connector, Stack, StackConfig, StackHandle};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dns::DNS_PORT;
use crate::pipes::Pipes;
use crate::protocol::{Capabilities, Protocol, TcpConn, UdpConn};
use crate::transfer;

/// Conservative inner MTU: outer MTU minus WireGuard overhead.
const WG_MTU: usize = 1420;
const PERSISTENT_KEEPALIVE: u16 = 5;
const TIMER_TICK: Duration = Duration::from_millis(250);
const RESOLVE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub private_key: String,
    pub peer_public_key: String,
    /// Peer endpoint, `host:port`.
    pub endpoint: String,
    /// Our address inside the WireGuard network.
    pub address: Ipv4Addr,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ips: Vec<Ipv4Network>,
}

/// A userspace WireGuard peer with its own in-process network stack.
///
/// Captured flows are re-dialled as client connections through that stack;
/// the stack's packets are encapsulated with [`boringtun`] and exchanged with
/// the peer over a single UDP socket.
pub struct WireguardProtocol {
    domains: Vec<String>,
    fixed: Vec<Ipv4Network>,
    dns_servers: Vec<Ipv4Addr>,
    pipes: Arc<Pipes>,
    connector: Connector,
}

impl WireguardProtocol {
    pub async fn new(cfg: Config, pipes: Arc<Pipes>, cancel: CancellationToken) -> Result<Self> {
        let private_key = decode_key(&cfg.private_key).context("Invalid private key")?;
        let peer_public_key =
            decode_key(&cfg.peer_public_key).context("Invalid peer public key")?;

        let tunn = Tunn::new(
            StaticSecret::from(private_key),
            PublicKey::from(peer_public_key),
            None,
            Some(PERSISTENT_KEEPALIVE),
            0,
            None,
        );

        let endpoint = tokio::net::lookup_host(&cfg.endpoint)
            .await
            .with_context(|| format!("Failed to resolve endpoint {}", cfg.endpoint))?
            .next()
            .ok_or_else(|| anyhow!("Endpoint {} did not resolve", cfg.endpoint))?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to bind WireGuard socket")?;
        socket
            .connect(endpoint)
            .await
            .context("Failed to connect WireGuard socket")?;

        let (stack, handle) = Stack::new(StackConfig::new(cfg.address, WG_MTU));

        let StackHandle {
            packets_in,
            packets_out,
            mut tcp_accept,
            mut udp_accept,
            connector,
        } = handle;

        tokio::spawn(stack.run(cancel.clone()));
        tokio::spawn(pump(tunn, socket, packets_in, packets_out, cancel.clone()));

        // Nothing listens inside the tunnel; unsolicited flows are discarded.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    flow = tcp_accept.recv() => if flow.is_none() { break },
                    flow = udp_accept.recv() => if flow.is_none() { break },
                }
            }
        });

        Ok(Self {
            domains: cfg.domains,
            fixed: cfg.ips,
            dns_servers: cfg.dns,
            pipes,
            connector,
        })
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    use base64::Engine as _;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("key is not valid base64")?;

    bytes
        .try_into()
        .map_err(|_| anyhow!("key must decode to 32 bytes"))
}

/// Moves packets between the stack and the peer, en/decapsulating as it goes
/// and ticking the WireGuard timers.
async fn pump(
    mut tunn: Tunn,
    socket: UdpSocket,
    packets_in: mpsc::Sender<Vec<u8>>,
    mut packets_out: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut udp_buf = vec![0u8; 1700];
    let mut scratch = vec![0u8; 1700 + 160];
    let mut timers = tokio::time::interval(TIMER_TICK);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            maybe = packets_out.recv() => {
                let Some(packet) = maybe else { break };

                match tunn.encapsulate(&packet, &mut scratch) {
                    TunnResult::WriteToNetwork(data) => {
                        if socket.send(data).await.is_err() {
                            break;
                        }
                    }
                    TunnResult::Err(e) => tracing::warn!("Failed to encapsulate: {e:?}"),
                    _ => {}
                }
            }
            received = socket.recv(&mut udp_buf) => {
                let n = match received {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("WireGuard socket error: {e}");
                        continue;
                    }
                };

                match tunn.decapsulate(None, &udp_buf[..n], &mut scratch) {
                    TunnResult::WriteToNetwork(data) => {
                        let first = data.to_vec();
                        if socket.send(&first).await.is_err() {
                            break;
                        }

                        // A finished handshake may have queued more packets.
                        loop {
                            match tunn.decapsulate(None, &[], &mut scratch) {
                                TunnResult::WriteToNetwork(data) => {
                                    let next = data.to_vec();
                                    if socket.send(&next).await.is_err() {
                                        return;
                                    }
                                }
                                _ => break,
                            }
                        }
                    }
                    TunnResult::WriteToTunnelV4(packet, _) => {
                        if packets_in.send(packet.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    TunnResult::WriteToTunnelV6(..) | TunnResult::Done => {}
                    TunnResult::Err(e) => tracing::debug!("Failed to decapsulate: {e:?}"),
                }
            }
            _ = timers.tick() => {
                match tunn.update_timers(&mut scratch) {
                    TunnResult::WriteToNetwork(data) => {
                        if socket.send(data).await.is_err() {
                            break;
                        }
                    }
                    TunnResult::Err(e) => tracing::warn!("WireGuard timer error: {e:?}"),
                    _ => {}
                }
            }
        }
    }

    tracing::debug!("WireGuard pump finished");
}

#[async_trait::async_trait]
impl Protocol for WireguardProtocol {
    fn name(&self) -> &'static str {
        "WRG"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    fn fixed_ips(&self) -> &[Ipv4Network] {
        &self.fixed
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::resolve_only().with_tcp().with_udp()
    }

    async fn resolve(&self, query: Message) -> Result<Message> {
        let encoded = query.to_vec().context("Failed to encode query")?;

        for server in &self.dns_servers {
            let target = SocketAddrV4::new(*server, DNS_PORT);

            let mut flow = match self.connector.connect_udp(target).await {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::warn!(%server, "Failed to open DNS session: {e}");
                    continue;
                }
            };

            if flow.send(Bytes::from(encoded.clone())).await.is_err() {
                continue;
            }

            let datagram =
                match tokio::time::timeout(RESOLVE_ATTEMPT_TIMEOUT, flow.recv()).await {
                    Ok(Some(datagram)) => datagram,
                    Ok(None) | Err(_) => {
                        tracing::warn!(%server, "Nameserver did not answer");
                        continue;
                    }
                };

            let response = match Message::from_vec(&datagram) {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(%server, "Failed to parse response: {e}");
                    continue;
                }
            };

            if response.answers().is_empty() {
                continue;
            }

            return Ok(response);
        }

        bail!("no upstream nameserver produced answers")
    }

    async fn handle_tcp(&self, conn: TcpConn) -> Result<()> {
        let target = conn.local_addr();

        tracing::info!(dest = %target, "Handling TCP connection");

        let upstream = self
            .connector
            .connect_tcp(target)
            .await
            .context("Failed to connect through the WireGuard stack")?;

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

    async fn handle_udp(&self, conn: UdpConn) -> Result<()> {
        let target = conn.local_addr();

        tracing::info!(dest = %target, "Handling UDP session");

        let upstream = self
            .connector
            .connect_udp(target)
            .await
            .context("Failed to open session through the WireGuard stack")?;

        transfer::relay(&self.pipes, self.name(), conn, upstream).await;

        Ok(())
    }
}
