//! The traffic-plane engine of a name-driven split tunnel.
//!
//! A TUN device feeds the userspace stack in [`netstack`]; accepted flows are
//! matched against the [`RouteTable`] and handed to the owning
//! [`Protocol`]'s handler, while DNS queries to the tunnel address are
//! dispatched per claimed domain through [`DnsEngine`] and their answers
//! installed as routes. [`Service`] wires it all together and reverts every
//! host side effect on shutdown.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::FutureExt as _;
use netstack::{Stack, StackConfig, StackHandle, TcpFlow, UdpFlow};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod codec;
mod dns;
mod host;
mod pipes;
mod protocol;
mod routes;
mod sniff;
#[cfg(test)]
pub(crate) mod testutil;
mod traffic;
mod transfer;

pub mod protocols;

pub use dns::DnsEngine;
pub use host::HostAdapter;
pub use pipes::{Pipe, Pipes};
pub use protocol::{Capabilities, Protocol, TcpConn, UdpConn};
pub use routes::RouteTable;
pub use sniff::AppProtocol;
pub use traffic::{Metered, Traffic};

pub const DEFAULT_MTU: u32 = 1480;

/// Tunnel identity: interface name and address.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub ip: Ipv4Addr,
    pub mtu: u32,
    /// Answer AAAA queries through resolvers instead of suppressing them.
    pub ipv6: bool,
}

/// Raw packet channels towards the TUN device.
///
/// The binary pumps these from the opened device; tests drive them directly.
pub struct DeviceIo {
    /// Packets read from the device.
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// Packets to be written to the device.
    pub outbound: mpsc::Sender<Vec<u8>>,
}

/// The engine: owns route table, traffic meter and pipe registry, and runs
/// the capture-dispatch loop between device, stack, DNS and protocols.
pub struct Service {
    cfg: ServiceConfig,
    host: Arc<dyn HostAdapter>,
    routes: Arc<RouteTable>,
    traffic: Arc<Traffic>,
    pipes: Arc<Pipes>,
}

struct Dispatch {
    addr: Ipv4Addr,
    dns: DnsEngine,
    routes: Arc<RouteTable>,
    traffic: Arc<Traffic>,
}

impl Service {
    pub fn new(cfg: ServiceConfig, host: Arc<dyn HostAdapter>) -> Self {
        let routes = Arc::new(RouteTable::new(cfg.ip, host.clone()));

        Self {
            cfg,
            host,
            routes,
            traffic: Arc::new(Traffic::new()),
            pipes: Arc::new(Pipes::new()),
        }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn traffic(&self) -> &Arc<Traffic> {
        &self.traffic
    }

    pub fn pipes(&self) -> &Arc<Pipes> {
        &self.pipes
    }

    /// Bring the tunnel up and serve until cancelled.
    ///
    /// Startup: interface, stack, resolver hints, dispatchers, fixed routes.
    /// Teardown runs in reverse; failures there are logged, not propagated.
    pub async fn run(
        &self,
        device: DeviceIo,
        protocols: Vec<Arc<dyn Protocol>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        for protocol in &protocols {
            tracing::info!(
                protocol = protocol.name(),
                capabilities = %protocol.capabilities(),
                domains = ?protocol.domains(),
                "Registered protocol"
            );
        }

        self.host
            .create_tun(&self.cfg.name, self.cfg.ip, self.cfg.mtu)
            .await
            .context("Failed to configure TUN interface")?;

        let child = cancel.child_token();
        let mut tasks = JoinSet::new();

        let (stack, stack_handle) =
            Stack::new(StackConfig::new(self.cfg.ip, self.cfg.mtu as usize));

        let StackHandle {
            packets_in,
            mut packets_out,
            tcp_accept,
            udp_accept,
            connector: _,
        } = stack_handle;

        tasks.spawn(stack.run(child.clone()));

        let DeviceIo {
            mut inbound,
            outbound,
        } = device;

        tasks.spawn(async move {
            while let Some(packet) = inbound.recv().await {
                if packets_in.send(packet).await.is_err() {
                    break;
                }
            }
        });

        tasks.spawn(async move {
            while let Some(packet) = packets_out.recv().await {
                if outbound.send(packet).await.is_err() {
                    break;
                }
            }
        });

        // Per-domain resolver hints; a failure here is fatal at startup.
        let mut resolver_domains = Vec::new();
        for protocol in &protocols {
            for domain in protocol.domains() {
                let domain = domain.trim_matches('.');
                if domain.is_empty() {
                    continue;
                }

                self.host
                    .set_resolver(domain, self.cfg.ip)
                    .await
                    .with_context(|| format!("Failed to set resolver for `{domain}`"))?;

                resolver_domains.push(domain.to_owned());
            }
        }

        if !resolver_domains.is_empty() {
            self.host
                .flush_dns()
                .await
                .context("Failed to flush DNS cache")?;
        }

        tracing::info!(host = %format!("{}:{}", self.cfg.ip, dns::DNS_PORT), "Serving DNS on the tunnel address");

        let dispatch = Arc::new(Dispatch {
            addr: self.cfg.ip,
            dns: DnsEngine::new(protocols.clone(), self.routes.clone(), self.cfg.ipv6),
            routes: self.routes.clone(),
            traffic: self.traffic.clone(),
        });

        tasks.spawn(dispatch_tcp(dispatch.clone(), tcp_accept, child.clone()));
        tasks.spawn(dispatch_udp(dispatch.clone(), udp_accept, child.clone()));

        // Fixed prefixes declared by the protocols are routed up front.
        for protocol in &protocols {
            for network in protocol.fixed_ips() {
                if let Err(e) = self.routes.add(*network, protocol.clone()).await {
                    tracing::warn!(route = %network, "Failed to install fixed route: {e:#}");
                }
            }
        }

        cancel.cancelled().await;

        tracing::info!("Shutting down, reverting host state");

        self.routes.clear().await;

        child.cancel();
        while tasks.join_next().await.is_some() {}

        for domain in &resolver_domains {
            if let Err(e) = self.host.remove_resolver(domain).await {
                tracing::warn!(%domain, "Failed to remove resolver hint: {e:#}");
            }
        }

        if !resolver_domains.is_empty() {
            if let Err(e) = self.host.flush_dns().await {
                tracing::warn!("Failed to flush DNS cache: {e:#}");
            }
        }

        if let Err(e) = self.host.delete_tun(&self.cfg.name).await {
            tracing::warn!("Failed to bring down TUN interface: {e:#}");
        }

        Ok(())
    }
}

/// Drains the TCP accept queue, one worker task per flow.
async fn dispatch_tcp(
    dispatch: Arc<Dispatch>,
    mut accept: mpsc::Receiver<TcpFlow>,
    cancel: CancellationToken,
) {
    loop {
        let flow = tokio::select! {
            _ = cancel.cancelled() => break,
            flow = accept.recv() => match flow {
                Some(flow) => flow,
                None => break,
            },
        };

        spawn_worker(handle_tcp_flow(dispatch.clone(), flow));
    }
}

/// Drains the UDP accept queue, one worker task per session.
async fn dispatch_udp(
    dispatch: Arc<Dispatch>,
    mut accept: mpsc::Receiver<UdpFlow>,
    cancel: CancellationToken,
) {
    loop {
        let flow = tokio::select! {
            _ = cancel.cancelled() => break,
            flow = accept.recv() => match flow {
                Some(flow) => flow,
                None => break,
            },
        };

        spawn_worker(handle_udp_flow(dispatch.clone(), flow));
    }
}

/// A worker panic must not take down the dispatcher.
fn spawn_worker<F>(work: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if AssertUnwindSafe(work).catch_unwind().await.is_err() {
            tracing::error!("Connection worker panicked");
        }
    });
}

async fn handle_tcp_flow(dispatch: Arc<Dispatch>, flow: TcpFlow) {
    let local = flow.local_addr();

    if *local.ip() == dispatch.addr && local.port() == dns::DNS_PORT {
        dispatch.dns.serve_tcp(flow).await;
        return;
    }

    let Some(protocol) = dispatch.routes.get(*local.ip()).await else {
        tracing::warn!(dest = %local, "No handler for TCP connection");
        return;
    };

    if !protocol.capabilities().tcp() {
        tracing::warn!(dest = %local, protocol = protocol.name(), "Protocol does not carry TCP");
        return;
    }

    let conn = Metered::new(flow, dispatch.traffic.clone());

    if let Err(e) = protocol.handle_tcp(conn).await {
        tracing::warn!(dest = %local, protocol = protocol.name(), "TCP handler failed: {e:#}");
    }
}

async fn handle_udp_flow(dispatch: Arc<Dispatch>, flow: UdpFlow) {
    let local = flow.local_addr();

    if *local.ip() == dispatch.addr && local.port() == dns::DNS_PORT {
        dispatch.dns.serve_udp(flow).await;
        return;
    }

    let Some(protocol) = dispatch.routes.get(*local.ip()).await else {
        tracing::warn!(dest = %local, "No handler for UDP connection");
        return;
    };

    if !protocol.capabilities().udp() {
        tracing::warn!(dest = %local, protocol = protocol.name(), "Protocol does not carry UDP");
        return;
    }

    let conn = Metered::new(flow, dispatch.traffic.clone());

    if let Err(e) = protocol.handle_udp(conn).await {
        tracing::warn!(dest = %local, protocol = protocol.name(), "UDP handler failed: {e:#}");
    }
}
