use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context as _, Result, bail};
use futures::TryStreamExt as _;
use ip_network::Ipv4Network;
use parking_lot::Mutex;
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use tokio::process::Command;
use warp_tunnel::HostAdapter;

/// Host adapter for Linux: rtnetlink for interface and routes,
/// `resolvectl` for per-domain DNS routing and the cache flush.
pub struct LinuxHost {
    tun_name: String,
    handle: Handle,
    /// Domains currently routed to the tunnel; `resolvectl domain` replaces
    /// the whole list on every call, so we keep it here.
    domains: Mutex<Vec<String>>,
}

impl LinuxHost {
    /// Creates the netlink connection; must be called inside a Tokio runtime.
    pub fn new(tun_name: &str) -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("Failed to create netlink connection")?;

        tokio::spawn(connection);

        Ok(Self {
            tun_name: tun_name.to_owned(),
            handle,
            domains: Mutex::new(Vec::new()),
        })
    }

    async fn link_index(&self, name: &str) -> Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_owned())
            .execute();

        let link = links
            .try_next()
            .await
            .with_context(|| format!("Failed to look up interface `{name}`"))?
            .with_context(|| format!("No such interface `{name}`"))?;

        Ok(link.header.index)
    }

    async fn apply_domains(&self, ip: Option<Ipv4Addr>) -> Result<()> {
        let domains = self.domains.lock().clone();

        if let Some(ip) = ip {
            run("resolvectl", &["dns", &self.tun_name, &ip.to_string()]).await?;
        }

        let mut args = vec!["domain".to_owned(), self.tun_name.clone()];
        args.extend(domains.iter().map(|domain| format!("~{domain}")));

        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        run("resolvectl", &args).await
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn `{program}`"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);

        bail!("`{program} {}` failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}

#[async_trait::async_trait]
impl HostAdapter for LinuxHost {
    async fn create_tun(&self, name: &str, ip: Ipv4Addr, mtu: u32) -> Result<()> {
        let index = self.link_index(name).await?;

        self.handle
            .address()
            .add(index, IpAddr::V4(ip), 32)
            .execute()
            .await
            .context("Failed to assign address")?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).mtu(mtu).up().build())
            .execute()
            .await
            .context("Failed to bring up interface")?;

        Ok(())
    }

    async fn delete_tun(&self, name: &str) -> Result<()> {
        let index = self.link_index(name).await?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).down().build())
            .execute()
            .await
            .context("Failed to bring down interface")?;

        Ok(())
    }

    async fn add_route(&self, network: Ipv4Network, gateway: Ipv4Addr) -> Result<()> {
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(network.network_address(), network.netmask())
            .gateway(gateway)
            .build();

        self.handle
            .route()
            .add(route)
            .execute()
            .await
            .with_context(|| format!("Failed to add route {network}"))?;

        Ok(())
    }

    async fn delete_route(&self, network: Ipv4Network, gateway: Ipv4Addr) -> Result<()> {
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(network.network_address(), network.netmask())
            .gateway(gateway)
            .build();

        self.handle
            .route()
            .del(route)
            .execute()
            .await
            .with_context(|| format!("Failed to delete route {network}"))?;

        Ok(())
    }

    async fn set_resolver(&self, domain: &str, ip: Ipv4Addr) -> Result<()> {
        self.domains.lock().push(domain.to_owned());

        self.apply_domains(Some(ip)).await
    }

    async fn remove_resolver(&self, domain: &str) -> Result<()> {
        self.domains.lock().retain(|d| d != domain);

        self.apply_domains(None).await
    }

    async fn flush_dns(&self) -> Result<()> {
        run("resolvectl", &["flush-caches"]).await
    }
}
