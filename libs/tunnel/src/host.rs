use std::net::Ipv4Addr;

use anyhow::Result;
use ip_network::Ipv4Network;

/// Boundary for every side effect the engine applies to the host OS.
///
/// All of these are reverted on orderly shutdown; implementations live in the
/// platform `host` crate, tests substitute a recording fake.
#[async_trait::async_trait]
pub trait HostAdapter: Send + Sync + 'static {
    /// Configure the TUN interface: address, MTU, up.
    async fn create_tun(&self, name: &str, ip: Ipv4Addr, mtu: u32) -> Result<()>;

    /// Bring the TUN interface down again.
    async fn delete_tun(&self, name: &str) -> Result<()>;

    /// Install a host route `network -> gateway`.
    async fn add_route(&self, network: Ipv4Network, gateway: Ipv4Addr) -> Result<()>;

    /// Remove a previously installed host route.
    async fn delete_route(&self, network: Ipv4Network, gateway: Ipv4Addr) -> Result<()>;

    /// Point the given DNS domain at `ip` (e.g. `/etc/resolver/<domain>`).
    async fn set_resolver(&self, domain: &str, ip: Ipv4Addr) -> Result<()>;

    /// Remove the per-domain resolver hint again.
    async fn remove_resolver(&self, domain: &str) -> Result<()>;

    /// Flush the OS-level DNS cache.
    async fn flush_dns(&self) -> Result<()>;
}
