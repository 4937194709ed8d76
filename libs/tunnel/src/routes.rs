use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use ip_network::{IpNetwork, Ipv4Network};
use ip_network_table::IpNetworkTable;
use tokio::sync::RwLock;

use crate::host::HostAdapter;
use crate::protocol::Protocol;

/// Destination prefixes and the protocol that owns them.
///
/// Prefix containment rules: inserting a prefix already covered by an
/// existing entry is a no-op, so the first insertion wins. Every successful
/// insert also installs the matching OS route towards the TUN gateway; if
/// that fails the entry is not added. Entries live until [`RouteTable::clear`]
/// at teardown.
pub struct RouteTable {
    gateway: Ipv4Addr,
    host: Arc<dyn HostAdapter>,
    table: RwLock<IpNetworkTable<Arc<dyn Protocol>>>,
}

impl RouteTable {
    pub fn new(gateway: Ipv4Addr, host: Arc<dyn HostAdapter>) -> Self {
        Self {
            gateway,
            host,
            table: RwLock::new(IpNetworkTable::new()),
        }
    }

    pub async fn add(&self, network: Ipv4Network, protocol: Arc<dyn Protocol>) -> Result<()> {
        let mut table = self.table.write().await;

        if let Some((existing, _)) = table.longest_match(IpAddr::V4(network.network_address())) {
            let contained = match existing {
                IpNetwork::V4(existing) => existing.netmask() <= network.netmask(),
                IpNetwork::V6(_) => false,
            };

            if contained {
                return Ok(());
            }
        }

        // Writers hold the lock across the install so OS routes serialise.
        self.host
            .add_route(network, self.gateway)
            .await
            .with_context(|| format!("Failed to install host route for {network}"))?;

        table.insert(network, protocol);

        tracing::info!(route = %network, "Route added");

        Ok(())
    }

    pub async fn add_host(&self, ip: Ipv4Addr, protocol: Arc<dyn Protocol>) -> Result<()> {
        let network = Ipv4Network::new(ip, 32).expect("/32 is always a valid prefix");

        self.add(network, protocol).await
    }

    pub async fn get(&self, ip: Ipv4Addr) -> Option<Arc<dyn Protocol>> {
        self.table
            .read()
            .await
            .longest_match(IpAddr::V4(ip))
            .map(|(_, protocol)| protocol.clone())
    }

    /// All entries, merged into minimal covering prefix blocks.
    pub async fn list(&self) -> Vec<Ipv4Network> {
        let table = self.table.read().await;

        let networks = table
            .iter()
            .filter_map(|(network, _)| match network {
                IpNetwork::V4(network) => Some(network),
                IpNetwork::V6(_) => None,
            })
            .collect();

        merge_networks(networks)
    }

    /// Remove every installed OS route; best-effort, used during teardown.
    pub async fn clear(&self) {
        let mut table = self.table.write().await;

        let networks: Vec<Ipv4Network> = table
            .iter()
            .filter_map(|(network, _)| match network {
                IpNetwork::V4(network) => Some(network),
                IpNetwork::V6(_) => None,
            })
            .collect();

        *table = IpNetworkTable::new();

        for network in networks {
            if let Err(e) = self.host.delete_route(network, self.gateway).await {
                tracing::warn!(route = %network, "Failed to remove host route: {e:#}");
            }
        }
    }
}

/// Merges prefixes into the minimal set of covering blocks: contained
/// prefixes are absorbed and sibling pairs collapse into their parent.
pub(crate) fn merge_networks(networks: Vec<Ipv4Network>) -> Vec<Ipv4Network> {
    let mut blocks: Vec<(u32, u8)> = networks
        .into_iter()
        .map(|n| (u32::from(n.network_address()), n.netmask()))
        .collect();

    loop {
        blocks.sort_unstable();
        blocks.dedup();

        let before = blocks.len();

        let mut kept: Vec<(u32, u8)> = Vec::with_capacity(blocks.len());
        for (base, prefix) in blocks.drain(..) {
            if let Some(&(kept_base, kept_prefix)) = kept.last() {
                if contains(kept_base, kept_prefix, base) && kept_prefix <= prefix {
                    continue;
                }
            }

            kept.push((base, prefix));
        }

        let mut merged: Vec<(u32, u8)> = Vec::with_capacity(kept.len());
        let mut i = 0;
        while i < kept.len() {
            if i + 1 < kept.len() {
                let (a_base, a_prefix) = kept[i];
                let (b_base, b_prefix) = kept[i + 1];

                if a_prefix == b_prefix && a_prefix > 0 && is_sibling_pair(a_base, b_base, a_prefix)
                {
                    merged.push((a_base, a_prefix - 1));
                    i += 2;
                    continue;
                }
            }

            merged.push(kept[i]);
            i += 1;
        }

        let changed = merged.len() != before;
        blocks = merged;

        if !changed {
            break;
        }
    }

    blocks
        .into_iter()
        .map(|(base, prefix)| {
            Ipv4Network::new(Ipv4Addr::from(base), prefix).expect("merged prefix must be valid")
        })
        .collect()
}

fn contains(base: u32, prefix: u8, other_base: u32) -> bool {
    if prefix == 0 {
        return true;
    }

    let mask = u32::MAX << (32 - prefix);

    base & mask == other_base & mask
}

fn is_sibling_pair(a_base: u32, b_base: u32, prefix: u8) -> bool {
    let half = 1u32 << (32 - prefix);

    a_base & half == 0 && b_base == a_base | half
}
