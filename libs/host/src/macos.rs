use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use ip_network::Ipv4Network;
use tokio::process::Command;
use warp_tunnel::HostAdapter;

const RESOLVER_DIR: &str = "/etc/resolver";

/// Host adapter for macOS.
///
/// Interface and route changes go through `ifconfig`/`route`, split DNS uses
/// the `/etc/resolver/<domain>` convention, and the cache flush pokes
/// `mDNSResponder`.
pub struct MacosHost;

impl MacosHost {
    #[expect(clippy::unnecessary_wraps, reason = "mirrors the Linux constructor")]
    pub fn new(_tun_name: &str) -> Result<Self> {
        Ok(Self)
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

fn resolver_file(domain: &str) -> PathBuf {
    PathBuf::from(RESOLVER_DIR).join(domain)
}

#[async_trait::async_trait]
impl HostAdapter for MacosHost {
    async fn create_tun(&self, name: &str, ip: Ipv4Addr, mtu: u32) -> Result<()> {
        let ip = ip.to_string();
        let mtu = mtu.to_string();

        run("ifconfig", &[name, "inet", &ip, &ip, "mtu", &mtu, "up"]).await
    }

    async fn delete_tun(&self, name: &str) -> Result<()> {
        run("ifconfig", &[name, "down"]).await
    }

    async fn add_route(&self, network: Ipv4Network, gateway: Ipv4Addr) -> Result<()> {
        run(
            "route",
            &["-n", "add", "-net", &network.to_string(), &gateway.to_string()],
        )
        .await
    }

    async fn delete_route(&self, network: Ipv4Network, gateway: Ipv4Addr) -> Result<()> {
        run(
            "route",
            &[
                "-n",
                "delete",
                "-net",
                &network.to_string(),
                &gateway.to_string(),
            ],
        )
        .await
    }

    async fn set_resolver(&self, domain: &str, ip: Ipv4Addr) -> Result<()> {
        tokio::fs::create_dir_all(RESOLVER_DIR)
            .await
            .context("Failed to create /etc/resolver")?;

        let file = resolver_file(domain);

        tokio::fs::write(&file, format!("nameserver {ip}\n"))
            .await
            .with_context(|| format!("Failed to write {}", file.display()))?;

        Ok(())
    }

    async fn remove_resolver(&self, domain: &str) -> Result<()> {
        let file = resolver_file(domain);

        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", file.display())),
        }
    }

    async fn flush_dns(&self) -> Result<()> {
        run("dscacheutil", &["-flushcache"]).await?;
        run("killall", &["-HUP", "mDNSResponder"]).await
    }
}
