use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use serde::Deserialize;
use warp_tunnel::protocols::{local, socks5, ssh, wireguard};

const CONFIG_FILE: &str = ".warp.yaml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub protocols: Vec<ProtocolEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    /// Interface name, e.g. `utun7` on macOS.
    pub name: String,
    pub ip: Ipv4Addr,
    /// Answer AAAA queries through resolvers instead of suppressing them.
    #[serde(default)]
    pub ipv6: bool,
}

/// One list element of `protocols`; exactly one inner key must be present.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolEntry {
    ssh: Option<ssh::Config>,
    wireguard: Option<wireguard::Config>,
    socks5: Option<socks5::Config>,
    local: Option<local::Config>,
}

pub enum ProtocolKind {
    Ssh(ssh::Config),
    Wireguard(wireguard::Config),
    Socks5(socks5::Config),
    Local(local::Config),
}

impl ProtocolEntry {
    pub fn into_kind(self) -> Result<ProtocolKind> {
        let mut kinds = Vec::new();

        if let Some(cfg) = self.ssh {
            kinds.push(ProtocolKind::Ssh(cfg));
        }
        if let Some(cfg) = self.wireguard {
            kinds.push(ProtocolKind::Wireguard(cfg));
        }
        if let Some(cfg) = self.socks5 {
            kinds.push(ProtocolKind::Socks5(cfg));
        }
        if let Some(cfg) = self.local {
            kinds.push(ProtocolKind::Local(cfg));
        }

        if kinds.len() != 1 {
            bail!("each protocols entry must contain exactly one of: ssh, wireguard, socks5, local");
        }

        Ok(kinds.remove(0))
    }
}

pub fn load() -> Result<Config> {
    let path = config_path()?;

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config =
        serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(config)
}

/// `$HOME/.warp.yaml` of the invoking user: when running under sudo, the
/// invoking user is taken from `SUDO_USER`, not root.
fn config_path() -> Result<PathBuf> {
    let home = sudo_user_home()
        .or_else(dirs::home_dir)
        .context("Failed to determine the home directory")?;

    Ok(home.join(CONFIG_FILE))
}

#[cfg(target_family = "unix")]
fn sudo_user_home() -> Option<PathBuf> {
    let name = std::env::var("SUDO_USER").ok()?;

    if name.is_empty() {
        return None;
    }

    let user = nix::unistd::User::from_name(&name).ok()??;

    Some(user.dir)
}

#[cfg(not(target_family = "unix"))]
fn sudo_user_home() -> Option<PathBuf> {
    None
}
