use std::fmt;

use anyhow::{Result, bail};
use hickory_proto::op::Message;
use ip_network::Ipv4Network;

use crate::traffic::Metered;

/// A captured TCP flow, wrapped so its bytes count towards the global meter.
pub type TcpConn = Metered<netstack::TcpFlow>;
/// A captured UDP session, wrapped the same way.
pub type UdpConn = Metered<netstack::UdpFlow>;

/// Which kinds of traffic a protocol can carry.
///
/// Recorded once at startup; the dispatcher and the DNS engine consult the
/// mask instead of probing trait methods per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    const TCP: u8 = 1 << 0;
    const UDP: u8 = 1 << 1;

    /// Resolve-only: answers DNS but never carries flows.
    pub const fn resolve_only() -> Self {
        Self(0)
    }

    pub const fn with_tcp(self) -> Self {
        Self(self.0 | Self::TCP)
    }

    pub const fn with_udp(self) -> Self {
        Self(self.0 | Self::UDP)
    }

    pub const fn tcp(self) -> bool {
        self.0 & Self::TCP != 0
    }

    pub const fn udp(self) -> bool {
        self.0 & Self::UDP != 0
    }

    /// Whether DNS answers from this protocol should install routes.
    pub const fn carries_traffic(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tcp(), self.udp()) {
            (true, true) => write!(f, "resolve+tcp+udp"),
            (true, false) => write!(f, "resolve+tcp"),
            (false, true) => write!(f, "resolve+udp"),
            (false, false) => write!(f, "resolve"),
        }
    }
}

/// An upstream transport adapter.
///
/// Every protocol can resolve DNS queries; carrying TCP or UDP flows is
/// optional and advertised through [`Protocol::capabilities`].
#[async_trait::async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Short tag identifying the adapter in logs and pipe listings.
    fn name(&self) -> &'static str;

    /// DNS suffixes this protocol is authoritative for.
    ///
    /// An empty list matches every query name, which makes the protocol a
    /// fallback resolver.
    fn domains(&self) -> &[String];

    /// Destination prefixes routed to this protocol even without DNS.
    fn fixed_ips(&self) -> &[Ipv4Network] {
        &[]
    }

    fn capabilities(&self) -> Capabilities;

    /// Resolve a DNS query through this protocol's own resolver.
    async fn resolve(&self, query: Message) -> Result<Message>;

    async fn handle_tcp(&self, conn: TcpConn) -> Result<()> {
        let _ = conn;

        bail!("{} does not carry TCP traffic", self.name())
    }

    async fn handle_udp(&self, conn: UdpConn) -> Result<()> {
        let _ = conn;

        bail!("{} does not carry UDP traffic", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_mask() {
        let mask = Capabilities::resolve_only();
        assert!(!mask.tcp());
        assert!(!mask.udp());
        assert!(!mask.carries_traffic());

        let mask = mask.with_tcp();
        assert!(mask.tcp());
        assert!(!mask.udp());
        assert!(mask.carries_traffic());

        assert_eq!(mask.to_string(), "resolve+tcp");
        assert_eq!(mask.with_udp().to_string(), "resolve+tcp+udp");
    }
}
