use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use crate::sniff::{self, AppProtocol};

/// One captured flow spliced to one upstream flow.
#[derive(Debug)]
pub struct Pipe {
    id: u64,
    tag: &'static str,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    opened_at: Instant,
    rx: AtomicU64,
    tx: AtomicU64,
    app_protocol: AtomicU32,
}

impl Pipe {
    /// Which protocol adapter owns the flow.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// The destination the guest was talking to.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// The guest endpoint.
    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Bytes moved (towards upstream, towards the guest).
    pub fn transferred(&self) -> (u64, u64) {
        (self.tx.load(Ordering::Relaxed), self.rx.load(Ordering::Relaxed))
    }

    pub fn app_protocol(&self) -> Option<AppProtocol> {
        AppProtocol::from_id(self.app_protocol.load(Ordering::Relaxed))
    }

    pub(crate) fn add_tx(&self, bytes: u64) {
        self.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_rx(&self, bytes: u64) {
        self.rx.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Single-shot: the first successful detection sticks.
    pub(crate) fn sniff(&self, data: &[u8]) {
        let Some(protocol) = sniff::detect(data) else {
            return;
        };

        let _ = self.app_protocol.compare_exchange(
            0,
            protocol as u32,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

/// Live index of open pipes, for observability.
#[derive(Debug, Default)]
pub struct Pipes {
    next_id: AtomicU64,
    open: DashMap<u64, Arc<Pipe>>,
}

impl Pipes {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open(
        self: &Arc<Self>,
        tag: &'static str,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> PipeGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let pipe = Arc::new(Pipe {
            id,
            tag,
            local,
            remote,
            opened_at: Instant::now(),
            rx: AtomicU64::new(0),
            tx: AtomicU64::new(0),
            app_protocol: AtomicU32::new(0),
        });

        self.open.insert(id, pipe.clone());

        PipeGuard {
            pipe,
            pipes: self.clone(),
        }
    }

    pub fn list(&self) -> Vec<Arc<Pipe>> {
        self.open.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

/// Keeps the pipe registered for as long as the splice runs.
pub(crate) struct PipeGuard {
    pipe: Arc<Pipe>,
    pipes: Arc<Pipes>,
}

impl PipeGuard {
    pub(crate) fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }
}

impl Drop for PipeGuard {
    fn drop(&mut self) {
        self.pipes.open.remove(&self.pipe.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn open_and_close_maintain_the_index() {
        let pipes = Arc::new(Pipes::new());

        let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 42), 443);
        let remote = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 50000);

        let guard = pipes.open("SSH", local, remote);
        assert_eq!(pipes.len(), 1);

        let listed = pipes.list();
        assert_eq!(listed[0].tag(), "SSH");
        assert_eq!(listed[0].local_addr(), local);
        assert_eq!(listed[0].remote_addr(), remote);
        assert_eq!(listed[0].transferred(), (0, 0));

        drop(guard);
        assert!(pipes.is_empty());
    }

    #[test]
    fn first_sniff_wins() {
        let pipes = Arc::new(Pipes::new());
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);

        let guard = pipes.open("WRG", addr, addr);

        guard.pipe().sniff(b"not anything known");
        assert_eq!(guard.pipe().app_protocol(), None);

        guard.pipe().sniff(b"SSH-2.0-OpenSSH_9.6");
        assert_eq!(guard.pipe().app_protocol(), Some(AppProtocol::Ssh));

        guard.pipe().sniff(b"GET / HTTP/1.1\r\n");
        assert_eq!(guard.pipe().app_protocol(), Some(AppProtocol::Ssh));
    }
}
