use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::{Buf as _, Bytes};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use rand::Rng as _;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::wire::{HardwareAddress, IpAddress, IpEndpoint, Ipv4Cidr};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::device::InMemoryDevice;
use crate::flow::{TcpFlow, UdpFlow};

/// How many not-yet-dispatched flows each accept queue buffers.
///
/// A full queue stalls acceptance: SYNs are no longer answered (the guest
/// retransmits) and datagrams for new sessions are dropped.
const ACCEPT_BACKLOG: usize = 128;

const TCP_BUFFER_SIZE: usize = 32 * 1024;
const DATA_CHANNEL_CAPACITY: usize = 16;
const DATAGRAM_CHANNEL_CAPACITY: usize = 64;
const PACKET_CHANNEL_CAPACITY: usize = 512;
const MAX_PENDING_CHUNKS: usize = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
const THROTTLE_INTERVAL: Duration = Duration::from_millis(10);

pub struct StackConfig {
    /// Address the stack claims as its own; source of client-side connects.
    pub ip: Ipv4Addr,
    pub mtu: usize,
    pub max_sockets: usize,
    pub max_udp_sessions: usize,
    pub udp_idle_timeout: Duration,
}

impl StackConfig {
    pub fn new(ip: Ipv4Addr, mtu: usize) -> Self {
        Self {
            ip,
            mtu,
            max_sockets: 1024,
            max_udp_sessions: 512,
            udp_idle_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct UdpKey {
    /// The peer on the far side of the session.
    pub remote: SocketAddrV4,
    /// The address the peer is talking to.
    pub local: SocketAddrV4,
}

pub(crate) enum Command {
    /// Wake the stack task so it pumps sockets and sessions.
    Poke,
    ConnectTcp {
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<TcpFlow, ConnectError>>,
    },
    ConnectUdp {
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<UdpFlow, ConnectError>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused or reset")]
    Reset,
    #[error("no free local port")]
    PortsExhausted,
    #[error("socket limit reached")]
    TooManySockets,
    #[error("the stack task is gone")]
    StackGone,
}

/// Client-side entry point: dial TCP connections and UDP sessions through the
/// stack, sourced from the stack's own address.
#[derive(Clone)]
pub struct Connector {
    cmd: mpsc::UnboundedSender<Command>,
}

impl Connector {
    pub async fn connect_tcp(&self, remote: SocketAddrV4) -> Result<TcpFlow, ConnectError> {
        let (reply, rx) = oneshot::channel();

        self.cmd
            .send(Command::ConnectTcp { remote, reply })
            .map_err(|_| ConnectError::StackGone)?;

        rx.await.map_err(|_| ConnectError::StackGone)?
    }

    pub async fn connect_udp(&self, remote: SocketAddrV4) -> Result<UdpFlow, ConnectError> {
        let (reply, rx) = oneshot::channel();

        self.cmd
            .send(Command::ConnectUdp { remote, reply })
            .map_err(|_| ConnectError::StackGone)?;

        rx.await.map_err(|_| ConnectError::StackGone)?
    }
}

/// The caller-facing ends of a [`Stack`].
pub struct StackHandle {
    /// Raw IP packets from the transport (TUN device, WireGuard peer, test).
    pub packets_in: mpsc::Sender<Vec<u8>>,
    /// Raw IP packets towards the transport.
    pub packets_out: mpsc::Receiver<Vec<u8>>,
    /// Server-side TCP flows, accepted in SYN order.
    pub tcp_accept: mpsc::Receiver<TcpFlow>,
    /// Server-side UDP sessions, one per new 4-tuple.
    pub udp_accept: mpsc::Receiver<UdpFlow>,
    pub connector: Connector,
}

struct Connecting {
    reply: oneshot::Sender<Result<TcpFlow, ConnectError>>,
    deadline: Instant,
}

#[derive(Default)]
struct TcpState {
    listen_port: Option<u16>,
    local_port: Option<u16>,
    connect: Option<Connecting>,

    promoted: bool,
    pending_accept: Option<TcpFlow>,

    to_flow: Option<mpsc::Sender<Bytes>>,
    from_flow: Option<mpsc::Receiver<Bytes>>,
    pending_out: VecDeque<Bytes>,
    write_closed: bool,
    fin_sent: bool,
}

struct UdpSession {
    to_flow: mpsc::Sender<Bytes>,
    from_flow: mpsc::Receiver<Bytes>,
    last_seen: Instant,
}

/// The stack task. Owns the smoltcp interface for TCP, a 4-tuple session
/// table for UDP, and the packet channels towards the transport.
pub struct Stack {
    cfg: StackConfig,

    device: InMemoryDevice,
    interface: Interface,
    sockets: SocketSet<'static>,
    created_at: Instant,

    packets_in: mpsc::Receiver<Vec<u8>>,
    packets_out: mpsc::Sender<Vec<u8>>,
    out_queue: VecDeque<Vec<u8>>,

    commands: mpsc::UnboundedReceiver<Command>,
    commands_tx: mpsc::UnboundedSender<Command>,

    tcp_accept: mpsc::Sender<TcpFlow>,
    udp_accept: mpsc::Sender<UdpFlow>,

    tcp: HashMap<SocketHandle, TcpState>,
    used_ports: HashSet<u16>,

    udp: HashMap<UdpKey, UdpSession>,

    throttled: bool,
}

enum Event {
    Inbound(Option<Vec<u8>>),
    Command(Command),
    Tick,
    Cancelled,
}

impl Stack {
    pub fn new(cfg: StackConfig) -> (Self, StackHandle) {
        let mut device = InMemoryDevice::new(cfg.mtu);
        let interface = create_interface(&mut device, cfg.ip);

        let (packets_in_tx, packets_in_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (packets_out_tx, packets_out_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (tcp_accept_tx, tcp_accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (udp_accept_tx, udp_accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let stack = Self {
            cfg,
            device,
            interface,
            sockets: SocketSet::new(Vec::default()),
            created_at: Instant::now(),
            packets_in: packets_in_rx,
            packets_out: packets_out_tx,
            out_queue: VecDeque::new(),
            commands: commands_rx,
            commands_tx: commands_tx.clone(),
            tcp_accept: tcp_accept_tx,
            udp_accept: udp_accept_tx,
            tcp: HashMap::new(),
            used_ports: HashSet::new(),
            udp: HashMap::new(),
            throttled: false,
        };

        let handle = StackHandle {
            packets_in: packets_in_tx,
            packets_out: packets_out_rx,
            tcp_accept: tcp_accept_rx,
            udp_accept: udp_accept_rx,
            connector: Connector { cmd: commands_tx },
        };

        (stack, handle)
    }

    /// Drive the stack until cancelled or the transport goes away.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            self.poll();

            if !self.flush_outbound().await {
                break;
            }

            let deadline = tokio::time::Instant::now() + self.next_wait();

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                maybe = self.packets_in.recv() => Event::Inbound(maybe),
                Some(cmd) = self.commands.recv() => Event::Command(cmd),
                _ = tokio::time::sleep_until(deadline) => Event::Tick,
            };

            match event {
                Event::Cancelled => break,
                Event::Inbound(None) => break,
                Event::Inbound(Some(packet)) => {
                    self.handle_inbound(packet);

                    // Drain whatever else already arrived before polling again.
                    while let Ok(packet) = self.packets_in.try_recv() {
                        self.handle_inbound(packet);
                    }
                }
                Event::Command(cmd) => {
                    self.handle_command(cmd);

                    while let Ok(cmd) = self.commands.try_recv() {
                        self.handle_command(cmd);
                    }
                }
                Event::Tick => {}
            }
        }

        tracing::debug!("Stack task finished");
    }

    async fn flush_outbound(&mut self) -> bool {
        while let Some(packet) = self.device.next_send() {
            self.out_queue.push_back(packet);
        }

        while let Some(packet) = self.out_queue.pop_front() {
            if self.packets_out.send(packet).await.is_err() {
                return false;
            }
        }

        true
    }

    fn next_wait(&mut self) -> Duration {
        let now = self.now();
        let mut wait = MAINTENANCE_INTERVAL;

        if let Some(delay) = self
            .interface
            .poll_delay(now, &self.sockets)
            .map(Duration::from)
        {
            wait = wait.min(delay);
        }

        if self.throttled {
            wait = wait.min(THROTTLE_INTERVAL);
        }

        wait
    }

    fn now(&self) -> smoltcp::time::Instant {
        smoltcp::time::Instant::from_micros(self.created_at.elapsed().as_micros() as i64)
    }

    fn handle_inbound(&mut self, packet: Vec<u8>) {
        if packet.first().map(|b| b >> 4) != Some(4) {
            return; // Only IPv4 is serviced.
        }

        enum Verdict {
            Tcp { syn_port: Option<u16> },
            Udp {
                src: SocketAddrV4,
                dst: SocketAddrV4,
                payload: Bytes,
            },
            Drop,
        }

        let verdict = match SlicedPacket::from_ip(&packet) {
            Ok(sliced) => {
                let ipv4 = match &sliced.net {
                    Some(NetSlice::Ipv4(ipv4)) => ipv4.header(),
                    _ => {
                        return;
                    }
                };

                match &sliced.transport {
                    Some(TransportSlice::Tcp(tcp)) => Verdict::Tcp {
                        syn_port: (tcp.syn() && !tcp.ack()).then(|| tcp.destination_port()),
                    },
                    Some(TransportSlice::Udp(udp)) => Verdict::Udp {
                        src: SocketAddrV4::new(ipv4.source_addr(), udp.source_port()),
                        dst: SocketAddrV4::new(ipv4.destination_addr(), udp.destination_port()),
                        payload: Bytes::copy_from_slice(udp.payload()),
                    },
                    _ => Verdict::Drop,
                }
            }
            Err(e) => {
                tracing::trace!("Failed to slice inbound packet: {e}");
                return;
            }
        };

        match verdict {
            Verdict::Tcp { syn_port } => {
                if let Some(port) = syn_port {
                    self.ensure_tcp_listener(port);
                }

                self.device.receive(packet);
            }
            Verdict::Udp { src, dst, payload } => self.handle_udp_datagram(src, dst, payload),
            Verdict::Drop => {}
        }
    }

    fn ensure_tcp_listener(&mut self, port: u16) {
        let has_listener = self.tcp.iter().any(|(handle, state)| {
            state.listen_port == Some(port)
                && self.sockets.get::<tcp::Socket>(*handle).state() == tcp::State::Listen
        });

        if has_listener {
            return;
        }

        if self.tcp.len() >= self.cfg.max_sockets {
            tracing::warn!(%port, "Socket limit reached, ignoring SYN");
            return;
        }

        let mut socket = create_tcp_socket();
        if let Err(e) = socket.listen(port) {
            tracing::warn!(%port, "Failed to open listening socket: {e}");
            return;
        }

        let handle = self.sockets.add(socket);
        self.tcp.insert(
            handle,
            TcpState {
                listen_port: Some(port),
                ..Default::default()
            },
        );
    }

    fn handle_udp_datagram(&mut self, src: SocketAddrV4, dst: SocketAddrV4, payload: Bytes) {
        let key = UdpKey {
            remote: src,
            local: dst,
        };

        if let Some(session) = self.udp.get_mut(&key) {
            session.last_seen = Instant::now();

            match session.to_flow.try_send(payload) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(?key, "Session receive buffer full, dropping datagram");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.udp.remove(&key);
                }
            }

            return;
        }

        if self.udp.len() >= self.cfg.max_udp_sessions {
            tracing::warn!("UDP session limit reached, dropping datagram");
            return;
        }

        let (to_flow_tx, to_flow_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let (from_flow_tx, from_flow_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);

        let flow = UdpFlow::new(dst, src, to_flow_rx, from_flow_tx, self.commands_tx.clone());

        let _ = to_flow_tx.try_send(payload);

        match self.udp_accept.try_send(flow) {
            Ok(()) => {
                self.udp.insert(
                    key,
                    UdpSession {
                        to_flow: to_flow_tx,
                        from_flow: from_flow_rx,
                        last_seen: Instant::now(),
                    },
                );
            }
            Err(e) => {
                tracing::warn!(?key, "UDP accept queue full, dropping session: {e}");
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Poke => {}
            Command::ConnectTcp { remote, reply } => self.connect_tcp(remote, reply),
            Command::ConnectUdp { remote, reply } => self.connect_udp(remote, reply),
        }
    }

    fn connect_tcp(
        &mut self,
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<TcpFlow, ConnectError>>,
    ) {
        if self.tcp.len() >= self.cfg.max_sockets {
            let _ = reply.send(Err(ConnectError::TooManySockets));
            return;
        }

        let port = match self.sample_ephemeral_port() {
            Some(port) => port,
            None => {
                let _ = reply.send(Err(ConnectError::PortsExhausted));
                return;
            }
        };

        let mut socket = create_tcp_socket();

        let local = IpEndpoint::new(IpAddress::Ipv4(self.cfg.ip), port);
        let remote_endpoint = IpEndpoint::new(IpAddress::Ipv4(*remote.ip()), remote.port());

        if let Err(e) = socket.connect(self.interface.context(), remote_endpoint, local) {
            tracing::warn!(%remote, "Failed to initiate connect: {e}");
            let _ = reply.send(Err(ConnectError::Reset));
            return;
        }

        self.used_ports.insert(port);

        let handle = self.sockets.add(socket);
        self.tcp.insert(
            handle,
            TcpState {
                local_port: Some(port),
                connect: Some(Connecting {
                    reply,
                    deadline: Instant::now() + CONNECT_TIMEOUT,
                }),
                ..Default::default()
            },
        );
    }

    fn connect_udp(
        &mut self,
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<UdpFlow, ConnectError>>,
    ) {
        if self.udp.len() >= self.cfg.max_udp_sessions {
            let _ = reply.send(Err(ConnectError::TooManySockets));
            return;
        }

        let local_ports: HashSet<u16> = self
            .udp
            .keys()
            .filter(|key| *key.local.ip() == self.cfg.ip)
            .map(|key| key.local.port())
            .collect();

        let port = match sample_port(&local_ports) {
            Some(port) => port,
            None => {
                let _ = reply.send(Err(ConnectError::PortsExhausted));
                return;
            }
        };

        let local = SocketAddrV4::new(self.cfg.ip, port);
        let key = UdpKey { remote, local };

        let (to_flow_tx, to_flow_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let (from_flow_tx, from_flow_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);

        let flow = UdpFlow::new(local, remote, to_flow_rx, from_flow_tx, self.commands_tx.clone());

        self.udp.insert(
            key,
            UdpSession {
                to_flow: to_flow_tx,
                from_flow: from_flow_rx,
                last_seen: Instant::now(),
            },
        );

        let _ = reply.send(Ok(flow));
    }

    fn sample_ephemeral_port(&self) -> Option<u16> {
        sample_port(&self.used_ports)
    }

    fn poll(&mut self) {
        self.throttled = false;

        let now = self.now();
        let _ = self.interface.poll(now, &mut self.device, &mut self.sockets);

        self.pump_tcp();
        self.pump_udp();
        self.expire_udp();

        // Pumped writes become segments right away instead of waiting a tick.
        let _ = self.interface.poll(now, &mut self.device, &mut self.sockets);
    }

    fn pump_tcp(&mut self) {
        let handles: Vec<SocketHandle> = self.tcp.keys().copied().collect();
        let mut throttled = false;
        let mut dead = Vec::new();

        for handle in handles {
            let state = match self.tcp.get_mut(&handle) {
                Some(state) => state,
                None => continue,
            };
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);

            // Surface freshly established connections.
            if !state.promoted && is_established(socket.state()) {
                let (Some(local), Some(remote)) =
                    (socket.local_endpoint(), socket.remote_endpoint())
                else {
                    continue;
                };

                let local = endpoint_v4(local);
                let remote = endpoint_v4(remote);

                let (to_flow_tx, to_flow_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
                let (from_flow_tx, from_flow_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);

                state.promoted = true;
                state.to_flow = Some(to_flow_tx);
                state.from_flow = Some(from_flow_rx);

                if let Some(connecting) = state.connect.take() {
                    let flow = TcpFlow::new(
                        local,
                        remote,
                        to_flow_rx,
                        from_flow_tx,
                        self.commands_tx.clone(),
                    );

                    let _ = connecting.reply.send(Ok(flow));
                } else {
                    state.pending_accept = Some(TcpFlow::new(
                        local,
                        remote,
                        to_flow_rx,
                        from_flow_tx,
                        self.commands_tx.clone(),
                    ));
                }
            }

            // Hand a pending flow to the dispatcher; a full queue stalls here.
            if let Some(flow) = state.pending_accept.take() {
                if let Err(mpsc::error::TrySendError::Full(flow)) = self.tcp_accept.try_send(flow)
                {
                    state.pending_accept = Some(flow);
                }
            }

            // Socket -> flow.
            if let Some(to_flow) = state.to_flow.clone() {
                if to_flow.is_closed() {
                    state.to_flow = None;
                } else {
                    loop {
                        if !socket.can_recv() {
                            break;
                        }

                        match to_flow.try_reserve() {
                            Ok(permit) => {
                                let mut buf = [0u8; 4096];
                                match socket.recv_slice(&mut buf) {
                                    Ok(n) if n > 0 => {
                                        permit.send(Bytes::copy_from_slice(&buf[..n]));
                                    }
                                    _ => break,
                                }
                            }
                            Err(mpsc::error::TrySendError::Full(())) => {
                                throttled = true;
                                break;
                            }
                            Err(mpsc::error::TrySendError::Closed(())) => {
                                state.to_flow = None;
                                break;
                            }
                        };
                    }
                }
            }

            // Remote sent FIN and the receive buffer is drained: EOF.
            if state.promoted
                && state.to_flow.is_some()
                && !socket.may_recv()
                && !socket.can_recv()
            {
                state.to_flow = None;
            }

            // Flow -> socket.
            if let Some(from_flow) = &mut state.from_flow {
                while state.pending_out.len() < MAX_PENDING_CHUNKS {
                    match from_flow.try_recv() {
                        Ok(chunk) => state.pending_out.push_back(chunk),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            state.from_flow = None;
                            state.write_closed = true;
                            break;
                        }
                    }
                }
            }

            while let Some(chunk) = state.pending_out.front_mut() {
                if !socket.can_send() {
                    break;
                }

                match socket.send_slice(chunk) {
                    Ok(n) if n == chunk.len() => {
                        state.pending_out.pop_front();
                    }
                    Ok(n) => {
                        chunk.advance(n);
                        break;
                    }
                    Err(e) => {
                        tracing::trace!("Discarding write on closed socket: {e}");
                        state.pending_out.clear();
                        break;
                    }
                }
            }

            // Flow writer is gone and everything is flushed: send FIN.
            if state.write_closed && state.pending_out.is_empty() && !state.fin_sent {
                socket.close();
                state.fin_sent = true;
            }

            // Flow dropped entirely: close out our half as well.
            if state.promoted && state.to_flow.is_none() && state.write_closed && !state.fin_sent {
                socket.close();
                state.fin_sent = true;
            }

            if socket.state() == tcp::State::Closed {
                if let Some(connecting) = state.connect.take() {
                    let _ = connecting.reply.send(Err(ConnectError::Reset));
                }

                dead.push(handle);
            }
        }

        for handle in dead {
            if let Some(state) = self.tcp.remove(&handle) {
                if let Some(port) = state.local_port {
                    self.used_ports.remove(&port);
                }
            }

            self.sockets.remove(handle);
        }

        // Expire connects that never complete.
        let now = Instant::now();
        for (handle, state) in self.tcp.iter_mut() {
            if let Some(connecting) = &state.connect {
                if now >= connecting.deadline {
                    let socket = self.sockets.get_mut::<tcp::Socket>(*handle);
                    socket.abort();

                    if let Some(connecting) = state.connect.take() {
                        let _ = connecting.reply.send(Err(ConnectError::Timeout));
                    }
                }
            }
        }

        self.throttled |= throttled;
    }

    fn pump_udp(&mut self) {
        let keys: Vec<UdpKey> = self.udp.keys().copied().collect();
        let mut dead = Vec::new();

        for key in keys {
            let session = match self.udp.get_mut(&key) {
                Some(session) => session,
                None => continue,
            };

            loop {
                match session.from_flow.try_recv() {
                    Ok(datagram) => {
                        session.last_seen = Instant::now();

                        match build_udp_packet(key.local, key.remote, &datagram) {
                            Ok(packet) => self.out_queue.push_back(packet),
                            Err(e) => {
                                tracing::warn!(?key, "Failed to build datagram: {e}");
                            }
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        dead.push(key);
                        break;
                    }
                }
            }
        }

        for key in dead {
            self.udp.remove(&key);
        }
    }

    fn expire_udp(&mut self) {
        let timeout = self.cfg.udp_idle_timeout;
        let now = Instant::now();

        self.udp
            .retain(|_, session| now.duration_since(session.last_seen) < timeout);
    }
}

fn sample_port(used: &HashSet<u16>) -> Option<u16> {
    const MIN_PORT: u16 = 49152;

    if used.len() >= (u16::MAX - MIN_PORT) as usize {
        return None;
    }

    let mut rng = rand::thread_rng();

    loop {
        let port = rng.gen_range(MIN_PORT..=u16::MAX);

        if !used.contains(&port) {
            return Some(port);
        }
    }
}

fn is_established(state: tcp::State) -> bool {
    !matches!(
        state,
        tcp::State::Listen | tcp::State::SynReceived | tcp::State::SynSent | tcp::State::Closed
    )
}

fn create_tcp_socket() -> tcp::Socket<'static> {
    tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
        tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
    )
}

/// Creates the smoltcp [`Interface`] backing the TCP side of the stack.
///
/// The device is entirely backed by in-memory buffers; the interface is
/// configured to accept packets for any destination (the guest talks to
/// arbitrary addresses that we capture via host routes) with a catch-all
/// route pointing back at it.
fn create_interface(device: &mut InMemoryDevice, ip: Ipv4Addr) -> Interface {
    let mut interface = Interface::new(
        Config::new(HardwareAddress::Ip),
        device,
        smoltcp::time::Instant::ZERO,
    );

    interface.set_any_ip(true);

    interface.update_ip_addrs(|ips| {
        ips.push(Ipv4Cidr::new(ip, 32).into())
            .expect("should be a valid IPv4 CIDR");
    });

    interface
        .routes_mut()
        .add_default_ipv4_route(ip)
        .expect("IPv4 default route should fit");

    interface
}

fn endpoint_v4(endpoint: IpEndpoint) -> SocketAddrV4 {
    match endpoint.addr {
        IpAddress::Ipv4(ip) => SocketAddrV4::new(ip, endpoint.port),
        IpAddress::Ipv6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, endpoint.port),
    }
}

fn build_udp_packet(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>, etherparse::err::packet::BuildWriteError> {
    let builder =
        etherparse::PacketBuilder::ipv4(src.ip().octets(), dst.ip().octets(), 64)
            .udp(src.port(), dst.port());

    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut packet, payload)?;

    Ok(packet)
}
