//! End-to-end engine test: a guest stack dials through the tunnel service.
//!
//! Split DNS resolves a name through a protocol resolver, the answer becomes
//! a route, and a follow-up TCP connection to the answered address is
//! dispatched to that protocol's handler.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use ip_network::Ipv4Network;
use netstack::{Stack, StackConfig, StackHandle};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use warp_tunnel::{
    Capabilities, DeviceIo, HostAdapter, Protocol, Service, ServiceConfig, TcpConn,
};

const TUN_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 1);
const GUEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 2);
const RESOLVED_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 42);

#[derive(Default)]
struct FakeHost {
    added: Mutex<Vec<Ipv4Network>>,
    deleted: Mutex<Vec<Ipv4Network>>,
    resolvers: Mutex<Vec<String>>,
    tun_up: Mutex<bool>,
}

#[async_trait::async_trait]
impl HostAdapter for FakeHost {
    async fn create_tun(&self, _name: &str, _ip: Ipv4Addr, _mtu: u32) -> Result<()> {
        *self.tun_up.lock() = true;
        Ok(())
    }

    async fn delete_tun(&self, _name: &str) -> Result<()> {
        *self.tun_up.lock() = false;
        Ok(())
    }

    async fn add_route(&self, network: Ipv4Network, _gateway: Ipv4Addr) -> Result<()> {
        self.added.lock().push(network);
        Ok(())
    }

    async fn delete_route(&self, network: Ipv4Network, _gateway: Ipv4Addr) -> Result<()> {
        self.deleted.lock().push(network);
        Ok(())
    }

    async fn set_resolver(&self, domain: &str, _ip: Ipv4Addr) -> Result<()> {
        self.resolvers.lock().push(domain.to_owned());
        Ok(())
    }

    async fn remove_resolver(&self, domain: &str) -> Result<()> {
        self.resolvers.lock().retain(|d| d != domain);
        Ok(())
    }

    async fn flush_dns(&self) -> Result<()> {
        Ok(())
    }
}

/// Claims `corp.example`, answers with a fixed A record and echoes TCP.
struct EchoProtocol {
    domains: Vec<String>,
    fixed: Vec<Ipv4Network>,
    tcp_connections: AtomicUsize,
}

impl EchoProtocol {
    fn new() -> Self {
        Self {
            domains: vec!["corp.example".to_owned()],
            fixed: vec![Ipv4Network::new(Ipv4Addr::new(10, 99, 0, 0), 24).unwrap()],
            tcp_connections: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Protocol for EchoProtocol {
    fn name(&self) -> &'static str {
        "ECH"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    fn fixed_ips(&self) -> &[Ipv4Network] {
        &self.fixed
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::resolve_only().with_tcp()
    }

    async fn resolve(&self, query: Message) -> Result<Message> {
        let Some(question) = query.queries().first() else {
            bail!("no question")
        };

        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(query.op_code());
        response.set_response_code(ResponseCode::NoError);
        response.add_queries(query.queries().to_vec());
        response.add_answer(Record::from_rdata(
            question.name().clone(),
            60,
            RData::A(A(RESOLVED_IP)),
        ));

        Ok(response)
    }

    async fn handle_tcp(&self, mut conn: TcpConn) -> Result<()> {
        self.tcp_connections.fetch_add(1, Ordering::SeqCst);

        let mut buf = vec![0u8; 4096];

        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            conn.write_all(&buf[..n]).await?;
        }

        Ok(())
    }
}

struct Harness {
    guest: netstack::Connector,
    service: Arc<Service>,
    protocol: Arc<EchoProtocol>,
    host: Arc<FakeHost>,
    cancel: CancellationToken,
    service_task: tokio::task::JoinHandle<Result<()>>,
}

fn start() -> Harness {
    let cancel = CancellationToken::new();

    // The "guest" side: a second userspace stack playing the host's kernel.
    let (guest_stack, guest_handle) = Stack::new(StackConfig::new(GUEST_IP, 1400));
    let StackHandle {
        packets_in: guest_in,
        packets_out: mut guest_out,
        connector: guest,
        ..
    } = guest_handle;
    tokio::spawn(guest_stack.run(cancel.clone()));

    let (device_in_tx, device_in_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
    let (device_out_tx, mut device_out_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);

    // Guest emissions become the TUN's inbound packets and vice versa.
    tokio::spawn(async move {
        while let Some(packet) = guest_out.recv().await {
            if device_in_tx.send(packet).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(packet) = device_out_rx.recv().await {
            if guest_in.send(packet).await.is_err() {
                break;
            }
        }
    });

    let host = Arc::new(FakeHost::default());
    let protocol = Arc::new(EchoProtocol::new());

    let service = Arc::new(Service::new(
        ServiceConfig {
            name: "utun7".to_owned(),
            ip: TUN_IP,
            mtu: 1400,
            ipv6: false,
        },
        host.clone(),
    ));

    let service_task = {
        let service = service.clone();
        let protocols: Vec<Arc<dyn Protocol>> = vec![protocol.clone()];
        let cancel = cancel.clone();

        tokio::spawn(async move {
            service
                .run(
                    DeviceIo {
                        inbound: device_in_rx,
                        outbound: device_out_tx,
                    },
                    protocols,
                    cancel,
                )
                .await
        })
    };

    Harness {
        guest,
        service,
        protocol,
        host,
        cancel,
        service_task,
    }
}

fn a_query(name: &str) -> Message {
    let mut message = Message::new();
    message.set_id(0x4242);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));

    message
}

#[tokio::test]
async fn split_dns_installs_route_and_tcp_reaches_the_protocol() {
    let harness = start();

    // Resolve a claimed name over UDP against the tunnel address.
    let mut dns = harness
        .guest
        .connect_udp(SocketAddrV4::new(TUN_IP, 53))
        .await
        .unwrap();

    let query = a_query("wiki.corp.example.");
    dns.send(Bytes::from(query.to_vec().unwrap())).await.unwrap();

    let datagram = timeout(Duration::from_secs(10), dns.recv())
        .await
        .unwrap()
        .unwrap();

    let response = Message::from_vec(&datagram).unwrap();
    assert_eq!(response.id(), query.id());
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        response.answers()[0].data(),
        &RData::A(A(RESOLVED_IP))
    );

    // The answer was installed as a route owned by the protocol.
    let owner = harness.service.routes().get(RESOLVED_IP).await.unwrap();
    assert_eq!(owner.name(), "ECH");

    // A follow-up TCP connection reaches the protocol's handler.
    let mut conn = harness
        .guest
        .connect_tcp(SocketAddrV4::new(RESOLVED_IP, 443))
        .await
        .unwrap();

    conn.write_all(b"ping through the tunnel").await.unwrap();

    let mut echoed = [0u8; 23];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping through the tunnel");

    assert_eq!(harness.protocol.tcp_connections.load(Ordering::SeqCst), 1);

    // Traffic was accounted in both directions.
    let (in_total, out_total) = harness.service.traffic().totals();
    assert!(out_total >= 23);
    assert!(in_total >= 23);

    drop(conn);
    drop(dns);

    // Orderly shutdown reverts every host side effect.
    harness.cancel.cancel();
    timeout(Duration::from_secs(10), harness.service_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(harness.host.resolvers.lock().is_empty());
    assert!(!*harness.host.tun_up.lock());

    let deleted = harness.host.deleted.lock().clone();
    assert!(deleted.contains(&Ipv4Network::new(RESOLVED_IP, 32).unwrap()));
}

#[tokio::test]
async fn fixed_prefixes_are_routed_at_startup() {
    let harness = start();

    let in_fixed_range = Ipv4Addr::new(10, 99, 0, 5);

    // Startup is concurrent; poll until the fixed route appears.
    let owner = timeout(Duration::from_secs(10), async {
        loop {
            if let Some(owner) = harness.service.routes().get(in_fixed_range).await {
                break owner;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(owner.name(), "ECH");

    let listed = harness.service.routes().list().await;
    assert!(listed.contains(&Ipv4Network::new(Ipv4Addr::new(10, 99, 0, 0), 24).unwrap()));

    harness.cancel.cancel();
    let _ = timeout(Duration::from_secs(10), harness.service_task).await;
}

#[tokio::test]
async fn resolver_hints_are_written_for_claimed_domains() {
    let harness = start();

    let domains = timeout(Duration::from_secs(10), async {
        loop {
            let domains = harness.host.resolvers.lock().clone();
            if !domains.is_empty() {
                break domains;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(domains, vec!["corp.example".to_owned()]);

    harness.cancel.cancel();
    let _ = timeout(Duration::from_secs(10), harness.service_task).await;
}
