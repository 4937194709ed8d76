use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use netstack::{Connector, Stack, StackConfig, TcpFlow, UdpFlow};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, DropGuard};

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 99, 0, 5), 443);

/// Two stacks wired back-to-back: everything the client stack emits is fed
/// into the server stack and vice versa.
fn spawn_pair() -> (
    Connector,
    mpsc::Receiver<TcpFlow>,
    mpsc::Receiver<UdpFlow>,
    DropGuard,
) {
    let (client_stack, client_handle) = Stack::new(StackConfig::new(CLIENT_IP, 1400));
    let (server_stack, server_handle) = Stack::new(StackConfig::new(SERVER_IP, 1400));

    let cancel = CancellationToken::new();

    tokio::spawn(client_stack.run(cancel.clone()));
    tokio::spawn(server_stack.run(cancel.clone()));

    let mut client_out = client_handle.packets_out;
    let server_in = server_handle.packets_in;
    tokio::spawn(async move {
        while let Some(packet) = client_out.recv().await {
            if server_in.send(packet).await.is_err() {
                break;
            }
        }
    });

    let mut server_out = server_handle.packets_out;
    let client_in = client_handle.packets_in;
    tokio::spawn(async move {
        while let Some(packet) = server_out.recv().await {
            if client_in.send(packet).await.is_err() {
                break;
            }
        }
    });

    (
        client_handle.connector,
        server_handle.tcp_accept,
        server_handle.udp_accept,
        cancel.drop_guard(),
    )
}

#[tokio::test]
async fn tcp_connect_accept_and_exchange() {
    let (connector, mut tcp_accept, _udp_accept, _guard) = spawn_pair();

    let client = tokio::spawn(async move {
        let mut flow = connector.connect_tcp(TARGET).await.unwrap();

        flow.write_all(b"hello from the guest").await.unwrap();

        let mut response = [0u8; 8];
        flow.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"answered");

        flow.shutdown().await.unwrap();

        // The server closes after us; drain until EOF.
        let mut rest = Vec::new();
        flow.read_to_end(&mut rest).await.unwrap();
    });

    let mut flow = timeout(Duration::from_secs(10), tcp_accept.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(flow.local_addr(), TARGET);
    assert_eq!(*flow.remote_addr().ip(), CLIENT_IP);

    let mut request = [0u8; 20];
    flow.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"hello from the guest");

    flow.write_all(b"answered").await.unwrap();

    // Client FIN surfaces as EOF.
    let mut rest = Vec::new();
    flow.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    flow.shutdown().await.unwrap();

    timeout(Duration::from_secs(10), client)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn tcp_bulk_transfer_is_byte_exact() {
    let (connector, mut tcp_accept, _udp_accept, _guard) = spawn_pair();

    let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let client = tokio::spawn(async move {
        let mut flow = connector.connect_tcp(TARGET).await.unwrap();

        flow.write_all(&payload).await.unwrap();
        flow.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        flow.read_to_end(&mut echoed).await.unwrap();

        echoed
    });

    let mut flow = timeout(Duration::from_secs(10), tcp_accept.recv())
        .await
        .unwrap()
        .unwrap();

    let mut received = Vec::new();
    flow.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, expected);

    flow.write_all(&received).await.unwrap();
    flow.shutdown().await.unwrap();
    drop(flow);

    let echoed = timeout(Duration::from_secs(30), client)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(echoed, expected);
}

#[tokio::test]
async fn udp_session_roundtrip() {
    let (connector, _tcp_accept, mut udp_accept, _guard) = spawn_pair();

    let target = SocketAddrV4::new(Ipv4Addr::new(10, 99, 0, 7), 53);

    let mut client_flow = connector.connect_udp(target).await.unwrap();
    client_flow
        .send(Bytes::from_static(b"query"))
        .await
        .unwrap();

    let mut server_flow = timeout(Duration::from_secs(10), udp_accept.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(server_flow.local_addr(), target);
    assert_eq!(*server_flow.remote_addr().ip(), CLIENT_IP);

    let datagram = timeout(Duration::from_secs(10), server_flow.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&datagram[..], b"query");

    server_flow
        .send(Bytes::from_static(b"response"))
        .await
        .unwrap();

    let datagram = timeout(Duration::from_secs(10), client_flow.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&datagram[..], b"response");
}

#[tokio::test]
async fn second_connection_to_same_port_is_accepted() {
    let (connector, mut tcp_accept, _udp_accept, _guard) = spawn_pair();

    let mut first = connector.connect_tcp(TARGET).await.unwrap();
    let mut first_server = timeout(Duration::from_secs(10), tcp_accept.recv())
        .await
        .unwrap()
        .unwrap();

    let mut second = connector.connect_tcp(TARGET).await.unwrap();
    let mut second_server = timeout(Duration::from_secs(10), tcp_accept.recv())
        .await
        .unwrap()
        .unwrap();

    assert_ne!(first.local_addr(), second.local_addr());
    assert_ne!(first_server.remote_addr(), second_server.remote_addr());

    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();

    let mut buf = [0u8; 3];
    first_server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one");

    second_server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");
}
