use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;

use crate::pipes::{Pipe, Pipes};
use crate::traffic::Metered;

const COPY_BUFFER: usize = 32 * 1024;
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Enables TCP keepalive on an upstream kernel socket.
///
/// The captured side is a userspace flow and has nothing to enable.
pub(crate) fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);

    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Splices a captured flow to its upstream-dialled peer.
///
/// Two concurrent copy loops; end-of-stream or an error on either side closes
/// both. The first chunk travelling towards the upstream is offered to the
/// application-protocol sniffer. The pipe stays registered for the duration.
pub(crate) async fn splice<A, B>(
    pipes: &Arc<Pipes>,
    tag: &'static str,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    captured: A,
    upstream: B,
) where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let guard = pipes.open(tag, local, remote);
    let pipe = guard.pipe();

    let (mut captured_read, mut captured_write) = tokio::io::split(captured);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let towards_upstream = async {
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut first = true;

        loop {
            let n = match captured_read.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };

            if first {
                first = false;
                pipe.sniff(&buf[..n]);
            }

            pipe.add_tx(n as u64);

            if let Err(e) = upstream_write.write_all(&buf[..n]).await {
                break Err(e);
            }
        }
    };

    let towards_guest = async {
        let mut buf = vec![0u8; COPY_BUFFER];

        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };

            pipe.add_rx(n as u64);

            if let Err(e) = captured_write.write_all(&buf[..n]).await {
                break Err(e);
            }
        }
    };

    let result = tokio::select! {
        result = towards_upstream => result,
        result = towards_guest => result,
    };

    if let Err(e) = result {
        tracing::warn!(%tag, dest = %local, "Transfer ended with error: {e}");
    }

    let _ = captured_write.shutdown().await;
    let _ = upstream_write.shutdown().await;
}

/// Datagram counterpart of [`splice`]: relays whole datagrams between the
/// captured session and the upstream session until either side goes away.
pub(crate) async fn relay(
    pipes: &Arc<Pipes>,
    tag: &'static str,
    mut captured: Metered<netstack::UdpFlow>,
    mut upstream: netstack::UdpFlow,
) {
    let guard = pipes.open(tag, captured.local_addr(), captured.remote_addr());
    let pipe: &Arc<Pipe> = guard.pipe();

    enum Side {
        FromCaptured(Option<bytes::Bytes>),
        FromUpstream(Option<bytes::Bytes>),
    }

    let mut first = true;

    loop {
        let side = tokio::select! {
            datagram = captured.recv() => Side::FromCaptured(datagram),
            datagram = upstream.recv() => Side::FromUpstream(datagram),
        };

        match side {
            Side::FromCaptured(None) | Side::FromUpstream(None) => break,
            Side::FromCaptured(Some(datagram)) => {
                if first {
                    first = false;
                    pipe.sniff(&datagram);
                }

                pipe.add_tx(datagram.len() as u64);

                if upstream.send(datagram).await.is_err() {
                    break;
                }
            }
            Side::FromUpstream(Some(datagram)) => {
                pipe.add_rx(datagram.len() as u64);

                if captured.send(datagram).await.is_err() {
                    break;
                }
            }
        }
    }
}
