use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::stack::Command;

/// Largest chunk a single `poll_write` moves into the stack.
const WRITE_CHUNK: usize = 8 * 1024;

/// A captured (or dialled) TCP connection, materialised as a byte stream.
///
/// `local_addr` is the destination the peer was talking to, `remote_addr` is
/// the peer itself. Closing the write half sends a FIN once buffered data has
/// drained; dropping the flow entirely closes the underlying socket.
pub struct TcpFlow {
    local: SocketAddrV4,
    remote: SocketAddrV4,

    rx: mpsc::Receiver<Bytes>,
    current: Bytes,

    tx: PollSender<Bytes>,

    cmd: mpsc::UnboundedSender<Command>,
}

impl TcpFlow {
    pub(crate) fn new(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        cmd: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            local,
            remote,
            rx,
            current: Bytes::new(),
            tx: PollSender::new(tx),
            cmd,
        }
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }
}

impl AsyncRead for TcpFlow {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.current.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.current = chunk,
                None => return Poll::Ready(Ok(())), // EOF
            }
        }

        let n = usize::min(buf.remaining(), this.current.len());
        buf.put_slice(&this.current.split_to(n));

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpFlow {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let n = usize::min(data.len(), WRITE_CHUNK);

        if this.tx.send_item(Bytes::copy_from_slice(&data[..n])).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let _ = this.cmd.send(Command::Poke);

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        this.tx.close();
        let _ = this.cmd.send(Command::Poke);

        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpFlow {
    fn drop(&mut self) {
        let _ = self.cmd.send(Command::Poke);
    }
}

impl std::fmt::Debug for TcpFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpFlow")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// The session has been torn down on the stack side.
#[derive(Debug, thiserror::Error)]
#[error("datagram session closed")]
pub struct SessionClosed;

/// A captured (or dialled) UDP session, materialised as a datagram channel.
pub struct UdpFlow {
    local: SocketAddrV4,
    remote: SocketAddrV4,

    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,

    cmd: mpsc::UnboundedSender<Command>,
}

impl UdpFlow {
    pub(crate) fn new(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Bytes>,
        cmd: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            local,
            remote,
            rx,
            tx,
            cmd,
        }
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    /// Receive the next datagram payload; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Send one datagram payload towards the remote.
    pub async fn send(&self, datagram: Bytes) -> Result<(), SessionClosed> {
        self.tx.send(datagram).await.map_err(|_| SessionClosed)?;
        let _ = self.cmd.send(Command::Poke);

        Ok(())
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        let _ = self.cmd.send(Command::Poke);
    }
}

impl std::fmt::Debug for UdpFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpFlow")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
