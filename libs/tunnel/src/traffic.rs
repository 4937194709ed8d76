use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use netstack::{SessionClosed, TcpFlow, UdpFlow};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Process-global traffic accounting.
///
/// `out` counts bytes leaving through an upstream (captured side read),
/// `in` counts bytes coming back. Byte counters are lock-free; only the
/// rate-sampling timestamp takes a mutex.
#[derive(Debug)]
pub struct Traffic {
    transferred_in: AtomicU64,
    transferred_out: AtomicU64,
    transferred_in_total: AtomicU64,
    transferred_out_total: AtomicU64,
    last_sample: parking_lot::Mutex<Instant>,
}

impl Default for Traffic {
    fn default() -> Self {
        Self {
            transferred_in: AtomicU64::new(0),
            transferred_out: AtomicU64::new(0),
            transferred_in_total: AtomicU64::new(0),
            transferred_out_total: AtomicU64::new(0),
            last_sample: parking_lot::Mutex::new(Instant::now()),
        }
    }
}

impl Traffic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(&self, bytes: u64) {
        self.transferred_in.fetch_add(bytes, Ordering::Relaxed);
        self.transferred_in_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: u64) {
        self.transferred_out.fetch_add(bytes, Ordering::Relaxed);
        self.transferred_out_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bit rates (in, out) since the previous sample; resets the window.
    pub fn rates(&self) -> (f64, f64) {
        let in_bytes = self.transferred_in.swap(0, Ordering::Relaxed);
        let out_bytes = self.transferred_out.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last_sample = self.last_sample.lock();
            let elapsed = last_sample.elapsed().as_secs_f64();
            *last_sample = Instant::now();

            elapsed
        };

        if elapsed <= 0.0 {
            return (0.0, 0.0);
        }

        (
            (in_bytes * 8) as f64 / elapsed,
            (out_bytes * 8) as f64 / elapsed,
        )
    }

    /// Cumulative (in, out) byte totals; monotonically non-decreasing.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.transferred_in_total.load(Ordering::Relaxed),
            self.transferred_out_total.load(Ordering::Relaxed),
        )
    }
}

/// Wraps a captured flow so everything it moves is added to the meter.
pub struct Metered<T> {
    inner: T,
    traffic: Arc<Traffic>,
}

impl<T> Metered<T> {
    pub fn new(inner: T, traffic: Arc<Traffic>) -> Self {
        Self { inner, traffic }
    }
}

impl Metered<TcpFlow> {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.inner.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.inner.remote_addr()
    }
}

impl Metered<UdpFlow> {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.inner.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.inner.remote_addr()
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        let datagram = self.inner.recv().await?;
        self.traffic.record_out(datagram.len() as u64);

        Some(datagram)
    }

    pub async fn send(&self, datagram: Bytes) -> Result<(), SessionClosed> {
        let len = datagram.len() as u64;
        self.inner.send(datagram).await?;
        self.traffic.record_in(len);

        Ok(())
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Metered<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &result {
            this.traffic.record_out((buf.filled().len() - before) as u64);
        }

        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Metered<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let result = Pin::new(&mut this.inner).poll_write(cx, data);

        if let Poll::Ready(Ok(n)) = &result {
            this.traffic.record_in(*n as u64);
        }

        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
