//! DNS messages over byte streams.
//!
//! TCP's stream-oriented nature requires a length marker before each encoded
//! message: a big-endian `u16` prefix, per RFC 1035 section 4.2.2.

use anyhow::{Context as _, Result, ensure};
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Reads one framed DNS message; `None` on clean end-of-stream.
pub(crate) async fn read_message<S>(stream: &mut S) -> Result<Option<Message>>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];

    match stream.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read DNS length header"),
    }

    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream
        .read_exact(&mut buf)
        .await
        .context("Failed to read DNS message body")?;

    let message = Message::from_vec(&buf).context("Failed to parse DNS message")?;

    Ok(Some(message))
}

/// Writes one framed DNS message.
pub(crate) async fn write_message<S>(stream: &mut S, message: &Message) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = message.to_vec().context("Failed to encode DNS message")?;

    ensure!(bytes.len() <= usize::from(u16::MAX), "DNS message too large");

    stream
        .write_all(&(bytes.len() as u16).to_be_bytes())
        .await
        .context("Failed to write DNS length header")?;
    stream
        .write_all(&bytes)
        .await
        .context("Failed to write DNS message body")?;
    stream.flush().await.context("Failed to flush DNS message")?;

    Ok(())
}
