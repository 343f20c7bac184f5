// Multipart framing on a byte stream: `count:u32` then `len:u32 | bytes`
// per part, everything little-endian. Transport detail only; the client
// envelope layout lives in spire-wire.
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one multipart message. Returns `None` on a clean end of stream;
/// truncation mid-message is an error.
pub async fn read_multipart<R>(
    reader: &mut R,
    max_parts: usize,
    max_frame_bytes: usize,
) -> Result<Option<Vec<Bytes>>>
where
    R: AsyncRead + Unpin,
{
    let mut count_bytes = [0u8; 4];
    match reader.read_exact(&mut count_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read part count"),
    }
    let count = u32::from_le_bytes(count_bytes) as usize;
    if count == 0 || count > max_parts {
        bail!("part count {count} outside 1..={max_parts}");
    }

    let mut total = 0usize;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .await
            .context("read part length")?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        total = total.saturating_add(len);
        if total > max_frame_bytes {
            bail!("frame exceeds max_frame_bytes {max_frame_bytes}");
        }
        let mut part = vec![0u8; len];
        reader
            .read_exact(&mut part)
            .await
            .context("read part body")?;
        parts.push(Bytes::from(part));
    }
    Ok(Some(parts))
}

pub async fn write_multipart<W>(writer: &mut W, parts: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&(parts.len() as u32).to_le_bytes())
        .await
        .context("write part count")?;
    for part in parts {
        writer
            .write_all(&(part.len() as u32).to_le_bytes())
            .await
            .context("write part length")?;
        writer.write_all(part).await.context("write part body")?;
    }
    writer.flush().await.context("flush message")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_preserves_parts() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let parts = vec![
            Bytes::new(),
            Bytes::from_static(b"blockchain.fetch_last_height"),
            Bytes::from_static(&[1, 0, 0, 0]),
        ];
        write_multipart(&mut client, &parts).await.expect("write");

        let read = read_multipart(&mut server, 16, 4096)
            .await
            .expect("read")
            .expect("message");
        assert_eq!(read, parts);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let read = read_multipart(&mut server, 16, 4096).await.expect("read");
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn truncated_message_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Announce two parts but only deliver the count.
        client.write_all(&2u32.to_le_bytes()).await.expect("write");
        drop(client);
        assert!(read_multipart(&mut server, 16, 4096).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let parts = vec![Bytes::from(vec![0xAA; 128])];
        write_multipart(&mut client, &parts).await.expect("write");
        assert!(read_multipart(&mut server, 16, 64).await.is_err());
    }

    #[tokio::test]
    async fn zero_parts_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&0u32.to_le_bytes()).await.expect("write");
        assert!(read_multipart(&mut server, 16, 4096).await.is_err());
    }
}
