//! Frame codec for the IPC wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(kind byte) + sizeof(payload), NOT including the 4-byte
//! prefix.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Request from client.
    Request = 0x01,
    /// Single response to client.
    Response = 0x02,
    /// Streaming response chunk.
    StreamChunk = 0x03,
    /// End of streaming response.
    StreamEnd = 0x04,
    /// Error response to client.
    Error = 0xFF,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Request),
            0x02 => Some(FrameKind::Response),
            0x03 => Some(FrameKind::StreamChunk),
            0x04 => Some(FrameKind::StreamEnd),
            0xFF => Some(FrameKind::Error),
            _ => None,
        }
    }
}

/// Read one frame from the stream.
///
/// Returns `(kind, payload_bytes)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the maximum accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(FrameKind, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too short: missing kind byte",
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let kind = FrameKind::from_byte(frame_data[0]).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown frame kind: 0x{:02X}", frame_data[0]),
        )
    })?;
    Ok(Some((kind, frame_data[1..].to_vec())))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = 1u32 + payload.len() as u32;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[kind as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, FrameKind::Request, b"hello")
            .await
            .unwrap();
        let (kind, payload) = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(kind, FrameKind::Request);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, FrameKind::Request, &[0u8; 256])
            .await
            .unwrap();
        assert!(read_frame(&mut server, 16).await.is_err());
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&2u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0x7E, 0x00]).await.unwrap();
        assert!(read_frame(&mut server, 64).await.is_err());
    }
}
