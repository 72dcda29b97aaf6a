//! Wire framing for peer messages.
//!
//! Every message travels as `[type u8][len u32 BE][payload]`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size in bytes: 1 byte type + 4 byte length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest accepted payload. A full chunk plus its envelope fits comfortably.
pub const MAX_PAYLOAD_LEN: usize = 2 * 1024 * 1024;

/// Parsed frame view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Message type byte.
    pub msg_type: u8,
    /// Frame payload.
    pub payload: &'a [u8],
    /// Total frame size (header + payload).
    pub total_size: usize,
}

/// Errors when encoding or decoding a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Input does not contain a full frame.
    TooShort,
    /// Trailing bytes after a complete frame.
    TrailingBytes,
    /// Payload length exceeds [`MAX_PAYLOAD_LEN`].
    PayloadTooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "frame too short"),
            FrameError::TrailingBytes => write!(f, "trailing bytes after frame"),
            FrameError::PayloadTooLarge(len) => write!(f, "payload too large: {} bytes", len),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode a framed message as `[type][len][payload]`.
pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    bytes.push(msg_type);
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

fn payload_len(header: &[u8]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(len));
    }
    Ok(len)
}

/// Decode a frame from bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort);
    }

    let total_size = FRAME_HEADER_LEN + payload_len(bytes)?;
    if bytes.len() < total_size {
        return Err(FrameError::TooShort);
    }

    Ok(Frame {
        msg_type: bytes[0],
        payload: &bytes[FRAME_HEADER_LEN..total_size],
        total_size,
    })
}

/// Decode a frame and require that it consumes the full buffer.
pub fn decode_frame_exact(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    let frame = decode_frame(bytes)?;
    if frame.total_size != bytes.len() {
        return Err(FrameError::TrailingBytes);
    }
    Ok(frame)
}

/// Read one whole frame (header included) from a stream.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = payload_len(&header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + len);
    frame.extend_from_slice(&header);
    frame.resize(FRAME_HEADER_LEN + len, 0);
    reader.read_exact(&mut frame[FRAME_HEADER_LEN..]).await?;
    Ok(Some(frame))
}

/// Write an encoded frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_short_input() {
        assert_eq!(decode_frame(&[1, 0, 0]), Err(FrameError::TooShort));
        assert_eq!(decode_frame(&[1, 0, 0, 0, 4, 9]), Err(FrameError::TooShort));
    }

    #[test]
    fn test_decode_exact_rejects_trailing() {
        let mut bytes = encode_frame(7, b"abc").unwrap();
        bytes.push(0);
        assert_eq!(decode_frame_exact(&bytes), Err(FrameError::TrailingBytes));

        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.msg_type, 7);
        assert_eq!(frame.payload, b"abc");
        assert_eq!(frame.total_size, 8);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_frame(1, &big),
            Err(FrameError::PayloadTooLarge(_))
        ));

        let mut header = vec![1u8];
        header.extend_from_slice(&((MAX_PAYLOAD_LEN + 1) as u32).to_be_bytes());
        assert!(matches!(
            decode_frame(&header),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_framing() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let first = encode_frame(1, b"hello").unwrap();
        let second = encode_frame(2, b"").unwrap();

        write_frame(&mut a, &first).await.unwrap();
        write_frame(&mut a, &second).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }
}
