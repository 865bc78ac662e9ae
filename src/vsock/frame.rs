//! Wire framing: a 1-byte stream tag, a big-endian u32 length, then the
//! payload. Frames are never partially written; reads distinguish a clean
//! close at a frame boundary from a truncated frame.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::VsockError;

pub const HEADER_LEN: usize = 5;

/// Multiplexed stream carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Error = 3,
    Resize = 4,
}

impl TryFrom<u8> for StreamType {
    type Error = VsockError;

    fn try_from(value: u8) -> Result<Self, VsockError> {
        match value {
            0 => Ok(StreamType::Stdin),
            1 => Ok(StreamType::Stdout),
            2 => Ok(StreamType::Stderr),
            3 => Ok(StreamType::Error),
            4 => Ok(StreamType::Resize),
            other => Err(VsockError::UnknownStream(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamType,
    pub payload: Bytes,
}

/// Encode a frame into a fresh buffer (header + payload).
pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(stream as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Write one frame. `write_all` retries short writes, so the header and
/// payload always land completely or the write errors.
pub async fn write_frame<W>(
    writer: &mut W,
    stream: StreamType,
    payload: &[u8],
) -> Result<(), VsockError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    header[0] = stream as u8;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed at a frame boundary;
/// a close mid-frame is a [`VsockError::TruncatedFrame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, VsockError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let stream = StreamType::try_from(header[0])?;
    let len = u32::from_be_bytes(header[1..].try_into().expect("4-byte length")) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            VsockError::TruncatedFrame
        } else {
            VsockError::Io(e)
        }
    })?;

    Ok(Some(Frame {
        stream,
        payload: payload.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STREAMS: [StreamType; 5] = [
        StreamType::Stdin,
        StreamType::Stdout,
        StreamType::Stderr,
        StreamType::Error,
        StreamType::Resize,
    ];

    #[tokio::test]
    async fn round_trip_every_stream_type() {
        for stream in ALL_STREAMS {
            let payload = b"payload bytes \x00\xff";
            let encoded = encode_frame(stream, payload);
            let mut cursor = encoded.as_slice();
            let frame = read_frame(&mut cursor).await.unwrap().unwrap();
            assert_eq!(frame.stream, stream);
            assert_eq!(&frame.payload[..], payload);
            assert!(cursor.is_empty());
        }
    }

    #[tokio::test]
    async fn round_trip_empty_payload() {
        let encoded = encode_frame(StreamType::Stdout, b"");
        let mut cursor = encoded.as_slice();
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame.stream, StreamType::Stdout);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn concatenated_frames_parse_in_order() {
        let mut wire = encode_frame(StreamType::Stdout, b"first");
        wire.extend(encode_frame(StreamType::Stderr, b"second"));
        wire.extend(encode_frame(StreamType::Error, b"third"));

        let mut cursor = wire.as_slice();
        let a = read_frame(&mut cursor).await.unwrap().unwrap();
        let b = read_frame(&mut cursor).await.unwrap().unwrap();
        let c = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!((a.stream, &a.payload[..]), (StreamType::Stdout, &b"first"[..]));
        assert_eq!((b.stream, &b.payload[..]), (StreamType::Stderr, &b"second"[..]));
        assert_eq!((c.stream, &c.payload[..]), (StreamType::Error, &b"third"[..]));
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_frame_matches_encode_frame() {
        let mut written = Vec::new();
        write_frame(&mut written, StreamType::Resize, b"{}")
            .await
            .unwrap();
        assert_eq!(written, encode_frame(StreamType::Resize, b"{}"));
    }

    #[tokio::test]
    async fn header_layout_is_tag_then_be_length() {
        let encoded = encode_frame(StreamType::Stderr, &[0xaa; 300]);
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..5], &300u32.to_be_bytes());
        assert_eq!(encoded.len(), HEADER_LEN + 300);
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let mut cursor: &[u8] = &[];
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let mut encoded = encode_frame(StreamType::Stdout, b"full payload");
        encoded.truncate(HEADER_LEN + 4);
        let mut cursor = encoded.as_slice();
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, VsockError::TruncatedFrame));
    }

    #[tokio::test]
    async fn unknown_stream_tag_is_an_error() {
        let mut encoded = encode_frame(StreamType::Stdin, b"x");
        encoded[0] = 9;
        let mut cursor = encoded.as_slice();
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, VsockError::UnknownStream(9)));
    }
}
