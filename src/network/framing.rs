//! Length-prefixed framing for the TCP channels
//!
//! Frame layout: `MAGIC (4) | payload length (u32 BE) | payload`.
//! A stream that ends exactly on a frame boundary is a clean close; one that
//! ends inside a frame, or announces an implausible length, is a
//! [`FramingError`] and the connection must be dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::StreamExt;
use futures::Stream;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Magic bytes opening every frame
pub const MAGIC: [u8; 4] = *b"PGOS";

/// Size of the frame header (magic + length)
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum payload size accepted from a peer (8 MiB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Framing errors. Any of these makes the connection unusable.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid magic bytes: {0:02x?}")]
    InvalidMagic([u8; 4]),
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
    #[error("Connection closed mid-frame ({0} bytes buffered)")]
    Truncated(usize),
}

/// Codec delimiting raw payloads
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn write_frame(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FramingError> {
        if payload.len() > self.max_frame_size {
            return Err(FramingError::FrameTooLarge(payload.len(), self.max_frame_size));
        }

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);

        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame a payload. Fails for payloads over [`MAX_FRAME_SIZE`].
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FramingError> {
    let mut dst = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    FrameCodec::new().write_frame(payload, &mut dst)?;
    Ok(dst.freeze())
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.write_frame(&item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Reject a bad magic as soon as it is visible
        let visible = src.len().min(MAGIC.len());
        if src[..visible] != MAGIC[..visible] {
            let mut magic = [0u8; 4];
            magic[..visible].copy_from_slice(&src[..visible]);
            return Err(FramingError::InvalidMagic(magic));
        }

        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > self.max_frame_size {
            return Err(FramingError::FrameTooLarge(len, self.max_frame_size));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FramingError::Truncated(buf.len())),
        }
    }
}

/// Read the next frame from a framed connection.
///
/// Waits until a whole frame is available. `Ok(None)` means the peer closed
/// the connection cleanly between frames; an error means the connection is
/// unusable and should be closed.
pub async fn receive_framed_segment<S>(frames: &mut S) -> Result<Option<Bytes>, FramingError>
where
    S: Stream<Item = Result<Bytes, FramingError>> + Unpin,
{
    frames.next().await.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{Framed, FramedRead};

    #[test]
    fn test_frame_codec() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();
        assert_eq!(&buf[..], &encode_frame(b"hello").unwrap()[..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let frame = encode_frame(b"partial payload").unwrap();
        let mut buf = BytesMut::from(&frame[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[10..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"partial payload");
    }

    #[test]
    fn test_invalid_magic() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(17);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::FrameTooLarge(17, 16))
        ));
    }

    #[test]
    fn test_eof_mid_frame_is_truncated() {
        let mut codec = FrameCodec::new();
        let frame = encode_frame(b"cut short").unwrap();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FramingError::Truncated(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut frames = FramedRead::new(server, FrameCodec::new());
        assert!(receive_framed_segment(&mut frames).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_frame_is_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let frame = encode_frame(b"never finished").unwrap();
        client.write_all(&frame[..6]).await.unwrap();
        drop(client);

        let mut frames = FramedRead::new(server, FrameCodec::new());
        assert!(matches!(
            receive_framed_segment(&mut frames).await,
            Err(FramingError::Truncated(6))
        ));
    }

    #[tokio::test]
    async fn test_successive_frames_on_one_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = Framed::new(client, FrameCodec::new());
        let mut frames = FramedRead::new(server, FrameCodec::new());

        writer.send(Bytes::from_static(b"first")).await.unwrap();
        writer.send(Bytes::from_static(b"")).await.unwrap();
        writer.send(Bytes::from_static(b"third")).await.unwrap();
        drop(writer);

        assert_eq!(&receive_framed_segment(&mut frames).await.unwrap().unwrap()[..], b"first");
        assert!(receive_framed_segment(&mut frames).await.unwrap().unwrap().is_empty());
        assert_eq!(&receive_framed_segment(&mut frames).await.unwrap().unwrap()[..], b"third");
        assert!(receive_framed_segment(&mut frames).await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..4096), 1..8),
            split in any::<prop::sample::Index>(),
        ) {
            let mut wire = BytesMut::new();
            for p in &payloads {
                wire.extend_from_slice(&encode_frame(p).unwrap());
            }

            // Deliver the stream in two arbitrary chunks
            let at = split.index(wire.len() + 1);
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::from(&wire[..at]);
            let mut decoded = Vec::new();
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame.to_vec());
            }
            buf.extend_from_slice(&wire[at..]);
            while let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
                decoded.push(frame.to_vec());
            }

            prop_assert_eq!(decoded, payloads);
        }
    }

    #[test]
    fn test_oversized_payload_not_encoded() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(FramingError::FrameTooLarge(len, MAX_FRAME_SIZE)) if len == MAX_FRAME_SIZE + 1
        ));

        let mut buf = BytesMut::new();
        assert!(FrameCodec::new().encode(Bytes::from(payload), &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let payload = vec![0xAB; MAX_FRAME_SIZE];
        let mut buf = BytesMut::from(&encode_frame(&payload).unwrap()[..]);
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_SIZE);
    }
}
