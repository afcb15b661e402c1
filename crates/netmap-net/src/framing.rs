//! Message framing for the directory protocol
//!
//! Provides length-prefixed framing of typed postcard payloads.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("Empty frame")]
    Empty,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Request the current network map
    GetNetworkMap = 1,
    /// Network map with cache timeout
    NetworkMap = 2,
    /// Request a node info by hash
    GetNodeInfo = 3,
    /// Signed node info
    NodeInfo = 4,
    /// Request network parameters by hash
    GetNetworkParameters = 5,
    /// Signed network parameters
    NetworkParameters = 6,
    /// Acknowledge a parameters update
    AckParametersUpdate = 7,
    /// Empty success response
    Ack = 8,
    /// Error response (payload is a UTF-8 message)
    Error = 15,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Self::GetNetworkMap),
            2 => Ok(Self::NetworkMap),
            3 => Ok(Self::GetNodeInfo),
            4 => Ok(Self::NodeInfo),
            5 => Ok(Self::GetNetworkParameters),
            6 => Ok(Self::NetworkParameters),
            7 => Ok(Self::AckParametersUpdate),
            8 => Ok(Self::Ack),
            15 => Ok(Self::Error),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Empty);
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a frame with a postcard-encoded body
    pub fn encode<T: Serialize>(frame_type: FrameType, body: &T) -> Result<Self, FrameError> {
        let payload =
            postcard::to_allocvec(body).map_err(|e| FrameError::Serialization(e.to_string()))?;
        Ok(Self::new(frame_type, payload))
    }

    /// Decode the postcard body
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        postcard::from_bytes(&self.payload).map_err(|e| FrameError::Serialization(e.to_string()))
    }

    /// Create an empty ack frame
    pub fn ack() -> Self {
        Self::new(FrameType::Ack, vec![])
    }

    /// Create an error frame
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FrameType::Error, message.into().into_bytes())
    }
}

/// Write one frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: Frame,
) -> Result<(), FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a stream, `None` on a clean close before any bytes.
///
/// The protocol is one request and one response per connection, so bytes
/// after the frame are discarded.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, FrameError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(frame) = codec.decode(&mut buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}
