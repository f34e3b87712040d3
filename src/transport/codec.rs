//! Length-prefixed frame codec for bus channels.
//!
//! Wraps [`tokio_util::codec::LengthDelimitedCodec`] (4-byte big-endian
//! length prefix) with a configurable maximum frame length so a hostile
//! peer cannot make the coordinator allocate an unbounded buffer.
//!
//! The frame boundary is authoritative: the codec never looks inside a frame.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::errors::ChannelError;

/// Width of the length prefix on the wire.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Frame codec used on both ends of a channel.
///
/// # Decoder
///
/// Frames announcing a length above the limit fail with
/// [`ChannelError::FrameTooLarge`] before any payload is buffered.
///
/// # Encoder
///
/// Outbound frames above the limit are refused with the same error.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a codec enforcing `max_frame_bytes` in both directions.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX_BYTES)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            inner,
            max_frame_bytes,
        }
    }

    /// Configured frame limit.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, ChannelError> {
        match self.inner.decode(src) {
            Ok(frame) => Ok(frame.map(BytesMut::freeze)),
            Err(err) => Err(self.map_error(src, &err)),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ChannelError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ChannelError> {
        if item.len() > self.max_frame_bytes {
            return Err(ChannelError::FrameTooLarge {
                size: item.len(),
                limit: self.max_frame_bytes,
            });
        }
        self.inner.encode(item, dst).map_err(ChannelError::from)
    }
}

impl FrameCodec {
    /// Map a codec error, recovering the announced length when it was the
    /// frame limit that tripped.
    fn map_error(&self, src: &BytesMut, err: &std::io::Error) -> ChannelError {
        if err.kind() == std::io::ErrorKind::InvalidData {
            let announced = src
                .get(..LENGTH_PREFIX_BYTES)
                .and_then(|prefix| <[u8; LENGTH_PREFIX_BYTES]>::try_from(prefix).ok())
                .map_or(0, |prefix| u32::from_be_bytes(prefix) as usize);
            return ChannelError::FrameTooLarge {
                size: announced,
                limit: self.max_frame_bytes,
            };
        }
        ChannelError::Io(err.to_string())
    }
}
