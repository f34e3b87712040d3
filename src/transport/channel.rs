//! Framed duplex byte channel between the coordinator and one worker.
//!
//! A [`Channel`] owns one stream. Outbound frames go through a non-blocking
//! [`Channel::send`] into a byte-capped buffer drained by a writer task;
//! inbound frames are pulled lazily through [`Channel::recv`] or
//! [`Channel::frames`]. Handles are cheap clones of the same endpoint.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::errors::ChannelError;
use crate::transport::codec::{FrameCodec, LENGTH_PREFIX_BYTES};

type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChannelError>> + Send>>;

/// Size limits applied to one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    /// Largest single frame.
    pub max_frame_bytes: usize,
    /// Cap on bytes accepted by `send` but not yet written.
    pub buffer_bytes: usize,
}

impl From<&TransportConfig> for ChannelLimits {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            buffer_bytes: config.channel_buffer_bytes,
        }
    }
}

struct Inner {
    label: String,
    limits: ChannelLimits,
    outbound: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
    inbound: Mutex<Option<FrameStream>>,
    closed: CancellationToken,
}

/// One endpoint of an exclusively-owned, ordered, reliable frame channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .field("buffered", &self.buffered_bytes())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Wrap a connected stream and start its writer task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_stream<S>(label: impl Into<String>, stream: S, limits: ChannelLimits) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let inbound: FrameStream = Box::pin(FramedRead::new(
            read_half,
            FrameCodec::new(limits.max_frame_bytes),
        ));

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let closed = CancellationToken::new();

        tokio::spawn(run_writer(
            label.clone(),
            write_half,
            FrameCodec::new(limits.max_frame_bytes),
            outbound_rx,
            Arc::clone(&buffered),
            closed.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                label,
                limits,
                outbound,
                buffered,
                inbound: Mutex::new(Some(inbound)),
                closed,
            }),
        }
    }

    /// Build two connected endpoints over an in-memory duplex pipe.
    #[must_use]
    pub fn pair(limits: ChannelLimits) -> (Self, Self) {
        let pipe_capacity = (limits.max_frame_bytes + LENGTH_PREFIX_BYTES).clamp(64 * 1024, 1 << 20);
        let (left, right) = tokio::io::duplex(pipe_capacity);
        (
            Self::from_stream("pair-left", left, limits),
            Self::from_stream("pair-right", right, limits),
        )
    }

    /// Queue one frame for writing. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] after `close` or once the peer went away.
    /// - [`ChannelError::FrameTooLarge`] when the frame exceeds the limit.
    /// - [`ChannelError::Overflow`] when the outbound buffer is full; a
    ///   backpressure signal the caller is expected to retry on.
    pub fn send(&self, frame: Bytes) -> Result<(), ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let size = frame.len();
        let limits = self.inner.limits;
        if size > limits.max_frame_bytes {
            return Err(ChannelError::FrameTooLarge {
                size,
                limit: limits.max_frame_bytes,
            });
        }

        let reserved = self
            .inner
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |buffered| {
                (buffered + size <= limits.buffer_bytes).then_some(buffered + size)
            });
        if let Err(buffered) = reserved {
            return Err(ChannelError::Overflow {
                buffered,
                frame: size,
                capacity: limits.buffer_bytes,
            });
        }

        if self.inner.outbound.send(frame).is_err() {
            self.inner.buffered.fetch_sub(size, Ordering::AcqRel);
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Wait for the next inbound frame.
    ///
    /// Returns `Ok(None)` on clean end of stream, after which the channel is
    /// closed. Only one receiver makes progress at a time.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] when the channel was closed locally.
    /// - [`ChannelError::FrameTooLarge`] / [`ChannelError::Io`] on a broken
    ///   stream; the channel is closed as well.
    pub async fn recv(&self) -> Result<Option<Bytes>, ChannelError> {
        let mut guard = self.inner.inbound.lock().await;
        let Some(frames) = guard.as_mut() else {
            return Err(ChannelError::Closed);
        };

        let next = tokio::select! {
            biased;
            () = self.inner.closed.cancelled() => None,
            next = frames.next() => Some(next),
        };
        let Some(next) = next else {
            *guard = None;
            return Err(ChannelError::Closed);
        };

        match next {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => {
                warn!(channel = %self.inner.label, %err, "inbound stream failed");
                *guard = None;
                self.close();
                Err(err)
            }
            None => {
                debug!(channel = %self.inner.label, "peer closed the channel");
                *guard = None;
                self.close();
                Ok(None)
            }
        }
    }

    /// Lazy sequence of inbound frames.
    ///
    /// Ends at end of stream or once the channel is closed. Dropping the
    /// stream loses nothing; calling `frames` again resumes with the next
    /// frame.
    pub fn frames(&self) -> impl Stream<Item = Result<Bytes, ChannelError>> + '_ {
        stream::unfold(self, |channel| async move {
            match channel.recv().await {
                Ok(Some(frame)) => Some((Ok(frame), channel)),
                Ok(None) | Err(ChannelError::Closed) => None,
                Err(err) => Some((Err(err), channel)),
            }
        })
    }

    /// Close the channel. Idempotent and safe from crash paths.
    ///
    /// Pending outbound frames are abandoned; the writer shuts the stream
    /// down so the peer observes end of stream.
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            debug!(channel = %self.inner.label, "closing channel");
            self.inner.closed.cancel();
        }
    }

    /// Whether `close` ran or the stream ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Bytes accepted by `send` that the writer has not flushed yet.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.inner.buffered.load(Ordering::Acquire)
    }

    /// Label used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Limits this channel enforces.
    #[must_use]
    pub fn limits(&self) -> ChannelLimits {
        self.inner.limits
    }
}

/// Writer task: encodes queued frames and writes them in order.
///
/// Exits when the channel is closed or the stream fails; either way the
/// write side is shut down.
async fn run_writer<W>(
    label: String,
    mut writer: WriteHalf<W>,
    mut codec: FrameCodec,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    buffered: Arc<AtomicUsize>,
    closed: CancellationToken,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut scratch = BytesMut::new();
    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => break,

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let size = frame.len();
                scratch.clear();
                let written = match codec.encode(frame, &mut scratch) {
                    Ok(()) => tokio::select! {
                        biased;
                        () = closed.cancelled() => Err(ChannelError::Closed),
                        result = writer.write_all(&scratch) => result.map_err(ChannelError::from),
                    },
                    Err(err) => Err(err),
                };
                buffered.fetch_sub(size, Ordering::AcqRel);
                if matches!(written, Err(ChannelError::Closed)) {
                    break;
                }
                if let Err(err) = written {
                    warn!(channel = %label, %err, "channel write failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(channel = %label, %err, "shutdown of write side failed");
    }
    outbound_rx.close();
    debug!(channel = %label, "channel writer stopped");
}
