use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, Stdin, Stdout, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::debug;

/// Inbound frames longer than this are rejected instead of buffered.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Newline-delimited JSON over any byte stream pair.
///
/// Reading is cancel-safe: dropping a pending [`next_frame`](Self::next_frame)
/// loses no bytes.
pub struct LineTransport<R, W> {
    reader: FramedRead<R, LinesCodec>,
    writer: FramedWrite<W, LinesCodec>,
    max_frame_bytes: usize,
}

impl LineTransport<Stdin, Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<S> LineTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite,
{
    /// Splits a bidirectional stream (TCP socket, duplex pipe).
    pub fn split(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_max_frame(reader, writer, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame(reader: R, writer: W, max_frame_bytes: usize) -> Self {
        Self {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes)),
            writer: FramedWrite::new(writer, LinesCodec::new()),
            max_frame_bytes,
        }
    }

    /// Next frame, or `None` at end of stream. An oversized frame yields
    /// [`TransportError::FrameTooLarge`], after which the reader should be
    /// considered finished.
    pub async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        match self.reader.next().await {
            None => Ok(None),
            Some(Ok(line)) => {
                debug!("Received: {}", line);
                Ok(Some(line))
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                Err(TransportError::FrameTooLarge(self.max_frame_bytes))
            }
            Some(Err(LinesCodecError::Io(e))) => Err(TransportError::Io(e)),
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)?;
        debug!("Sending: {}", json);
        self.writer.send(json).await.map_err(|e| match e {
            LinesCodecError::Io(e) => TransportError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                TransportError::FrameTooLarge(self.max_frame_bytes)
            }
        })
    }
}
