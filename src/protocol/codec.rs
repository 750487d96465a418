/// Newline-delimited framing over a byte stream.
///
/// A TCP read may return half a message or several at once, so frames
/// are accumulated until the `\n` delimiter is seen. JSON encoding
/// escapes newlines inside strings, which keeps the delimiter unambiguous.
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{Message, ProtocolError};

/// Upper bound for a single frame: 16 MiB
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads delimited frames from a buffered async reader.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_LEN)
    }

    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            limit,
        }
    }

    /// Returns the next complete frame without its delimiter, or `None`
    /// on a clean end of stream.
    ///
    /// Cancel safe: partially received bytes stay buffered, so this can
    /// be used as a `tokio::select!` branch.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                self.buf.clear();
                return Err(ProtocolError::TruncatedFrame);
            }

            let (taken, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            self.buf.extend_from_slice(&available[..taken]);
            self.reader.consume(taken);

            // +1 leaves room for the delimiter itself
            if self.buf.len() > self.limit + 1 {
                self.buf.clear();
                return Err(ProtocolError::FrameTooLarge { limit: self.limit });
            }

            if complete {
                let mut frame = std::mem::take(&mut self.buf);
                frame.pop();
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                if frame.is_empty() {
                    continue;
                }
                return Ok(Some(frame));
            }
        }
    }

    /// Reads and decodes the next message.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.next_frame().await? {
            Some(frame) => Message::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes one message as a frame and flushes it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await
}
