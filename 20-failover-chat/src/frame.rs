//! Length-prefixed framing for client and peer-link traffic.
//!
//! Every message on the wire is `[u32 BE length][kind u8][payload]` where
//! `length` counts the kind byte plus the UTF-8 payload. The reader keeps
//! partially received bytes in its own buffer, so one call to
//! [`FramedReader::receive`] always yields exactly one message no matter
//! how the transport chunked or merged the bytes.

use std::{fmt, sync::Arc};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::debug;

use crate::error::{ChannelError, FrameError};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest accepted frame body (kind byte plus payload): 16 MiB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Payload of the HEARTBEAT frame that opens a peer link. Liveness pings
/// carry an empty payload, so the two never collide.
pub const PEER_HANDSHAKE: &str = "PEER-LINK-HELLO";

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    User,
    Heartbeat,
}

impl Kind {
    fn as_byte(self) -> u8 {
        match self {
            Kind::User => 0,
            Kind::Heartbeat => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0 => Ok(Kind::User),
            1 => Ok(Kind::Heartbeat),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A single framed message. The payload is shared, so cloning a message
/// for every broadcast recipient does not copy the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: Kind,
    payload: Arc<str>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            kind: Kind::User,
            payload: Arc::from(text.into()),
        }
    }

    /// Liveness ping sent from the primary to the backup.
    pub fn heartbeat() -> Self {
        Self {
            kind: Kind::Heartbeat,
            payload: Arc::from(""),
        }
    }

    /// First frame on a peer link, marking the connection as replication
    /// traffic rather than a client.
    pub fn peer_handshake() -> Self {
        Self {
            kind: Kind::Heartbeat,
            payload: Arc::from(PEER_HANDSHAKE),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.payload
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == Kind::Heartbeat
    }

    pub fn is_peer_handshake(&self) -> bool {
        self.kind == Kind::Heartbeat && &*self.payload == PEER_HANDSHAKE
    }

    /// Bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + 1 + self.payload.len()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload)
    }
}

/// Appends the wire encoding of `message` to `buf`.
pub fn encode(message: &Message, buf: &mut BytesMut) -> Result<(), FrameError> {
    let body_len = 1 + message.payload.len();
    if body_len > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized {
            len: body_len,
            max: MAX_FRAME_SIZE,
        });
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(message.kind.as_byte());
    buf.put_slice(message.payload.as_bytes());
    Ok(())
}

/// Decodes one message from the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed. On success the consumed
/// bytes are removed from the buffer; on error the buffer is left as is
/// and the connection should be dropped.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, FrameError> {
    let Some(body_len) = peek_body_len(buf)? else {
        return Ok(None);
    };

    let total = LENGTH_PREFIX_SIZE + body_len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let kind = Kind::from_byte(buf[LENGTH_PREFIX_SIZE])?;
    let payload = std::str::from_utf8(&buf[LENGTH_PREFIX_SIZE + 1..total])
        .map_err(|_| FrameError::InvalidUtf8)?;
    let message = Message {
        kind,
        payload: Arc::from(payload),
    };

    buf.advance(total);
    Ok(Some(message))
}

fn peek_body_len(buf: &BytesMut) -> Result<Option<usize>, FrameError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = &buf[..LENGTH_PREFIX_SIZE];
    let body_len = prefix.get_u32() as usize;
    if body_len == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if body_len > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized {
            len: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(Some(body_len))
}

/// Reading half of a framed channel.
pub struct FramedReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Waits for the next complete message.
    ///
    /// Cancel safe: bytes read before a cancelled call stay buffered and
    /// are picked up by the next call.
    pub async fn receive(&mut self) -> Result<Message, ChannelError> {
        loop {
            if let Some(message) = decode(&mut self.buffer)? {
                return Ok(message);
            }

            match self.inner.read_buf(&mut self.buffer).await {
                Ok(0) => return Err(self.eof_error()),
                Ok(_) => {}
                Err(err) => {
                    debug!(error = ?err, "read failed");
                    return Err(ChannelError::Closed);
                }
            }
        }
    }

    fn eof_error(&self) -> ChannelError {
        if self.buffer.is_empty() {
            return ChannelError::Closed;
        }

        let needed = match peek_body_len(&self.buffer) {
            Ok(Some(body_len)) => LENGTH_PREFIX_SIZE + body_len,
            _ => LENGTH_PREFIX_SIZE,
        };
        ChannelError::Malformed(FrameError::Truncated {
            needed,
            available: self.buffer.len(),
        })
    }
}

/// Writing half of a framed channel.
pub struct FramedWriter<W> {
    inner: W,
    buffer: BytesMut,
}

impl<W> FramedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Writes and flushes one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        self.buffer.clear();
        encode(message, &mut self.buffer)?;

        if let Err(err) = self.inner.write_all(&self.buffer).await {
            debug!(error = ?err, "write failed");
            return Err(ChannelError::Closed);
        }
        if let Err(err) = self.inner.flush().await {
            debug!(error = ?err, "flush failed");
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(err) = self.inner.shutdown().await {
            debug!(error = ?err, "failed to shut down writer cleanly");
        }
    }
}

/// Splits a TCP stream into framed halves.
pub fn split_tcp(
    stream: TcpStream,
) -> (FramedReader<OwnedReadHalf>, FramedWriter<OwnedWriteHalf>) {
    let (reader, writer) = stream.into_split();
    (FramedReader::new(reader), FramedWriter::new(writer))
}

/// Splits any bidirectional stream into framed halves.
pub fn split<S>(stream: S) -> (FramedReader<ReadHalf<S>>, FramedWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    (FramedReader::new(reader), FramedWriter::new(writer))
}
