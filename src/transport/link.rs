use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::codec::{CodecError, FrameCodec, Message};

/// Write half of an established connection
#[async_trait]
pub trait LinkWriter: Send {
    /// Write one complete message (encode + flush)
    async fn write_message(&mut self, message: Message) -> Result<(), CodecError>;

    /// Flush and close the write direction
    async fn shutdown(&mut self) -> Result<(), CodecError>;
}

/// Read half of an established connection
#[async_trait]
pub trait LinkReader: Send {
    /// Read the next complete message
    ///
    /// Returns `Ok(None)` when the peer closed cleanly between messages.
    async fn read_message(&mut self) -> Result<Option<Message>, CodecError>;
}

/// An established connection split into independent directions
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

impl Link {
    /// Frame a duplex byte stream
    pub fn from_stream<S>(stream: S, codec: FrameCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_halves(read_half, write_half, codec)
    }

    /// Frame an already split byte stream
    pub fn from_halves<R, W>(reader: R, writer: W, codec: FrameCodec) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(FramedRead::new(reader, codec)),
            writer: Box::new(FramedWrite::new(writer, codec)),
        }
    }
}

#[async_trait]
impl<W> LinkWriter for FramedWrite<W, FrameCodec>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write_message(&mut self, message: Message) -> Result<(), CodecError> {
        self.send(message).await
    }

    async fn shutdown(&mut self) -> Result<(), CodecError> {
        SinkExt::close(self).await
    }
}

#[async_trait]
impl<R> LinkReader for FramedRead<R, FrameCodec>
where
    R: AsyncRead + Send + Unpin,
{
    async fn read_message(&mut self) -> Result<Option<Message>, CodecError> {
        self.next().await.transpose()
    }
}

/// Opens connections for a transport session
///
/// Implementations:
/// - [`TcpDialer`]: raw TCP socket
/// - [`super::WsDialer`]: WebSocket, one frame per binary message
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Make a single connection attempt
    async fn dial(&self) -> io::Result<Link>;

    /// Human-readable target for logs and errors
    fn target(&self) -> String;
}

/// Plain TCP dialer
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
    codec: FrameCodec,
}

impl TcpDialer {
    pub fn new(address: impl Into<String>, codec: FrameCodec) -> Self {
        Self {
            address: address.into(),
            codec,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<Link> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connection established to {}", self.address);

        let (read_half, write_half) = stream.into_split();
        Ok(Link::from_halves(read_half, write_half, self.codec))
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.address)
    }
}
