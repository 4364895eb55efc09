//! WebSocket transport
//!
//! Every binary WebSocket message carries exactly one encoded frame, so the
//! same codec (and the same size cap) applies on both transports. Text
//! messages are a protocol violation; ping/pong are skipped.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::link::{Dialer, Link, LinkReader, LinkWriter};
use crate::codec::{CodecError, FrameCodec, Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket dialer (`ws://` or `wss://`)
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
    codec: FrameCodec,
}

impl WsDialer {
    pub fn new(url: impl Into<String>, codec: FrameCodec) -> Self {
        Self {
            url: url.into(),
            codec,
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> io::Result<Link> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(io::Error::other)?;
        debug!("WebSocket connection established to {}", self.url);

        let (sink, stream) = stream.split();
        Ok(Link {
            reader: Box::new(WsReader {
                stream,
                codec: self.codec,
            }),
            writer: Box::new(WsWriter {
                sink,
                codec: self.codec,
            }),
        })
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, tungstenite::Message>,
    codec: FrameCodec,
}

#[async_trait]
impl LinkWriter for WsWriter {
    async fn write_message(&mut self, message: Message) -> Result<(), CodecError> {
        let bytes = self.codec.encode_to_bytes(message)?;
        self.sink
            .send(tungstenite::Message::Binary(bytes.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.sink.close().await.map_err(ws_error)
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
    codec: FrameCodec,
}

#[async_trait]
impl LinkReader for WsReader {
    async fn read_message(&mut self) -> Result<Option<Message>, CodecError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return self.codec.decode_exact(&data).map(Some);
                }
                Some(Ok(tungstenite::Message::Close(_))) => return Ok(None),
                Some(Ok(tungstenite::Message::Text(_))) => {
                    return Err(CodecError::Framing(
                        "unexpected text WebSocket message".to_string(),
                    ));
                }
                // Ping, Pong and raw frames
                Some(Ok(_)) => continue,
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                )) => return Ok(None),
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }
}

fn ws_error(error: tungstenite::Error) -> CodecError {
    match error {
        tungstenite::Error::Io(e) => CodecError::Io(e),
        other => CodecError::Io(io::Error::other(other)),
    }
}
