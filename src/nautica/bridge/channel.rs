use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};

/// Receiving half of a channel.
#[async_trait]
pub trait MessageSource: Send {
    /// Returns the next message, or `Ok(None)` once the peer closed the channel.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Sending half of a channel.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, msg: Bytes) -> io::Result<()>;

    /// Starts closing the channel. Callers invoke this at most once.
    async fn close(&mut self) -> io::Result<()>;
}

/// A full-duplex, message-bounded byte channel, backed by either a raw stream
/// or a WebSocket.
pub struct Channel {
    pub source: Box<dyn MessageSource>,
    pub sink: Box<dyn MessageSink>,
    /// Whether closing this channel is a handshake the peer answers on the
    /// receiving half (WebSocket close frames) rather than an immediate teardown.
    pub close_handshake: bool,
}

impl Channel {
    pub fn new(
        source: impl MessageSource + 'static,
        sink: impl MessageSink + 'static,
        close_handshake: bool,
    ) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
            close_handshake,
        }
    }
}

/// Wraps a WebSocket connection. Text and binary messages are both delivered as
/// opaque bytes; outgoing messages are always sent as binary frames.
pub fn ws_channel<S>(ws: WebSocketStream<S>) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Channel::new(WsSource { stream }, WsSink { sink }, true)
}

/// Wraps a raw byte stream. Each read of up to `buffer_size` bytes becomes one message.
pub fn stream_channel<S>(stream: S, buffer_size: usize) -> Channel
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let buffer_size = buffer_size.max(1);
    Channel::new(
        StreamSource {
            reader,
            buf: BytesMut::with_capacity(buffer_size),
            buffer_size,
        },
        StreamSink { writer },
        false,
    )
}

struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> MessageSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(msg @ (Message::Binary(_) | Message::Text(_)))) => {
                    return Ok(Some(msg.into_data()));
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(err)) => return Err(ws_err(err)),
            }
        }
    }
}

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, msg: Bytes) -> io::Result<()> {
        self.sink.send(Message::binary(msg)).await.map_err(ws_err)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(ws_err(err)),
        }
    }
}

fn ws_err(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

struct StreamSource<S> {
    reader: ReadHalf<S>,
    buf: BytesMut,
    buffer_size: usize,
}

#[async_trait]
impl<S> MessageSource for StreamSource<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        self.buf.reserve(self.buffer_size);
        let n = (&mut self.reader)
            .take(self.buffer_size as u64)
            .read_buf(&mut self.buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

struct StreamSink<S> {
    writer: WriteHalf<S>,
}

#[async_trait]
impl<S> MessageSink for StreamSink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, msg: Bytes) -> io::Result<()> {
        self.writer.write_all(&msg).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.writer.shutdown().await {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }
}
