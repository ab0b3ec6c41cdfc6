use core::str;
use std::{
    fmt::Debug,
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use tokio::io::{
    AsyncRead,
    AsyncWrite,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::Message,
};

use crate::{
    serializer::serializer::SerializerType,
    transport::transport::{
        Transport,
        TransportData,
    },
};

/// A transport implemented over a WebSocket connection.
///
/// Generic over the underlying I/O stream, so plain TCP, TLS, proxied, and Unix socket
/// connections all share the same framing.
#[derive(Debug)]
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
    binary: bool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    pub fn new(stream: WebSocketStream<S>, serializer_type: SerializerType) -> Self {
        Self {
            stream,
            binary: serializer_type.is_binary(),
        }
    }
}

impl<S> Transport for WebSocketTransport<S> where S: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<S> Stream for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            match futures_util::ready!(self.stream.poll_next_unpin(cx)) {
                Some(Ok(message)) => {
                    if message.is_ping() {
                        return task::Poll::Ready(Some(Ok(TransportData::Ping(
                            message.into_data().to_vec(),
                        ))));
                    } else if message.is_pong() {
                        // Keep-alive acknowledgement; nothing to surface.
                        continue;
                    } else if message.is_text() || message.is_binary() {
                        if message.is_text() && self.binary {
                            return task::Poll::Ready(Some(Err(Error::msg("expected binary"))));
                        } else if message.is_binary() && !self.binary {
                            return task::Poll::Ready(Some(Err(Error::msg("expected text"))));
                        } else {
                            return task::Poll::Ready(Some(Ok(TransportData::Message(
                                message.into_data().to_vec(),
                            ))));
                        }
                    } else if message.is_close() {
                        return task::Poll::Ready(None);
                    } else {
                        return task::Poll::Ready(Some(Err(Error::msg(
                            "unexpected websocket message",
                        ))));
                    }
                }
                Some(Err(err)) => return task::Poll::Ready(Some(Err(err.into()))),
                None => return task::Poll::Ready(None),
            }
        }
    }
}

impl<S> Sink<TransportData> for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_ready_unpin(cx).map_err(Error::new)
    }

    fn start_send(mut self: Pin<&mut Self>, item: TransportData) -> Result<(), Self::Error> {
        let message = match item {
            TransportData::Ping(data) => Message::Pong(data.into()),
            TransportData::Message(data) => {
                if self.binary {
                    Message::Binary(data.into())
                } else {
                    Message::Text(str::from_utf8(&data)?.to_owned().into())
                }
            }
        };
        self.stream.start_send_unpin(message).map_err(Error::new)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_flush_unpin(cx).map_err(Error::new)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_close_unpin(cx).map_err(Error::new)
    }
}
