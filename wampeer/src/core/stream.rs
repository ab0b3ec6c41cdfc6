use std::{
    fmt::Debug,
    pin::Pin,
    sync::Arc,
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
use tokio::sync::mpsc;

use crate::{
    message::message::Message,
    serializer::serializer::Serializer,
    transport::transport::{
        Transport,
        TransportData,
    },
};

/// A message passing over a [`MessageStream`].
pub enum StreamMessage {
    Ping(Vec<u8>),
    Message(Message),
}

/// A stream of WAMP messages over some connection to a router.
///
/// Everything above this layer deals in parsed messages, so in-process connections can bypass
/// framing and serialization entirely.
pub trait MessageStream:
    Send + Stream<Item = Result<StreamMessage>> + Sink<StreamMessage, Error = Error> + Unpin + Debug
{
}

/// A [`MessageStream`] over a [`Transport`], serializing messages as they pass through.
#[derive(Debug)]
pub struct TransportMessageStream {
    transport: Box<dyn Transport>,
    serializer: Arc<dyn Serializer>,
}

impl TransportMessageStream {
    pub fn new(transport: Box<dyn Transport>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            transport,
            serializer,
        }
    }
}

impl MessageStream for TransportMessageStream {}

impl Stream for TransportMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.transport.poll_next_unpin(cx)) {
            Some(Ok(TransportData::Ping(data))) => {
                task::Poll::Ready(Some(Ok(StreamMessage::Ping(data))))
            }
            Some(Ok(TransportData::Message(data))) => {
                let is_binary = self.serializer.serializer_type().is_binary();
                let message = self.serializer.deserialize(&data, is_binary)?;
                task::Poll::Ready(Some(Ok(StreamMessage::Message(message))))
            }
            Some(Err(err)) => task::Poll::Ready(Some(Err(err))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<StreamMessage> for TransportMessageStream {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_ready_unpin(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: StreamMessage) -> Result<(), Self::Error> {
        let data = match item {
            StreamMessage::Ping(data) => TransportData::Ping(data),
            StreamMessage::Message(message) => {
                let (data, _) = self.serializer.serialize(&message)?;
                TransportData::Message(data)
            }
        };
        self.transport.start_send_unpin(data)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_close_unpin(cx)
    }
}

/// A [`MessageStream`] over in-process channels.
///
/// Closing either end closes the stream for both.
#[derive(Debug)]
pub struct DirectMessageStream {
    tx: mpsc::UnboundedSender<StreamMessage>,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
}

impl MessageStream for DirectMessageStream {}

impl Stream for DirectMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        match futures_util::ready!(self.rx.poll_recv(cx)) {
            Some(message) => task::Poll::Ready(Some(Ok(message))),
            None => task::Poll::Ready(None),
        }
    }
}

impl Sink<StreamMessage> for DirectMessageStream {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: StreamMessage) -> Result<(), Self::Error> {
        self.tx
            .send(item)
            .map_err(|_| Error::msg("direct message stream closed"))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.rx.close();
        task::Poll::Ready(Ok(()))
    }
}

/// Creates a connected pair of in-process message streams.
///
/// One end is handed to a peer (see `Peer::direct_connect`); the other acts as the router side of
/// the connection.
pub fn direct_message_stream_pair() -> (DirectMessageStream, DirectMessageStream) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        DirectMessageStream { tx: a_tx, rx: b_rx },
        DirectMessageStream { tx: b_tx, rx: a_rx },
    )
}
