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
    Stream,
};
use tokio::io::{
    AsyncRead,
    AsyncWrite,
    ReadBuf,
};

use crate::transport::transport::{
    Transport,
    TransportData,
};

/// The RawSocket handshake magic octet.
pub const RAW_SOCKET_MAGIC: u8 = 0x7F;

/// The maximum message length this transport announces in the opening handshake (2^24 bytes).
pub const RAW_SOCKET_LENGTH_EXPONENT: u8 = 0xF;

const FRAME_HEADER_LEN: usize = 4;

const FRAME_TYPE_MESSAGE: u8 = 0x00;
const FRAME_TYPE_PING: u8 = 0x01;
const FRAME_TYPE_PONG: u8 = 0x02;

/// Describes a handshake error code sent by the router in place of an echoed serializer.
pub fn raw_socket_handshake_error(code: u8) -> &'static str {
    match code {
        0 => "illegal error code",
        1 => "serializer unsupported",
        2 => "maximum message length unacceptable",
        3 => "use of reserved bits",
        4 => "maximum connection count reached",
        _ => "unknown handshake error",
    }
}

enum ReadState {
    Header {
        header: [u8; FRAME_HEADER_LEN],
        filled: usize,
    },
    Payload {
        frame_type: u8,
        payload: Vec<u8>,
        filled: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        Self::Header {
            header: [0; FRAME_HEADER_LEN],
            filled: 0,
        }
    }
}

/// A transport implemented over the WAMP RawSocket framing: a fixed 4-octet frame header (frame
/// type and big-endian payload length) followed by the payload.
///
/// The opening handshake (magic octet, serializer negotiation) happens before construction; this
/// type only deals in established streams.
#[derive(Debug)]
pub struct RawSocketTransport<S> {
    stream: S,
    max_message_size: usize,
    read_state: ReadState,
    write_buffer: Vec<u8>,
    written: usize,
}

impl Debug for ReadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Header { filled, .. } => write!(f, "header({filled})"),
            Self::Payload { filled, payload, .. } => {
                write!(f, "payload({filled}/{})", payload.len())
            }
        }
    }
}

impl<S> RawSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    pub fn new(stream: S, max_message_size: usize) -> Self {
        Self {
            stream,
            max_message_size,
            read_state: ReadState::default(),
            write_buffer: Vec::new(),
            written: 0,
        }
    }

    /// Writes as much of the buffered outbound data as the stream accepts.
    fn poll_write_buffer(&mut self, cx: &mut task::Context<'_>) -> task::Poll<Result<()>> {
        while self.written < self.write_buffer.len() {
            let written = futures_util::ready!(
                Pin::new(&mut self.stream).poll_write(cx, &self.write_buffer[self.written..])
            )?;
            if written == 0 {
                return task::Poll::Ready(Err(Error::msg("rawsocket stream closed")));
            }
            self.written += written;
        }
        self.write_buffer.clear();
        self.written = 0;
        task::Poll::Ready(Ok(()))
    }

    fn queue_frame(&mut self, frame_type: u8, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_message_size {
            return Err(Error::msg(format!(
                "outgoing rawsocket frame of {} bytes exceeds the maximum message size",
                payload.len()
            )));
        }
        let len = payload.len() as u32;
        self.write_buffer.push(frame_type);
        self.write_buffer
            .extend_from_slice(&len.to_be_bytes()[1..4]);
        self.write_buffer.extend_from_slice(payload);
        Ok(())
    }
}

impl<S> Transport for RawSocketTransport<S> where S: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<S> Stream for RawSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    type Item = Result<TransportData>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_state {
                ReadState::Header { header, filled } => {
                    let mut buf = ReadBuf::new(&mut header[*filled..]);
                    futures_util::ready!(Pin::new(&mut this.stream).poll_read(cx, &mut buf))?;
                    let read = buf.filled().len();
                    if read == 0 {
                        // A clean end of stream is only acceptable between frames.
                        if *filled == 0 {
                            return task::Poll::Ready(None);
                        }
                        return task::Poll::Ready(Some(Err(Error::msg(
                            "rawsocket stream ended mid-frame",
                        ))));
                    }
                    *filled += read;
                    if *filled < FRAME_HEADER_LEN {
                        continue;
                    }
                    let frame_type = header[0];
                    if frame_type > FRAME_TYPE_PONG {
                        return task::Poll::Ready(Some(Err(Error::msg(format!(
                            "invalid rawsocket frame type {frame_type}"
                        )))));
                    }
                    let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
                    if len > this.max_message_size {
                        return task::Poll::Ready(Some(Err(Error::msg(format!(
                            "incoming rawsocket frame of {len} bytes exceeds the maximum message size"
                        )))));
                    }
                    this.read_state = ReadState::Payload {
                        frame_type,
                        payload: vec![0; len],
                        filled: 0,
                    };
                }
                ReadState::Payload {
                    frame_type,
                    payload,
                    filled,
                } => {
                    while *filled < payload.len() {
                        let mut buf = ReadBuf::new(&mut payload[*filled..]);
                        futures_util::ready!(Pin::new(&mut this.stream).poll_read(cx, &mut buf))?;
                        let read = buf.filled().len();
                        if read == 0 {
                            return task::Poll::Ready(Some(Err(Error::msg(
                                "rawsocket stream ended mid-frame",
                            ))));
                        }
                        *filled += read;
                    }
                    let frame_type = *frame_type;
                    let payload = std::mem::take(payload);
                    this.read_state = ReadState::default();
                    match frame_type {
                        FRAME_TYPE_MESSAGE => {
                            return task::Poll::Ready(Some(Ok(TransportData::Message(payload))));
                        }
                        FRAME_TYPE_PING => {
                            return task::Poll::Ready(Some(Ok(TransportData::Ping(payload))));
                        }
                        // Keep-alive acknowledgement; nothing to surface.
                        _ => continue,
                    }
                }
            }
        }
    }
}

impl<S> Sink<TransportData> for RawSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.get_mut().poll_write_buffer(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: TransportData) -> Result<(), Self::Error> {
        let this = self.get_mut();
        match item {
            TransportData::Ping(data) => this.queue_frame(FRAME_TYPE_PONG, &data),
            TransportData::Message(data) => this.queue_frame(FRAME_TYPE_MESSAGE, &data),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        futures_util::ready!(this.poll_write_buffer(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx).map_err(Error::new)
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        futures_util::ready!(this.poll_write_buffer(cx))?;
        Pin::new(&mut this.stream)
            .poll_shutdown(cx)
            .map_err(Error::new)
    }
}

#[cfg(test)]
mod raw_socket_transport_test {
    use futures_util::{
        SinkExt,
        StreamExt,
    };

    use crate::transport::{
        raw_socket_transport::RawSocketTransport,
        transport::TransportData,
    };

    #[tokio::test]
    async fn frames_and_unframes_messages() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = RawSocketTransport::new(client, 1 << 24);
        let mut server = RawSocketTransport::new(server, 1 << 24);

        client
            .send(TransportData::Message(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_matches::assert_matches!(server.next().await, Some(Ok(TransportData::Message(data))) => {
            assert_eq!(data, vec![1, 2, 3]);
        });
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = RawSocketTransport::new(client, 1 << 24);
        let mut server = RawSocketTransport::new(server, 2);

        client
            .send(TransportData::Message(vec![0; 16]))
            .await
            .unwrap();
        assert_matches::assert_matches!(server.next().await, Some(Err(err)) => {
            assert!(err.to_string().contains("exceeds the maximum message size"));
        });
    }

    #[tokio::test]
    async fn answers_pings_with_pongs() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = RawSocketTransport::new(client, 1 << 24);
        let mut server = RawSocketTransport::new(server, 1 << 24);

        // The sink maps an outbound ping to a pong frame, which the remote side swallows as a
        // keep-alive; a message after it proves the stream stays usable.
        client.send(TransportData::Ping(vec![9])).await.unwrap();
        client
            .send(TransportData::Message(vec![7]))
            .await
            .unwrap();
        assert_matches::assert_matches!(server.next().await, Some(Ok(TransportData::Message(data))) => {
            assert_eq!(data, vec![7]);
        });
    }
}
