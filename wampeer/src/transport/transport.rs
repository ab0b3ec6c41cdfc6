use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};

use crate::serializer::serializer::SerializerType;

/// Data received from a [`Transport`].
#[derive(Debug)]
pub enum TransportData {
    /// Data that should be perceived as a health check and immediately sent back to the sender.
    Ping(Vec<u8>),
    /// Data representing a meaningful WAMP message.
    Message(Vec<u8>),
}

/// A transport, over which WAMP messages can be sent and received.
///
/// Implemented as a [`Stream`] and [`Sink`] that extracts out meaningful data and reports protocol
/// violations to be handled at higher layers.
pub trait Transport:
    Send + Stream<Item = Result<TransportData>> + Sink<TransportData, Error = Error> + Unpin + Debug
{
}

/// The type of channel a transport communicates over.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Tcp,
    Tls,
    Unix,
    /// An in-process channel with no underlying socket.
    #[default]
    Memory,
}

/// The framing a transport applies on its channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFraming {
    WebSocket,
    RawSocket,
    /// Messages passed directly, with no framing or serialization.
    #[default]
    Direct,
}

/// Descriptive summary of an established transport.
///
/// Immutable after construction; used for observability and application-level decisions, not for
/// protocol control flow.
#[derive(Debug, Default, Clone)]
pub struct TransportDetails {
    /// The type of channel the transport runs over.
    pub channel_type: ChannelType,
    /// The framing applied on the channel.
    pub framing: ChannelFraming,
    /// The serializer negotiated at transport open, if any.
    pub serializer: Option<SerializerType>,
    /// The remote address or path, when known.
    pub peer: Option<String>,
}
