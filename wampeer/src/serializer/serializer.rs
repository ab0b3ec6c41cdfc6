use std::{
    fmt::Debug,
    sync::Arc,
};

use anyhow::{
    Error,
    Result,
};

use crate::{
    core::uri::Uri,
    message::message::Message,
};

/// The type of serializer to use.
///
/// The actual serializer implementation is a collaborator registered by the application (see
/// [`SerializerRegistry`]); this type only identifies a format for negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SerializerType {
    /// Serializes messages to and from JavaScript Object Notation.
    Json,
    /// Serializes messages to and from the MessagePack format.
    MessagePack,
    /// Serializes messages to and from the Concise Binary Object Representation format.
    Cbor,
    /// Serializes messages to and from Universal Binary JSON.
    Ubjson,
    /// Serializes messages to and from FlatBuffers.
    FlatBuffers,
}

impl SerializerType {
    /// The protocol URI used during protocol negotiation.
    pub fn uri(&self) -> Uri {
        match self {
            Self::Json => Uri::from_known("wamp.2.json"),
            Self::MessagePack => Uri::from_known("wamp.2.msgpack"),
            Self::Cbor => Uri::from_known("wamp.2.cbor"),
            Self::Ubjson => Uri::from_known("wamp.2.ubjson"),
            Self::FlatBuffers => Uri::from_known("wamp.2.flatbuffers"),
        }
    }

    /// The serializer ID used in the RawSocket opening handshake.
    pub fn raw_socket_id(&self) -> u8 {
        match self {
            Self::Json => 1,
            Self::MessagePack => 2,
            Self::Cbor => 3,
            Self::Ubjson => 4,
            Self::FlatBuffers => 5,
        }
    }

    /// Whether the format produces binary data, as opposed to text.
    pub fn is_binary(&self) -> bool {
        !matches!(self, Self::Json)
    }
}

impl TryFrom<&str> for SerializerType {
    type Error = &'static str;
    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "wamp.2.json" => Ok(Self::Json),
            "wamp.2.msgpack" => Ok(Self::MessagePack),
            "wamp.2.cbor" => Ok(Self::Cbor),
            "wamp.2.ubjson" => Ok(Self::Ubjson),
            "wamp.2.flatbuffers" => Ok(Self::FlatBuffers),
            _ => Err("unsupported serializer"),
        }
    }
}

impl TryFrom<u8> for SerializerType {
    type Error = &'static str;
    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Json),
            2 => Ok(Self::MessagePack),
            3 => Ok(Self::Cbor),
            4 => Ok(Self::Ubjson),
            5 => Ok(Self::FlatBuffers),
            _ => Err("unsupported serializer"),
        }
    }
}

/// A serializer, which serializes and deserializes WAMP messages to a well-known format that can
/// be passed over wire.
///
/// Implementations encode the message's canonical ordered-array form (see
/// [`Message::marshal`][`crate::message::message::Message::marshal`]) and report whether the
/// encoding is binary. Does not implement message batching.
pub trait Serializer: Send + Sync + Debug {
    /// The format this serializer implements.
    fn serializer_type(&self) -> SerializerType;

    /// Serializes the given message to bytes, reporting whether the bytes are binary.
    fn serialize(&self, message: &Message) -> Result<(Vec<u8>, bool)>;

    /// Deserializes bytes to a message.
    fn deserialize(&self, bytes: &[u8], is_binary: bool) -> Result<Message>;
}

/// A registry of serializer implementations, keyed by format.
///
/// Shared freely: the registry is immutable after construction and serializers are stateless.
#[derive(Debug, Default, Clone)]
pub struct SerializerRegistry {
    serializers: ahash::HashMap<SerializerType, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// Registers a serializer implementation, replacing any previous one for the same format.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers
            .insert(serializer.serializer_type(), serializer);
    }

    /// The serializer implementation for the format, if registered.
    pub fn get(&self, serializer_type: SerializerType) -> Option<Arc<dyn Serializer>> {
        self.serializers.get(&serializer_type).cloned()
    }

    /// The registered formats, for transport negotiation.
    pub fn types(&self) -> impl Iterator<Item = SerializerType> + '_ {
        self.serializers.keys().cloned()
    }

    /// Looks up the serializer for the format, failing if none is registered.
    pub fn require(&self, serializer_type: SerializerType) -> Result<Arc<dyn Serializer>> {
        self.get(serializer_type).ok_or_else(|| {
            Error::msg(format!(
                "no serializer registered for {}",
                serializer_type.uri()
            ))
        })
    }
}

/// An explicit, optional memoization of serialized message bytes, keyed by codec identity.
///
/// Owned by the caller of [`Serializer::serialize`], never by the message itself, so that
/// value-like messages carry no hidden mutable state.
#[derive(Debug, Default)]
pub struct SerializationCache {
    cached: ahash::HashMap<SerializerType, (Vec<u8>, bool)>,
}

impl SerializationCache {
    /// Serializes the message with the given serializer, reusing bytes cached from a previous
    /// serialization with the same format.
    pub fn serialize(
        &mut self,
        serializer: &dyn Serializer,
        message: &Message,
    ) -> Result<&(Vec<u8>, bool)> {
        match self.cached.entry(serializer.serializer_type()) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                Ok(entry.insert(serializer.serialize(message)?))
            }
        }
    }

    /// Discards all cached bytes.
    pub fn clear(&mut self) {
        self.cached.clear();
    }
}

#[cfg(test)]
mod serializer_test {
    use std::sync::Arc;

    use anyhow::Result;

    use crate::{
        message::message::{
            HelloMessage,
            Message,
        },
        serializer::serializer::{
            SerializationCache,
            Serializer,
            SerializerRegistry,
            SerializerType,
        },
    };

    #[derive(Debug, Default)]
    struct CountingSerializer {
        serializations: std::sync::atomic::AtomicUsize,
    }

    impl Serializer for CountingSerializer {
        fn serializer_type(&self) -> SerializerType {
            SerializerType::Json
        }

        fn serialize(&self, _: &Message) -> Result<(Vec<u8>, bool)> {
            self.serializations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok((vec![1, 2, 3], false))
        }

        fn deserialize(&self, _: &[u8], _: bool) -> Result<Message> {
            Ok(Message::Hello(HelloMessage::default()))
        }
    }

    #[test]
    fn negotiates_serializer_uris() {
        assert_eq!(SerializerType::Json.uri().as_ref(), "wamp.2.json");
        assert_eq!(
            SerializerType::try_from("wamp.2.msgpack"),
            Ok(SerializerType::MessagePack)
        );
        assert_matches::assert_matches!(SerializerType::try_from("wamp.2.xml"), Err(_));
    }

    #[test]
    fn caches_bytes_per_codec_identity() {
        let serializer = CountingSerializer::default();
        let message = Message::Hello(HelloMessage::default());
        let mut cache = SerializationCache::default();
        cache.serialize(&serializer, &message).unwrap();
        cache.serialize(&serializer, &message).unwrap();
        assert_eq!(
            serializer
                .serializations
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn requires_registered_serializers() {
        let mut registry = SerializerRegistry::default();
        assert_matches::assert_matches!(registry.require(SerializerType::Json), Err(err) => {
            assert!(err.to_string().contains("no serializer registered"));
        });
        registry.register(Arc::new(CountingSerializer::default()));
        assert_matches::assert_matches!(registry.require(SerializerType::Json), Ok(_));
    }
}
