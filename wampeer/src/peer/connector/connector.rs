use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;

use crate::{
    core::stream::MessageStream,
    peer::connector::{
        raw_socket_connector::RawSocketConnector,
        web_socket_connector::WebSocketConnector,
    },
    serializer::serializer::SerializerRegistry,
    transport::{
        config::{
            TransportConfig,
            TransportType,
        },
        transport::TransportDetails,
    },
};

/// A connection to a WAMP router produced by a [`Connector`].
pub struct Connection {
    pub stream: Box<dyn MessageStream>,
    pub details: TransportDetails,
}

/// A type for initiating a connection to a router.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection>;
}

/// A type for generating a new [`Connector`] from a transport configuration record.
pub trait ConnectorFactory: Send + Sync {
    /// Creates a new [`Connector`], validating the configuration.
    fn new_connector(
        &self,
        config: &TransportConfig,
        serializers: SerializerRegistry,
    ) -> Result<Box<dyn Connector>>;
}

/// The factory building the connectors implemented by this crate.
#[derive(Debug, Default)]
pub struct DefaultConnectorFactory {}

impl ConnectorFactory for DefaultConnectorFactory {
    fn new_connector(
        &self,
        config: &TransportConfig,
        serializers: SerializerRegistry,
    ) -> Result<Box<dyn Connector>> {
        new_connector(config, serializers)
    }
}

/// Creates a new [`Connector`] for the transport configuration.
///
/// Configuration errors surface here, before any connection attempt, so the connection
/// orchestrator can classify them as fatal.
pub fn new_connector(
    config: &TransportConfig,
    serializers: SerializerRegistry,
) -> Result<Box<dyn Connector>> {
    config.validate()?;
    if !config
        .serializers
        .iter()
        .any(|serializer| serializers.get(*serializer).is_some())
    {
        return Err(Error::msg(
            "no serializer implementation registered for any configured serializer",
        ));
    }
    match config.transport_type {
        TransportType::WebSocket => {
            Ok(Box::new(WebSocketConnector::new(config.clone(), serializers)))
        }
        TransportType::RawSocket => {
            Ok(Box::new(RawSocketConnector::new(config.clone(), serializers)))
        }
    }
}
