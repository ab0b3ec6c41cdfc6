use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use tokio::{
    io::{
        AsyncRead,
        AsyncReadExt,
        AsyncWrite,
        AsyncWriteExt,
    },
    net::{
        TcpStream,
        UnixStream,
    },
};

use crate::{
    core::stream::TransportMessageStream,
    peer::connector::connector::{
        Connection,
        Connector,
    },
    serializer::serializer::{
        SerializerRegistry,
        SerializerType,
    },
    transport::{
        config::{
            Endpoint,
            TransportConfig,
        },
        raw_socket_transport::{
            RAW_SOCKET_LENGTH_EXPONENT,
            RAW_SOCKET_MAGIC,
            RawSocketTransport,
            raw_socket_handshake_error,
        },
        transport::{
            ChannelFraming,
            ChannelType,
            TransportDetails,
        },
    },
};

const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 24;

/// A connector dialing a WAMP router over the RawSocket framing.
///
/// The serializer is negotiated in the 4-octet opening handshake: the client requests one format,
/// and the router either echoes it or answers with an error code.
pub struct RawSocketConnector {
    config: TransportConfig,
    serializers: SerializerRegistry,
}

impl RawSocketConnector {
    pub fn new(config: TransportConfig, serializers: SerializerRegistry) -> Self {
        Self {
            config,
            serializers,
        }
    }

    fn serializer_type(&self) -> Result<SerializerType> {
        self.config
            .serializers
            .iter()
            .find(|serializer| self.serializers.get(**serializer).is_some())
            .cloned()
            .ok_or_else(|| {
                Error::msg("no serializer implementation registered for any configured serializer")
            })
    }

    fn max_message_size(&self) -> Result<usize> {
        match self.config.normalized_options()?.get("max_message_size") {
            Some(value) => value
                .integer()
                .map(|size| size as usize)
                .ok_or_else(|| Error::msg("max_message_size must be an integer")),
            None => Ok(DEFAULT_MAX_MESSAGE_SIZE),
        }
    }

    async fn connect_stream<S>(
        &self,
        mut stream: S,
        channel_type: ChannelType,
        peer: String,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static,
    {
        let serializer_type = self.serializer_type()?;
        handshake(&mut stream, serializer_type).await?;
        let serializer = self.serializers.require(serializer_type)?;
        let transport = RawSocketTransport::new(stream, self.max_message_size()?);
        Ok(Connection {
            stream: Box::new(TransportMessageStream::new(Box::new(transport), serializer)),
            details: TransportDetails {
                channel_type,
                framing: ChannelFraming::RawSocket,
                serializer: Some(serializer_type),
                peer: Some(peer),
            },
        })
    }
}

#[async_trait]
impl Connector for RawSocketConnector {
    async fn connect(&self) -> Result<Connection> {
        match &self.config.endpoint {
            Some(Endpoint::Tcp(endpoint)) => {
                let peer = format!("{}:{}", endpoint.host, endpoint.port);
                let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
                self.connect_stream(stream, ChannelType::Tcp, peer).await
            }
            Some(Endpoint::Unix(endpoint)) => {
                let peer = endpoint.path.to_string_lossy().into_owned();
                let stream = UnixStream::connect(&endpoint.path).await?;
                self.connect_stream(stream, ChannelType::Unix, peer).await
            }
            None => Err(Error::msg("rawsocket transport requires an endpoint")),
        }
    }
}

/// Performs the client side of the RawSocket opening handshake.
async fn handshake<S>(stream: &mut S, serializer_type: SerializerType) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[
            RAW_SOCKET_MAGIC,
            (RAW_SOCKET_LENGTH_EXPONENT << 4) | serializer_type.raw_socket_id(),
            0,
            0,
        ])
        .await?;

    let mut response = [0u8; 4];
    stream.read_exact(&mut response).await?;
    if response[0] != RAW_SOCKET_MAGIC {
        return Err(Error::msg(
            "router did not answer the rawsocket handshake with the magic octet",
        ));
    }
    let serializer = response[1] & 0x0F;
    if serializer == 0 {
        return Err(Error::msg(format!(
            "router rejected the rawsocket handshake: {}",
            raw_socket_handshake_error(response[1] >> 4)
        )));
    }
    if serializer != serializer_type.raw_socket_id() {
        return Err(Error::msg(
            "router selected a serializer that was not requested",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod raw_socket_connector_test {
    use tokio::io::{
        AsyncReadExt,
        AsyncWriteExt,
    };

    use crate::{
        peer::connector::raw_socket_connector::handshake,
        serializer::serializer::SerializerType,
    };

    #[tokio::test]
    async fn negotiates_requested_serializer() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let handshake = tokio::spawn(async move {
            handshake(&mut client, SerializerType::MessagePack).await
        });

        let mut request = [0u8; 4];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(request[0], 0x7F);
        assert_eq!(request[1] & 0x0F, 2);

        server.write_all(&[0x7F, (0xF << 4) | 2, 0, 0]).await.unwrap();
        assert_matches::assert_matches!(handshake.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn surfaces_handshake_errors() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let handshake =
            tokio::spawn(async move { handshake(&mut client, SerializerType::Json).await });

        let mut request = [0u8; 4];
        server.read_exact(&mut request).await.unwrap();
        // Error code 1: serializer unsupported.
        server.write_all(&[0x7F, 1 << 4, 0, 0]).await.unwrap();
        assert_matches::assert_matches!(handshake.await.unwrap(), Err(err) => {
            assert!(err.to_string().contains("serializer unsupported"));
        });
    }
}
