use core::str;
use std::sync::Arc;

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
use tokio_tungstenite::{
    WebSocketStream,
    client_async,
    client_async_tls_with_config,
    connect_async,
    tungstenite::{
        ClientRequestBuilder,
        client::IntoClientRequest,
        handshake::client::Response,
        http::header::SEC_WEBSOCKET_PROTOCOL,
    },
};

use crate::{
    core::{
        stream::TransportMessageStream,
        types::Value,
    },
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
            Proxy,
            Tls,
            TlsOptions,
            TransportConfig,
        },
        transport::{
            ChannelFraming,
            ChannelType,
            TransportDetails,
        },
        web_socket_transport::WebSocketTransport,
    },
};

/// A connector dialing a WAMP router over WebSocket.
///
/// The serializer is negotiated through the WebSocket sub-protocol of the opening handshake.
pub struct WebSocketConnector {
    config: TransportConfig,
    serializers: SerializerRegistry,
}

impl WebSocketConnector {
    pub fn new(config: TransportConfig, serializers: SerializerRegistry) -> Self {
        Self {
            config,
            serializers,
        }
    }

    fn request(&self) -> Result<ClientRequestBuilder> {
        let url = self.websocket_url()?;
        let mut request = ClientRequestBuilder::new(
            url.as_str()
                .try_into()
                .map_err(|err| Error::msg(format!("invalid websocket URL {url}: {err}")))?,
        );
        let options = self.config.normalized_options()?;
        if let Some(Value::String(agent)) = options.get("agent") {
            request = request.with_header("User-Agent", agent);
        }
        for serializer in &self.config.serializers {
            if self.serializers.get(*serializer).is_some() {
                request = request.with_sub_protocol(serializer.uri().to_string());
            }
        }
        Ok(request)
    }

    fn websocket_url(&self) -> Result<String> {
        // A TLS hostname override applies to the handshake (SNI and certificate validation); the
        // dial still targets the endpoint host.
        if let (None, Some(Endpoint::Tcp(endpoint))) = (&self.config.url, &self.config.endpoint) {
            if let Some(Tls::Options(TlsOptions {
                hostname: Some(hostname),
                ..
            })) = &endpoint.tls
            {
                let scheme = if self.config.secure() { "wss" } else { "ws" };
                return Ok(format!("{scheme}://{hostname}:{}/", endpoint.port));
            }
        }
        self.config.websocket_url()
    }

    fn tls_connector(&self) -> Result<Option<tokio_tungstenite::Connector>> {
        let tls = match &self.config.endpoint {
            Some(Endpoint::Tcp(endpoint)) => &endpoint.tls,
            _ => &None,
        };
        match tls {
            Some(Tls::Context(context)) => {
                Ok(Some(tokio_tungstenite::Connector::Rustls(context.clone())))
            }
            Some(Tls::Options(options)) => match &options.trust_root {
                Some(trust_root) => {
                    let mut roots = rustls::RootCertStore::empty();
                    roots.add(trust_root.clone()).map_err(Error::new)?;
                    let config = rustls::ClientConfig::builder()
                        .with_root_certificates(roots)
                        .with_no_client_auth();
                    Ok(Some(tokio_tungstenite::Connector::Rustls(Arc::new(config))))
                }
                // Platform roots, via the library's default connector.
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// The host and port to dial, from the endpoint or the URL.
    fn dial_target(&self, request_uri: &tokio_tungstenite::tungstenite::http::Uri) -> Result<(String, u16)> {
        if let Some(Endpoint::Tcp(endpoint)) = &self.config.endpoint {
            return Ok((endpoint.host.clone(), endpoint.port));
        }
        let host = request_uri
            .host()
            .ok_or_else(|| Error::msg("websocket URL has no host"))?
            .to_owned();
        let port = request_uri
            .port_u16()
            .unwrap_or(if self.config.secure() { 443 } else { 80 });
        Ok((host, port))
    }

    fn new_connection<S>(
        &self,
        stream: WebSocketStream<S>,
        response: &Response,
        channel_type: ChannelType,
        peer: String,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug + 'static,
    {
        let serializer_type = match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(protocol) => {
                let protocol = protocol.to_str()?;
                SerializerType::try_from(protocol).map_err(Error::msg)?
            }
            None => return Err(Error::msg("handshake did not produce a sub-protocol")),
        };
        let serializer = self.serializers.require(serializer_type)?;
        let transport = WebSocketTransport::new(stream, serializer_type);
        Ok(Connection {
            stream: Box::new(TransportMessageStream::new(Box::new(transport), serializer)),
            details: TransportDetails {
                channel_type,
                framing: ChannelFraming::WebSocket,
                serializer: Some(serializer_type),
                peer: Some(peer),
            },
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection> {
        let request = self.request()?;

        // Unix endpoints carry the handshake over the socket path, with no TLS.
        if let Some(Endpoint::Unix(endpoint)) = &self.config.endpoint {
            let peer = endpoint.path.to_string_lossy().into_owned();
            let stream = UnixStream::connect(&endpoint.path).await?;
            let (stream, response) = client_async(request, stream).await?;
            return self.new_connection(stream, &response, ChannelType::Unix, peer);
        }

        let tls_connector = self.tls_connector()?;
        let channel_type = if self.config.secure() {
            ChannelType::Tls
        } else {
            ChannelType::Tcp
        };

        // The convenience path covers a plain dial with default TLS behavior.
        if self.config.proxy.is_none() && tls_connector.is_none() {
            let (stream, response) = connect_async(request).await?;
            let peer = self.config.websocket_url()?;
            return self.new_connection(stream, &response, channel_type, peer);
        }

        let request = request.into_client_request()?;
        let (host, port) = self.dial_target(request.uri())?;
        let peer = format!("{host}:{port}");
        let stream = match &self.config.proxy {
            Some(proxy) => http_connect(proxy, &host, port).await?,
            None => TcpStream::connect((host.as_str(), port)).await?,
        };
        let (stream, response) =
            client_async_tls_with_config(request, stream, None, tls_connector).await?;
        self.new_connection(stream, &response, channel_type, peer)
    }
}

/// Establishes a tunnel to the target through an HTTP CONNECT proxy.
async fn http_connect(proxy: &Proxy, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
    stream
        .write_all(
            format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n").as_bytes(),
        )
        .await?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 4096 {
            return Err(Error::msg("proxy CONNECT response is too large"));
        }
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(Error::msg("proxy closed the connection during CONNECT"));
        }
        response.push(byte[0]);
    }
    let status = str::from_utf8(&response)?
        .lines()
        .next()
        .unwrap_or_default()
        .to_owned();
    if status.split_whitespace().nth(1) != Some("200") {
        return Err(Error::msg(format!("proxy refused CONNECT: {status}")));
    }
    Ok(stream)
}
