use std::{
    fmt::Debug,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use rustls::pki_types::CertificateDer;

use crate::{
    core::types::Dictionary,
    serializer::serializer::SerializerType,
};

/// The framing protocol of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    WebSocket,
    RawSocket,
}

impl TryFrom<&str> for TransportType {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "websocket" => Ok(Self::WebSocket),
            "rawsocket" => Ok(Self::RawSocket),
            _ => Err(Self::Error::msg(format!("invalid transport type: {value}"))),
        }
    }
}

impl From<TransportType> for &'static str {
    fn from(value: TransportType) -> Self {
        match value {
            TransportType::WebSocket => "websocket",
            TransportType::RawSocket => "rawsocket",
        }
    }
}

/// The IP version to use for a TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Structured TLS options for an endpoint.
#[derive(Debug, Default, Clone)]
pub struct TlsOptions {
    /// The server name to present for SNI and certificate validation, when it differs from the
    /// endpoint host.
    pub hostname: Option<String>,
    /// A custom trust anchor (DER-encoded certificate) replacing the platform roots.
    pub trust_root: Option<CertificateDer<'static>>,
}

/// TLS configuration for a TCP endpoint.
///
/// When absent from the endpoint, secure/insecure is inferred from the URL scheme.
#[derive(Clone)]
pub enum Tls {
    Off,
    On,
    /// TLS with structured options.
    Options(TlsOptions),
    /// TLS with a pre-built context.
    Context(Arc<rustls::ClientConfig>),
}

impl Debug for Tls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
            Self::Options(options) => write!(f, "options({options:?})"),
            Self::Context(_) => write!(f, "context"),
        }
    }
}

/// A TCP endpoint, optionally with TLS.
#[derive(Debug, Clone)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
    pub version: Option<IpVersion>,
    /// Bound on a single connection attempt.
    pub timeout: Duration,
    pub tls: Option<Tls>,
}

impl TcpEndpoint {
    pub fn new<S>(host: S, port: u16) -> Self
    where
        S: Into<String>,
    {
        Self {
            host: host.into(),
            port,
            version: None,
            timeout: DEFAULT_ENDPOINT_TIMEOUT,
            tls: None,
        }
    }
}

/// A Unix domain socket endpoint.
#[derive(Debug, Clone)]
pub struct UnixEndpoint {
    pub path: PathBuf,
    /// Bound on a single connection attempt.
    pub timeout: Duration,
}

impl UnixEndpoint {
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            path: path.into(),
            timeout: DEFAULT_ENDPOINT_TIMEOUT,
        }
    }
}

/// The endpoint a transport connects to.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(TcpEndpoint),
    Unix(UnixEndpoint),
}

impl Endpoint {
    /// Bound on a single connection attempt.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Tcp(endpoint) => endpoint.timeout,
            Self::Unix(endpoint) => endpoint.timeout,
        }
    }
}

/// An HTTP CONNECT proxy wrapping the endpoint connection.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
}

const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options known to each transport type, in their canonical `snake_case` form.
const WEB_SOCKET_OPTIONS: [&str; 5] = [
    "agent",
    "open_handshake_timeout",
    "auto_ping_interval",
    "auto_ping_timeout",
    "max_frame_payload_size",
];
const RAW_SOCKET_OPTIONS: [&str; 1] = ["max_message_size"];

/// A declarative configuration record for one candidate transport.
///
/// Immutable once a connection attempt starts; the connection orchestrator cycles over an ordered
/// list of these records.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub transport_type: TransportType,
    /// The WebSocket URL. Optional when a TCP endpoint is given; the URL is then derived.
    pub url: Option<String>,
    pub endpoint: Option<Endpoint>,
    pub proxy: Option<Proxy>,
    /// Serializers offered during transport negotiation, in order of preference.
    pub serializers: Vec<SerializerType>,
    /// Transport-specific options. Unknown options are rejected.
    pub options: Dictionary,

    /// Maximum connect retries before the orchestrator gives up (0 = unlimited).
    pub max_retries: u32,
    /// The delay before the first retry.
    pub initial_retry_delay: Duration,
    /// The cap on the inter-attempt delay.
    pub max_retry_delay: Duration,
    /// Multiplicative growth factor applied to the delay after each attempt.
    pub retry_growth_rate: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::WebSocket,
            url: None,
            endpoint: None,
            proxy: None,
            serializers: Vec::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            options: Dictionary::default(),
            max_retries: 15,
            initial_retry_delay: Duration::from_millis(1500),
            max_retry_delay: Duration::from_secs(300),
            retry_growth_rate: 1.5,
        }
    }
}

/// Normalizes an option key from the protocol's native camelCase to `snake_case`.
///
/// Both casings are accepted as aliases of the same option.
fn normalize_option_key(key: &str) -> String {
    let mut normalized = String::with_capacity(key.len());
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            normalized.push('_');
            normalized.push(ch.to_ascii_lowercase());
        } else {
            normalized.push(ch);
        }
    }
    normalized
}

impl TransportConfig {
    /// Creates a WebSocket transport configuration for the URL.
    pub fn for_url<S>(url: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// The transport options with keys normalized to `snake_case`, rejecting options unknown to
    /// the transport type.
    pub fn normalized_options(&self) -> Result<Dictionary> {
        let known: &[&str] = match self.transport_type {
            TransportType::WebSocket => &WEB_SOCKET_OPTIONS,
            TransportType::RawSocket => &RAW_SOCKET_OPTIONS,
        };
        let mut normalized = Dictionary::default();
        for (key, value) in &self.options {
            let key = normalize_option_key(key);
            if !known.contains(&key.as_str()) {
                return Err(Error::msg(format!(
                    "unknown option {key} for {} transport",
                    Into::<&'static str>::into(self.transport_type)
                )));
            }
            normalized.insert(key, value.clone());
        }
        Ok(normalized)
    }

    /// Whether the transport connects over TLS.
    ///
    /// Explicit endpoint TLS configuration wins; otherwise inferred from the URL scheme.
    pub fn secure(&self) -> bool {
        if let Some(Endpoint::Tcp(endpoint)) = &self.endpoint {
            match &endpoint.tls {
                Some(Tls::Off) => return false,
                Some(_) => return true,
                None => (),
            }
        }
        matches!(&self.url, Some(url) if url.starts_with("wss://"))
    }

    /// Bound on a single connection attempt.
    pub fn connect_timeout(&self) -> Duration {
        self.endpoint
            .as_ref()
            .map(Endpoint::timeout)
            .unwrap_or(DEFAULT_ENDPOINT_TIMEOUT)
    }

    /// Validates the configuration record.
    pub fn validate(&self) -> Result<()> {
        if self.serializers.is_empty() {
            return Err(Error::msg("at least one serializer is required"));
        }
        if self.retry_growth_rate < 1.0 {
            return Err(Error::msg("retry_growth_rate must be at least 1.0"));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(Error::msg(
                "initial_retry_delay cannot exceed max_retry_delay",
            ));
        }
        self.normalized_options()?;
        match self.transport_type {
            TransportType::WebSocket => {
                match &self.url {
                    Some(url) => {
                        if !url.starts_with("ws://") && !url.starts_with("wss://") {
                            return Err(Error::msg(format!(
                                "websocket URL must use the ws or wss scheme: {url}"
                            )));
                        }
                        if url.starts_with("ws://")
                            && matches!(&self.endpoint, Some(Endpoint::Tcp(endpoint)) if !matches!(endpoint.tls, None | Some(Tls::Off)))
                        {
                            return Err(Error::msg(
                                "websocket URL scheme is insecure, but the endpoint enables TLS",
                            ));
                        }
                    }
                    None => {
                        if self.endpoint.is_none() {
                            return Err(Error::msg(
                                "websocket transport requires a URL or an endpoint",
                            ));
                        }
                    }
                }
            }
            TransportType::RawSocket => {
                let endpoint = self
                    .endpoint
                    .as_ref()
                    .ok_or_else(|| Error::msg("rawsocket transport requires an endpoint"))?;
                if let Endpoint::Tcp(endpoint) = endpoint {
                    if !matches!(endpoint.tls, None | Some(Tls::Off)) {
                        return Err(Error::msg("TLS is not supported for rawsocket transports"));
                    }
                }
                if self.proxy.is_some() {
                    return Err(Error::msg("proxies are not supported for rawsocket transports"));
                }
            }
        }
        Ok(())
    }

    /// The URL the WebSocket connector should dial, derived from the endpoint when not given
    /// explicitly.
    pub fn websocket_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        match &self.endpoint {
            Some(Endpoint::Tcp(endpoint)) => {
                let scheme = if self.secure() { "wss" } else { "ws" };
                Ok(format!("{scheme}://{}:{}/", endpoint.host, endpoint.port))
            }
            Some(Endpoint::Unix(_)) => {
                // The URL is only used for the opening handshake; the connection itself goes over
                // the socket path.
                Ok("ws://localhost/".to_owned())
            }
            None => Err(Error::msg("websocket transport requires a URL or an endpoint")),
        }
    }
}
