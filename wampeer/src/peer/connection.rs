use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    info,
    warn,
};
use thiserror::Error;

use crate::{
    core::{
        error::{
            BasicError,
            InteractionError,
            ProtocolError,
        },
        realm::{
            InvalidRealmName,
            validate_realm_name,
        },
        uri::InvalidUri,
    },
    peer::{
        connector::{
            ConnectorFactory,
            DefaultConnectorFactory,
        },
        peer::{
            Peer,
            SupportedAuthMethod,
        },
        session::SessionDetails,
    },
    transport::config::TransportConfig,
};

/// Error for the orchestrator running out of connect attempts.
///
/// The single terminal error of a connection: individual attempt errors are absorbed by the retry
/// loop and logged.
#[derive(Debug, Error)]
#[error("exhausted all transport connect attempts")]
pub struct ConnectExhaustedError {
    /// How many attempts were made.
    pub attempts: u32,
}

/// Error for a transport configuration rejected while building its connector.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConnectionConfigError {
    message: String,
}

/// Configuration for a [`Connection`].
pub struct ConnectionConfig {
    /// The candidate transports, tried in order, cyclically.
    pub transports: Vec<TransportConfig>,
    /// The realm to join once a transport connects.
    pub realm: String,
    /// Authentication methods offered when joining the realm.
    pub auth_methods: Vec<SupportedAuthMethod>,
}

impl ConnectionConfig {
    /// Creates a new config connecting to the realm over one transport.
    pub fn new<S>(realm: S, transport: TransportConfig) -> Self
    where
        S: Into<String>,
    {
        Self {
            transports: Vec::from_iter([transport]),
            realm: realm.into(),
            auth_methods: Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.transports.is_empty() {
            return Err(Error::msg("at least one transport is required"));
        }
        validate_realm_name(&self.realm).map_err(Error::new)?;
        Ok(())
    }
}

/// Classifies an attempt error as terminal for the whole connection.
///
/// Configuration errors and explicit rejections by the router (authentication, authorization,
/// unknown realm) will not get better by retrying; everything else (refused connections,
/// timeouts, transports lost before WELCOME) is transient.
pub fn is_fatal(error: &Error) -> bool {
    if error.downcast_ref::<ConnectionConfigError>().is_some()
        || error.downcast_ref::<InvalidUri>().is_some()
        || error.downcast_ref::<InvalidRealmName>().is_some()
        || error.downcast_ref::<ProtocolError>().is_some()
    {
        return true;
    }
    if let Some(err) = error.downcast_ref::<InteractionError>() {
        return matches!(
            err,
            InteractionError::NotAuthorized
                | InteractionError::AuthenticationFailed
                | InteractionError::NoSuchRealm
                | InteractionError::ProtocolViolation(_)
        );
    }
    if let Some(err) = error.downcast_ref::<BasicError>() {
        return matches!(
            err,
            BasicError::PermissionDenied(_)
                | BasicError::NotAllowed(_)
                | BasicError::InvalidArgument(_)
        );
    }
    false
}

struct RetryState {
    attempts: u32,
    delay: Duration,
}

impl RetryState {
    fn new(transport: &TransportConfig) -> Self {
        Self {
            attempts: 0,
            delay: transport.initial_retry_delay,
        }
    }

    /// The delay before the next attempt, with multiplicative jitter, growing up to the
    /// transport's cap.
    fn next_delay(&mut self, transport: &TransportConfig) -> Duration {
        let jitter = 0.9 + rand::random::<f64>() * 0.2;
        let delay = self.delay.mul_f64(jitter).min(transport.max_retry_delay);
        self.delay = self
            .delay
            .mul_f64(transport.retry_growth_rate)
            .min(transport.max_retry_delay);
        delay
    }
}

/// The connection orchestrator: produces exactly one live, authenticated session from an ordered,
/// cyclic list of candidate transports, retrying across transient failures.
pub struct Connection {
    peer: Arc<Peer>,
    config: ConnectionConfig,
    connector_factory: Box<dyn ConnectorFactory>,
}

impl Connection {
    /// Creates a new connection over the peer.
    pub fn new(peer: Arc<Peer>, config: ConnectionConfig) -> Result<Self> {
        Self::with_connector_factory(peer, config, Box::new(DefaultConnectorFactory::default()))
    }

    /// Creates a new connection building transports through the given factory.
    pub fn with_connector_factory(
        peer: Arc<Peer>,
        config: ConnectionConfig,
        connector_factory: Box<dyn ConnectorFactory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            peer,
            config,
            connector_factory,
        })
    }

    /// The peer driven by this connection.
    pub fn peer(&self) -> Arc<Peer> {
        self.peer.clone()
    }

    /// Connects and establishes a session, retrying across the configured transports.
    ///
    /// Transient attempt errors are absorbed here; the caller sees either an established session,
    /// the first fatal error, or [`ConnectExhaustedError`] once a transport's retry budget is
    /// spent (`max_retries` of 0 retries forever).
    pub async fn connect(&self) -> Result<SessionDetails> {
        let transports = &self.config.transports;
        let mut retries = transports.iter().map(RetryState::new).collect::<Vec<_>>();
        // Explicit wrapping index into the immutable transport list.
        let mut index = 0;
        loop {
            let slot = index % transports.len();
            let transport = &transports[slot];
            match self.attempt(transport).await {
                Ok(details) => return Ok(details),
                Err(err) => {
                    if is_fatal(&err) {
                        return Err(err);
                    }
                    let retry = &mut retries[slot];
                    retry.attempts += 1;
                    warn!(
                        "Connect attempt {} over transport {slot} failed: {err:#}",
                        retry.attempts
                    );
                    if transport.max_retries > 0 && retry.attempts > transport.max_retries {
                        return Err(ConnectExhaustedError {
                            attempts: retry.attempts,
                        }
                        .into());
                    }
                    let delay = retry.next_delay(transport);
                    info!("Retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
            index = index.wrapping_add(1);
        }
    }

    /// One whole connect attempt: build the connector, dial within the endpoint timeout, and
    /// establish the session.
    ///
    /// Joining the realm is part of the attempt, so a post-connect-but-pre-WELCOME failure (a
    /// handshake error surfacing as a lost transport) consumes exactly one retry credit, the same
    /// as an outright connect failure.
    async fn attempt(&self, transport: &TransportConfig) -> Result<SessionDetails> {
        let connector = self
            .connector_factory
            .new_connector(transport, self.peer.serializers())
            .map_err(|err| {
                Error::new(ConnectionConfigError {
                    message: err.to_string(),
                })
            })?;
        let connection = tokio::time::timeout(transport.connect_timeout(), connector.connect())
            .await
            .map_err(|_| Error::msg("timed out connecting to the router"))??;
        self.peer
            .attach(connection.stream, connection.details)
            .await?;
        self.peer
            .join_realm_with_authentication(&self.config.realm, &self.config.auth_methods)
            .await
    }
}
