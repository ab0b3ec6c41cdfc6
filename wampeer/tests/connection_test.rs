use std::{
    sync::{
        Arc,
        atomic::{
            AtomicU32,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use test_utils::router::RouterEnd;
use wampeer::{
    core::{
        error::InteractionError,
        stream::direct_message_stream_pair,
    },
    peer::{
        ConnectExhaustedError,
        Connection,
        ConnectionConfig,
        Peer,
        PeerConfig,
        connector::{
            Connection as ConnectorConnection,
            Connector,
            ConnectorFactory,
        },
        is_fatal,
    },
    transport::{
        config::TransportConfig,
        transport::TransportDetails,
    },
};

const REALM: &str = "com.wampeer.test";

fn create_peer(name: &str) -> Arc<Peer> {
    let mut config = PeerConfig::default();
    config.name = name.to_owned();
    Arc::new(Peer::new(config).unwrap())
}

fn transport_config(max_retries: u32) -> TransportConfig {
    TransportConfig {
        max_retries,
        initial_retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(5),
        retry_growth_rate: 1.0,
        ..TransportConfig::for_url("ws://localhost:9999/")
    }
}

/// A connector that fails every dial with the given error.
struct FailingConnector {
    attempts: Arc<AtomicU32>,
    error: fn() -> Error,
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self) -> Result<ConnectorConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

struct FailingConnectorFactory {
    attempts: Arc<AtomicU32>,
    error: fn() -> Error,
}

impl ConnectorFactory for FailingConnectorFactory {
    fn new_connector(
        &self,
        _: &TransportConfig,
        _: wampeer::serializer::serializer::SerializerRegistry,
    ) -> Result<Box<dyn Connector>> {
        Ok(Box::new(FailingConnector {
            attempts: self.attempts.clone(),
            error: self.error,
        }))
    }
}

/// A connector that hands the peer an in-process stream, with a scripted router end accepting the
/// session on the other side.
struct AcceptingConnector {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Connector for AcceptingConnector {
    async fn connect(&self) -> Result<ConnectorConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (peer_end, router_end) = direct_message_stream_pair();
        tokio::spawn(async move {
            let mut router = RouterEnd::new(router_end);
            if router.accept_hello(42).await.is_err() {
                return;
            }
            // Keep the connection alive until the peer goes away.
            while router.recv().await.is_ok() {}
        });
        Ok(ConnectorConnection {
            stream: Box::new(peer_end),
            details: TransportDetails::default(),
        })
    }
}

#[tokio::test]
async fn retry_exhaustion_makes_exactly_one_more_attempt_than_retries() {
    test_utils::setup::setup_test_environment();

    let attempts = Arc::new(AtomicU32::new(0));
    let connection = Connection::with_connector_factory(
        create_peer("exhausted"),
        ConnectionConfig::new(REALM, transport_config(2)),
        Box::new(FailingConnectorFactory {
            attempts: attempts.clone(),
            error: || Error::msg("connection refused"),
        }),
    )
    .unwrap();

    assert_matches::assert_matches!(connection.connect().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<ConnectExhaustedError>(), Ok(err) => {
            assert_eq!(err.attempts, 3);
            assert_eq!(err.to_string(), "exhausted all transport connect attempts");
        });
    });
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn fatal_errors_abort_without_retry() {
    test_utils::setup::setup_test_environment();

    let attempts = Arc::new(AtomicU32::new(0));
    let connection = Connection::with_connector_factory(
        create_peer("rejected"),
        ConnectionConfig::new(REALM, transport_config(5)),
        Box::new(FailingConnectorFactory {
            attempts: attempts.clone(),
            error: || InteractionError::AuthenticationFailed.into(),
        }),
    )
    .unwrap();

    assert_matches::assert_matches!(connection.connect().await, Err(err) => {
        assert!(is_fatal(&err));
        assert_matches::assert_matches!(
            err.downcast::<InteractionError>(),
            Ok(InteractionError::AuthenticationFailed)
        );
    });
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn configuration_errors_are_fatal() {
    test_utils::setup::setup_test_environment();

    struct RejectingFactory {}
    impl ConnectorFactory for RejectingFactory {
        fn new_connector(
            &self,
            _: &TransportConfig,
            _: wampeer::serializer::serializer::SerializerRegistry,
        ) -> Result<Box<dyn Connector>> {
            Err(Error::msg("unknown option frobnicate for websocket transport"))
        }
    }

    let connection = Connection::with_connector_factory(
        create_peer("misconfigured"),
        ConnectionConfig::new(REALM, transport_config(5)),
        Box::new(RejectingFactory {}),
    )
    .unwrap();

    // The configuration will not get better by retrying.
    assert_matches::assert_matches!(connection.connect().await, Err(err) => {
        assert!(is_fatal(&err));
        assert!(err.to_string().contains("frobnicate"));
    });
}

#[tokio::test]
async fn cycles_through_candidate_transports() {
    test_utils::setup::setup_test_environment();

    // The factory keys off the transport URL: the first candidate never connects, the second
    // accepts the session.
    struct CyclingFactory {
        failed: Arc<AtomicU32>,
        accepted: Arc<AtomicU32>,
    }
    impl ConnectorFactory for CyclingFactory {
        fn new_connector(
            &self,
            config: &TransportConfig,
            _: wampeer::serializer::serializer::SerializerRegistry,
        ) -> Result<Box<dyn Connector>> {
            if config.url.as_deref() == Some("ws://primary:9999/") {
                Ok(Box::new(FailingConnector {
                    attempts: self.failed.clone(),
                    error: || Error::msg("connection refused"),
                }))
            } else {
                Ok(Box::new(AcceptingConnector {
                    attempts: self.accepted.clone(),
                }))
            }
        }
    }

    let failed = Arc::new(AtomicU32::new(0));
    let accepted = Arc::new(AtomicU32::new(0));
    let mut config = ConnectionConfig::new(
        REALM,
        TransportConfig {
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
            retry_growth_rate: 1.0,
            ..TransportConfig::for_url("ws://primary:9999/")
        },
    );
    config.transports.push(TransportConfig {
        max_retries: 3,
        initial_retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(5),
        retry_growth_rate: 1.0,
        ..TransportConfig::for_url("ws://fallback:9999/")
    });
    let connection = Connection::with_connector_factory(
        create_peer("cycler"),
        config,
        Box::new(CyclingFactory {
            failed: failed.clone(),
            accepted: accepted.clone(),
        }),
    )
    .unwrap();

    assert_matches::assert_matches!(connection.connect().await, Ok(details) => {
        assert_eq!(details.session.value(), 42);
    });
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handshake_failure_before_welcome_consumes_one_retry() {
    test_utils::setup::setup_test_environment();

    // The first attempt connects at the transport layer, but the connection dies before WELCOME;
    // the attempt consumes one retry credit like any connect failure, and the next succeeds.
    struct FlakyConnector {
        attempts: Arc<AtomicU32>,
    }
    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> Result<ConnectorConnection> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let (peer_end, router_end) = direct_message_stream_pair();
            tokio::spawn(async move {
                let mut router = RouterEnd::new(router_end);
                if attempt == 0 {
                    // Read the HELLO, then drop the connection without answering.
                    router.recv().await.ok();
                    return;
                }
                if router.accept_hello(42).await.is_err() {
                    return;
                }
                while router.recv().await.is_ok() {}
            });
            Ok(ConnectorConnection {
                stream: Box::new(peer_end),
                details: TransportDetails::default(),
            })
        }
    }
    struct FlakyFactory {
        attempts: Arc<AtomicU32>,
    }
    impl ConnectorFactory for FlakyFactory {
        fn new_connector(
            &self,
            _: &TransportConfig,
            _: wampeer::serializer::serializer::SerializerRegistry,
        ) -> Result<Box<dyn Connector>> {
            Ok(Box::new(FlakyConnector {
                attempts: self.attempts.clone(),
            }))
        }
    }

    let attempts = Arc::new(AtomicU32::new(0));
    let connection = Connection::with_connector_factory(
        create_peer("flaky"),
        ConnectionConfig::new(REALM, transport_config(3)),
        Box::new(FlakyFactory {
            attempts: attempts.clone(),
        }),
    )
    .unwrap();

    assert_matches::assert_matches!(connection.connect().await, Ok(details) => {
        assert_eq!(details.session.value(), 42);
    });
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
