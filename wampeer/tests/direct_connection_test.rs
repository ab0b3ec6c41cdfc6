use anyhow::{
    Error,
    Result,
};
use test_utils::router::connect_direct;
use wampeer::{
    core::{
        error::{
            InteractionError,
            NotEstablishedError,
            TransportLost,
        },
        types::{
            List,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        GoodbyeMessage,
        Message,
        ResultMessage,
    },
    peer::{
        Caller,
        Peer,
        PeerConfig,
        PeerNotConnectedError,
        RpcCall,
        RpcResult,
        SessionEvent,
        Subscriber,
    },
};

const REALM: &str = "realm1";

fn create_peer(name: &str) -> Result<Peer, Error> {
    let mut config = PeerConfig::default();
    config.name = name.to_owned();
    Peer::new(config)
}

#[tokio::test]
async fn establishes_session_calls_procedure_and_closes_cleanly() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("caller").unwrap();
    let mut event_rx = peer.session_event_rx();
    let mut router = connect_direct(&peer).await.unwrap();

    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Connect { .. }));

    // The session ID sits exactly at the upper bound of the ID range (2^53).
    let (details, hello) = tokio::join!(
        peer.join_realm(REALM),
        router.accept_hello(9007199254740992)
    );
    let hello = hello.unwrap();
    assert_eq!(hello.realm, Some(Uri::try_from(REALM).unwrap()));
    assert_matches::assert_matches!(hello.details.get("roles"), Some(Value::Dictionary(roles)) => {
        assert!(roles.contains_key("caller"));
    });
    assert_matches::assert_matches!(&details, Ok(details) => {
        assert_eq!(details.session.value(), 9007199254740992);
        assert_eq!(details.realm, Some(Uri::try_from(REALM).unwrap()));
    });

    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Join { details }) => {
        assert_eq!(details.session.value(), 9007199254740992);
    });
    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Ready));

    let rpc = peer
        .call(
            Uri::try_from("com.x.add2").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::Integer(2), Value::Integer(3)]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let call = match router.recv().await.unwrap() {
        Message::Call(call) => call,
        message => panic!("expected CALL, got {}", message.message_name()),
    };
    assert_eq!(call.procedure, Uri::try_from("com.x.add2").unwrap());
    assert_eq!(
        call.arguments,
        List::from_iter([Value::Integer(2), Value::Integer(3)])
    );

    router
        .send(Message::Result(ResultMessage {
            call_request: call.request,
            arguments: List::from_iter([Value::Integer(5)]),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(rpc.result().await, Ok(result) => {
        pretty_assertions::assert_eq!(result, RpcResult {
            arguments: List::from_iter([Value::Integer(5)]),
            ..Default::default()
        });
    });

    let (left, goodbye) = tokio::join!(peer.leave_realm(), async {
        let goodbye = match router.recv().await? {
            Message::Goodbye(goodbye) => goodbye,
            message => {
                return Err(Error::msg(format!(
                    "expected GOODBYE, got {}",
                    message.message_name()
                )));
            }
        };
        router
            .send(Message::Goodbye(GoodbyeMessage {
                reason: Uri::try_from("wamp.close.goodbye_and_out").unwrap(),
                ..Default::default()
            }))
            .await?;
        Ok(goodbye)
    });
    assert_matches::assert_matches!(left, Ok(()));
    assert_matches::assert_matches!(goodbye, Ok(goodbye) => {
        assert_eq!(goodbye.reason.as_ref(), "wamp.close.normal");
    });

    // Leave fires before the disconnect, and the close is clean.
    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Leave { reason }) => {
        assert_eq!(reason.as_ref(), "wamp.close.normal");
    });
    assert_matches::assert_matches!(
        event_rx.recv().await,
        Ok(SessionEvent::Disconnect { clean: true })
    );
}

#[tokio::test]
async fn session_can_be_reestablished_after_clean_close() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("rejoiner").unwrap();
    let mut router = connect_direct(&peer).await.unwrap();

    let (details, _) = tokio::join!(peer.join_realm(REALM), router.accept_hello(1));
    assert_matches::assert_matches!(details, Ok(_));

    let (left, _) = tokio::join!(peer.leave_realm(), async {
        router.recv().await.unwrap();
        router
            .send(Message::Goodbye(GoodbyeMessage {
                reason: Uri::try_from("wamp.close.goodbye_and_out").unwrap(),
                ..Default::default()
            }))
            .await
            .unwrap();
    });
    assert_matches::assert_matches!(left, Ok(()));

    // The closed session can start over on the same connection.
    let (details, _) = tokio::join!(peer.join_realm(REALM), router.accept_hello(2));
    assert_matches::assert_matches!(details, Ok(details) => {
        assert_eq!(details.session.value(), 2);
    });
}

#[tokio::test]
async fn router_initiated_goodbye_closes_the_session() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("peer").unwrap();
    let mut event_rx = peer.session_event_rx();
    let mut router = connect_direct(&peer).await.unwrap();

    let (details, _) = tokio::join!(peer.join_realm(REALM), router.accept_hello(1));
    assert_matches::assert_matches!(details, Ok(_));

    router
        .send(Message::Goodbye(GoodbyeMessage {
            reason: Uri::try_from("wamp.close.system_shutdown").unwrap(),
            ..Default::default()
        }))
        .await
        .unwrap();

    // The peer echoes the GOODBYE back.
    assert_matches::assert_matches!(router.recv().await, Ok(Message::Goodbye(goodbye)) => {
        assert_eq!(goodbye.reason.as_ref(), "wamp.close.goodbye_and_out");
    });

    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Connect { .. }));
    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Join { .. }));
    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Ready));
    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Leave { reason }) => {
        assert_eq!(reason.as_ref(), "wamp.close.system_shutdown");
    });
    assert_matches::assert_matches!(
        event_rx.recv().await,
        Ok(SessionEvent::Disconnect { clean: true })
    );
}

#[tokio::test]
async fn transport_loss_resolves_pending_calls_and_disconnects_uncleanly() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("caller").unwrap();
    let mut event_rx = peer.session_event_rx();
    let mut router = connect_direct(&peer).await.unwrap();

    let (details, _) = tokio::join!(peer.join_realm(REALM), router.accept_hello(1));
    assert_matches::assert_matches!(details, Ok(_));

    let rpc = peer
        .call(Uri::try_from("com.x.slow").unwrap(), RpcCall::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(router.recv().await, Ok(Message::Call(_)));

    // The router vanishes while the call awaits its result.
    drop(router);

    assert_matches::assert_matches!(rpc.result().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<TransportLost>(), Ok(TransportLost));
    });

    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Connect { .. }));
    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Join { .. }));
    assert_matches::assert_matches!(event_rx.recv().await, Ok(SessionEvent::Ready));
    assert_matches::assert_matches!(
        event_rx.recv().await,
        Ok(SessionEvent::Disconnect { clean: false })
    );
}

#[tokio::test]
async fn role_operations_fail_locally_outside_an_established_session() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("peer").unwrap();

    // Not connected at all.
    assert_matches::assert_matches!(
        peer.call(Uri::try_from("com.x.fn").unwrap(), RpcCall::default())
            .await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast::<PeerNotConnectedError>(), Ok(_));
        }
    );

    // Connected, but no session established: the operation resolves locally, with no wire
    // traffic.
    let _router = connect_direct(&peer).await.unwrap();
    let rpc = peer
        .call(Uri::try_from("com.x.fn").unwrap(), RpcCall::default())
        .await
        .unwrap();
    assert_matches::assert_matches!(rpc.result().await, Err(err) => {
        assert_matches::assert_matches!(err.downcast::<NotEstablishedError>(), Ok(_));
    });
    assert_matches::assert_matches!(
        peer.subscribe(Uri::try_from("com.x.topic").unwrap()).await,
        Err(err) => {
            assert_matches::assert_matches!(err.downcast::<NotEstablishedError>(), Ok(_));
        }
    );
}

#[tokio::test]
async fn abort_during_establishment_fails_the_join() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("peer").unwrap();
    let mut router = connect_direct(&peer).await.unwrap();

    let (details, _) = tokio::join!(peer.join_realm(REALM), async {
        router.recv().await.unwrap();
        router
            .send(Message::Abort(AbortMessage {
                reason: Uri::try_from("wamp.error.no_such_realm").unwrap(),
                ..Default::default()
            }))
            .await
            .unwrap();
    });
    assert_matches::assert_matches!(details, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast::<InteractionError>(),
            Ok(InteractionError::NoSuchRealm)
        );
    });
}
