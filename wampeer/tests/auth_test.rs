use anyhow::{
    Error,
    Result,
};
use test_utils::router::{
    connect_direct,
    router_roles,
};
use wampeer::{
    core::{
        id::Id,
        types::{
            Dictionary,
            List,
            Value,
        },
    },
    message::message::{
        ChallengeMessage,
        Message,
        WelcomeMessage,
    },
    peer::{
        Peer,
        PeerConfig,
        SupportedAuthMethod,
    },
};

const REALM: &str = "com.wampeer.test";

fn create_peer(name: &str) -> Result<Peer, Error> {
    let mut config = PeerConfig::default();
    config.name = name.to_owned();
    Peer::new(config)
}

#[tokio::test]
async fn ticket_authentication_round_trip() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("authenticating").unwrap();
    let mut router = connect_direct(&peer).await.unwrap();

    let auth_methods = [SupportedAuthMethod::Ticket {
        id: "user".to_owned(),
        ticket: "hunter2".to_owned(),
    }];
    let (details, _) = tokio::join!(
        peer.join_realm_with_authentication(REALM, &auth_methods),
        async {
            let hello = match router.recv().await.unwrap() {
                Message::Hello(hello) => hello,
                message => panic!("expected HELLO, got {}", message.message_name()),
            };
            assert_eq!(
                hello.details.get("authmethods"),
                Some(&Value::List(List::from_iter([Value::from("ticket")])))
            );
            assert_eq!(hello.details.get("authid"), Some(&Value::from("user")));

            router
                .send(Message::Challenge(ChallengeMessage {
                    auth_method: "ticket".to_owned(),
                    extra: Dictionary::default(),
                }))
                .await
                .unwrap();
            let authenticate = match router.recv().await.unwrap() {
                Message::Authenticate(authenticate) => authenticate,
                message => panic!("expected AUTHENTICATE, got {}", message.message_name()),
            };
            assert_eq!(authenticate.signature, "hunter2");

            let mut details = router_roles();
            details.insert("authid".to_owned(), Value::from("user"));
            details.insert("authrole".to_owned(), Value::from("frontend"));
            details.insert("authmethod".to_owned(), Value::from("ticket"));
            router
                .send(Message::Welcome(WelcomeMessage {
                    session: Id::try_from(7).unwrap(),
                    details,
                }))
                .await
                .unwrap();
        }
    );
    assert_matches::assert_matches!(details, Ok(details) => {
        assert_eq!(details.session.value(), 7);
        assert_eq!(details.authid.as_deref(), Some("user"));
        assert_eq!(details.authrole.as_deref(), Some("frontend"));
        assert_eq!(details.authmethod.as_deref(), Some("ticket"));
    });
}

#[tokio::test]
async fn unsupported_challenge_method_aborts_establishment() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("mismatched").unwrap();
    let mut router = connect_direct(&peer).await.unwrap();

    let auth_methods = [SupportedAuthMethod::Ticket {
        id: "user".to_owned(),
        ticket: "hunter2".to_owned(),
    }];
    let (details, _) = tokio::join!(
        peer.join_realm_with_authentication(REALM, &auth_methods),
        async {
            router.recv().await.unwrap();
            router
                .send(Message::Challenge(ChallengeMessage {
                    auth_method: "cryptosign".to_owned(),
                    extra: Dictionary::default(),
                }))
                .await
                .unwrap();
            // The peer refuses the challenge and aborts the establishment itself.
            assert_matches::assert_matches!(router.recv().await, Ok(Message::Abort(_)));
        }
    );
    assert_matches::assert_matches!(details, Err(err) => {
        assert!(err.to_string().contains("unsupported auth method cryptosign"));
    });
}

#[tokio::test]
async fn failing_authenticator_aborts_establishment() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("failing").unwrap();
    let mut router = connect_direct(&peer).await.unwrap();

    let auth_methods = [SupportedAuthMethod::WampCra {
        id: "user".to_owned(),
        secret: "secret123".to_owned(),
    }];
    let (details, _) = tokio::join!(
        peer.join_realm_with_authentication(REALM, &auth_methods),
        async {
            router.recv().await.unwrap();
            // A WAMP-CRA challenge with no challenge string fails the authenticator.
            router
                .send(Message::Challenge(ChallengeMessage {
                    auth_method: "wampcra".to_owned(),
                    extra: Dictionary::default(),
                }))
                .await
                .unwrap();
            assert_matches::assert_matches!(router.recv().await, Ok(Message::Abort(abort)) => {
                assert_matches::assert_matches!(abort.details.get("message"), Some(Value::String(message)) => {
                    assert!(message.contains("authentication failed"));
                });
            });
        }
    );
    assert_matches::assert_matches!(details, Err(err) => {
        assert!(err.to_string().contains("authentication failed"));
    });
}
