use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use test_utils::router::{
    RouterEnd,
    connect_direct,
};
use wampeer::{
    core::{
        id::Id,
        match_style::MatchStyle,
        publish_options::PublishOptions,
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::{
        EventMessage,
        Message,
        PublishedMessage,
        RegisteredMessage,
        SubscribedMessage,
        UnregisteredMessage,
        UnsubscribedMessage,
    },
    peer::{
        Callee,
        Peer,
        PeerConfig,
        PublishedEvent,
        Publisher,
        Subscriber,
        Subscription,
        SubscriptionOptions,
    },
};

const REALM: &str = "com.wampeer.test";

fn create_peer(name: &str) -> Result<Peer, Error> {
    let mut config = PeerConfig::default();
    config.name = name.to_owned();
    Peer::new(config)
}

async fn connect_and_join(peer: &Peer) -> RouterEnd {
    let mut router = connect_direct(peer).await.unwrap();
    let (details, _) = tokio::join!(peer.join_realm(REALM), router.accept_hello(1));
    details.unwrap();
    router
}

async fn subscribe(peer: &Peer, router: &mut RouterEnd, topic: &str, id: u64) -> Subscription {
    let (subscription, _) = tokio::join!(
        peer.subscribe(Uri::try_from(topic).unwrap()),
        async {
            let subscribe = match router.recv().await.unwrap() {
                Message::Subscribe(subscribe) => subscribe,
                message => panic!("expected SUBSCRIBE, got {}", message.message_name()),
            };
            router
                .send(Message::Subscribed(SubscribedMessage {
                    subscribe_request: subscribe.request,
                    subscription: Id::try_from(id).unwrap(),
                }))
                .await
                .unwrap();
        }
    );
    subscription.unwrap()
}

/// Waits for the session task to deactivate a handle it has no request pending for.
async fn wait_deactivated<F>(active: F)
where
    F: Fn() -> bool,
{
    for _ in 0..100 {
        if !active() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("handle was not deactivated");
}

#[tokio::test]
async fn events_flow_to_the_subscription() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("subscriber").unwrap();
    let mut router = connect_and_join(&peer).await;

    let mut subscription = subscribe(&peer, &mut router, "com.x.topic", 55).await;
    assert_eq!(subscription.id.value(), 55);
    assert!(subscription.active());

    router
        .send(Message::Event(EventMessage {
            subscribed_subscription: Id::try_from(55).unwrap(),
            published_publication: Id::try_from(900).unwrap(),
            arguments: List::from_iter([Value::from("hi")]),
            arguments_keyword: Dictionary::from_iter([("n".to_owned(), Value::Integer(1))]),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(subscription.event_rx.recv().await, Ok(event) => {
        assert_eq!(event.publication.value(), 900);
        assert_eq!(event.arguments, List::from_iter([Value::from("hi")]));
        assert_eq!(
            event.arguments_keyword,
            Dictionary::from_iter([("n".to_owned(), Value::Integer(1))])
        );
        assert_eq!(event.topic, None);
    });
}

#[tokio::test]
async fn unsubscribe_deactivates_the_handle() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("subscriber").unwrap();
    let mut router = connect_and_join(&peer).await;

    let mut subscription = subscribe(&peer, &mut router, "com.x.topic", 55).await;

    let (unsubscribed, _) = tokio::join!(subscription.unsubscribe(), async {
        let unsubscribe = match router.recv().await.unwrap() {
            Message::Unsubscribe(unsubscribe) => unsubscribe,
            message => panic!("expected UNSUBSCRIBE, got {}", message.message_name()),
        };
        assert_eq!(unsubscribe.subscribed_subscription.value(), 55);
        router
            .send(Message::Unsubscribed(UnsubscribedMessage {
                unsubscribe_request: unsubscribe.request,
                ..Default::default()
            }))
            .await
            .unwrap();
    });
    assert_matches::assert_matches!(unsubscribed, Ok(()));
    assert!(!subscription.active());

    // An event racing the unsubscribe is discarded, and the session stays up.
    router
        .send(Message::Event(EventMessage {
            subscribed_subscription: Id::try_from(55).unwrap(),
            published_publication: Id::try_from(901).unwrap(),
            ..Default::default()
        }))
        .await
        .unwrap();
    let (published, _) = tokio::join!(
        peer.publish(
            Uri::try_from("com.x.topic").unwrap(),
            PublishedEvent::default()
        ),
        async {
            assert_matches::assert_matches!(router.recv().await, Ok(Message::Publish(_)));
        }
    );
    assert_matches::assert_matches!(published, Ok(()));
}

#[tokio::test]
async fn router_revocation_deactivates_handles_without_pending_requests() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("peer").unwrap();
    let mut router = connect_and_join(&peer).await;

    let subscription = subscribe(&peer, &mut router, "com.x.topic", 55).await;
    let (procedure, _) = tokio::join!(
        peer.register(Uri::try_from("com.x.fn").unwrap()),
        async {
            let register = match router.recv().await.unwrap() {
                Message::Register(register) => register,
                message => panic!("expected REGISTER, got {}", message.message_name()),
            };
            router
                .send(Message::Registered(RegisteredMessage {
                    register_request: register.request,
                    registration: Id::try_from(77).unwrap(),
                }))
                .await
                .unwrap();
        }
    );
    let procedure = procedure.unwrap();

    // A zero request ID with the resource in the details marks a revocation: no request of ours
    // is pending, but the handle deactivates.
    router
        .send(Message::Unsubscribed(UnsubscribedMessage {
            details: Dictionary::from_iter([
                ("subscription".to_owned(), Value::Integer(55)),
                ("reason".to_owned(), Value::from("wamp.subscription.revoked")),
            ]),
            ..Default::default()
        }))
        .await
        .unwrap();
    wait_deactivated(|| subscription.active()).await;

    router
        .send(Message::Unregistered(UnregisteredMessage {
            details: Dictionary::from_iter([(
                "registration".to_owned(),
                Value::Integer(77),
            )]),
            ..Default::default()
        }))
        .await
        .unwrap();
    wait_deactivated(|| procedure.active()).await;
}

#[tokio::test]
async fn acknowledged_publish_returns_the_publication_id() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("publisher").unwrap();
    let mut router = connect_and_join(&peer).await;

    let (publication, _) = tokio::join!(
        peer.publish_with_options(
            Uri::try_from("com.x.topic").unwrap(),
            PublishOptions {
                acknowledge: true,
                ..Default::default()
            },
            PublishedEvent {
                arguments: List::from_iter([Value::Integer(42)]),
                ..Default::default()
            },
        ),
        async {
            let publish = match router.recv().await.unwrap() {
                Message::Publish(publish) => publish,
                message => panic!("expected PUBLISH, got {}", message.message_name()),
            };
            assert_eq!(publish.options.get("acknowledge"), Some(&Value::Bool(true)));
            assert_eq!(publish.arguments, List::from_iter([Value::Integer(42)]));
            router
                .send(Message::Published(PublishedMessage {
                    publish_request: publish.request,
                    publication: Id::try_from(123).unwrap(),
                }))
                .await
                .unwrap();
        }
    );
    assert_matches::assert_matches!(publication, Ok(Some(id)) => {
        assert_eq!(id.value(), 123);
    });
}

#[tokio::test]
async fn unacknowledged_publish_resolves_without_confirmation() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("publisher").unwrap();
    let mut router = connect_and_join(&peer).await;

    // No PUBLISHED ever arrives; the publish resolves as soon as the message is out.
    assert_matches::assert_matches!(
        peer.publish(
            Uri::try_from("com.x.topic").unwrap(),
            PublishedEvent::default()
        )
        .await,
        Ok(())
    );
    assert_matches::assert_matches!(router.recv().await, Ok(Message::Publish(publish)) => {
        assert!(publish.options.is_empty());
    });
}

#[tokio::test]
async fn prefix_subscription_carries_the_match_option_and_concrete_topic() {
    test_utils::setup::setup_test_environment();

    let peer = create_peer("subscriber").unwrap();
    let mut router = connect_and_join(&peer).await;

    let (subscription, _) = tokio::join!(
        peer.subscribe_with_options(
            WildcardUri::try_from("com.myapp").unwrap(),
            SubscriptionOptions {
                match_style: MatchStyle::Prefix,
            },
        ),
        async {
            let subscribe = match router.recv().await.unwrap() {
                Message::Subscribe(subscribe) => subscribe,
                message => panic!("expected SUBSCRIBE, got {}", message.message_name()),
            };
            assert_eq!(subscribe.options.get("match"), Some(&Value::from("prefix")));
            router
                .send(Message::Subscribed(SubscribedMessage {
                    subscribe_request: subscribe.request,
                    subscription: Id::try_from(56).unwrap(),
                }))
                .await
                .unwrap();
        }
    );
    let mut subscription = subscription.unwrap();

    // Pattern-based events carry the concrete topic in their details.
    router
        .send(Message::Event(EventMessage {
            subscribed_subscription: Id::try_from(56).unwrap(),
            published_publication: Id::try_from(902).unwrap(),
            details: Dictionary::from_iter([(
                "topic".to_owned(),
                Value::from("com.myapp.orders"),
            )]),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_matches::assert_matches!(subscription.event_rx.recv().await, Ok(event) => {
        assert_eq!(event.topic, Some(Uri::try_from("com.myapp.orders").unwrap()));
    });
}
