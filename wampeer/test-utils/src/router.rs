use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use wampeer::{
    core::{
        id::Id,
        stream::{
            DirectMessageStream,
            StreamMessage,
            direct_message_stream_pair,
        },
        types::{
            Dictionary,
            Value,
        },
    },
    message::message::{
        HelloMessage,
        Message,
        WelcomeMessage,
    },
    peer::Peer,
};

/// The router end of an in-process connection, scripted by the test.
pub struct RouterEnd {
    stream: DirectMessageStream,
}

impl RouterEnd {
    /// Wraps the router side of an in-process message stream pair.
    pub fn new(stream: DirectMessageStream) -> Self {
        Self { stream }
    }

    /// Receives the next message from the peer, echoing back transport pings.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            match self.stream.next().await {
                Some(Ok(StreamMessage::Message(message))) => return Ok(message),
                Some(Ok(StreamMessage::Ping(data))) => {
                    self.stream.send(StreamMessage::Ping(data)).await?;
                }
                Some(Err(err)) => return Err(err),
                None => return Err(Error::msg("peer closed the connection")),
            }
        }
    }

    /// Sends a message to the peer.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(StreamMessage::Message(message)).await
    }

    /// Receives the peer's HELLO and answers it with a WELCOME carrying the session ID and both
    /// router roles.
    pub async fn accept_hello(&mut self, session: u64) -> Result<HelloMessage> {
        let hello = match self.recv().await? {
            Message::Hello(hello) => hello,
            message => {
                return Err(Error::msg(format!(
                    "expected HELLO, got {}",
                    message.message_name()
                )));
            }
        };
        self.send(Message::Welcome(WelcomeMessage {
            session: Id::try_from(session).map_err(Error::new)?,
            details: router_roles(),
        }))
        .await?;
        Ok(hello)
    }
}

/// WELCOME details announcing the dealer and broker roles.
pub fn router_roles() -> Dictionary {
    Dictionary::from_iter([(
        "roles".to_owned(),
        Value::Dictionary(Dictionary::from_iter([
            ("dealer".to_owned(), Value::Dictionary(Dictionary::default())),
            ("broker".to_owned(), Value::Dictionary(Dictionary::default())),
        ])),
    )])
}

/// Connects the peer over an in-process message stream, returning the scripted router end.
pub async fn connect_direct(peer: &Peer) -> Result<RouterEnd> {
    let (peer_end, router_end) = direct_message_stream_pair();
    peer.direct_connect(Box::new(peer_end)).await?;
    Ok(RouterEnd { stream: router_end })
}
