use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
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
use futures_util::{
    Stream,
    StreamExt,
    lock::Mutex,
};
use log::{
    error,
    info,
    warn,
};
use thiserror::Error;
use tokio::sync::{
    broadcast::{
        self,
        error::RecvError,
    },
    mpsc::{
        UnboundedReceiver,
        UnboundedSender,
        unbounded_channel,
    },
    oneshot,
};
use uuid::Uuid;

use crate::{
    auth::{
        AuthMethod,
        ClientAuthenticator,
        TicketAuthenticator,
        WampCraAuthenticator,
    },
    core::{
        cancel::CallCancelMode,
        close::CloseReason,
        error::{
            BasicError,
            ChannelTransmittableError,
            ChannelTransmittableResult,
        },
        features::{
            PubSubFeatures,
            RpcFeatures,
        },
        id::{
            Id,
            SequentialIdAllocator,
        },
        match_style::MatchStyle,
        publish_options::PublishOptions,
        realm::validate_realm_name,
        roles::{
            PeerRole,
            PeerRoles,
        },
        service::{
            Service,
            ServiceHandle,
        },
        stream::MessageStream,
        types::{
            Bytes,
            Dictionary,
            List,
            Value,
            WampSerialize,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::Message,
    peer::{
        connector::new_connector,
        session::{
            CancelReason,
            ProcedureMessage,
            PublishedEvent,
            ReceivedEvent,
            Session,
            SessionCommand,
            SessionDetails,
            SessionEvent,
            SessionHandle,
        },
    },
    serializer::serializer::SerializerRegistry,
    transport::{
        config::TransportConfig,
        transport::TransportDetails,
    },
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// How long a graceful close waits for the router's GOODBYE before force-closing the transport.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Error for a peer not being connected for some operation.
#[derive(Debug, Error)]
#[error("peer is not connected")]
pub struct PeerNotConnectedError;

/// Configuration for a [`Peer`].
#[derive(Debug)]
pub struct PeerConfig {
    /// Name of the peer, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Roles implemented by the peer.
    pub roles: ahash::HashSet<PeerRole>,
    /// Serializer implementations available for transport negotiation.
    ///
    /// Concrete codecs are collaborators registered by the application; direct (in-process)
    /// connections need none.
    pub serializers: SerializerRegistry,
    /// The cancel mode used when a per-call timeout expires.
    pub timeout_cancel_mode: CallCancelMode,
}

impl PeerConfig {
    fn validate(&self) -> Result<()> {
        if self.roles.is_empty() {
            return Err(Error::msg("at least one peer role is required"));
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: format!("{DEFAULT_AGENT}-{}", Uuid::new_v4()),
            agent: DEFAULT_AGENT.to_owned(),
            roles: ahash::HashSet::from_iter([
                PeerRole::Callee,
                PeerRole::Caller,
                PeerRole::Publisher,
                PeerRole::Subscriber,
            ]),
            serializers: SerializerRegistry::default(),
            timeout_cancel_mode: CallCancelMode::KillNoWait,
        }
    }
}

/// Supported authentication methods for a peer.
#[derive(Debug, Clone)]
pub enum SupportedAuthMethod {
    /// Ticket-based authentication.
    Ticket { id: String, ticket: String },
    /// WAMP challenge-response authentication.
    WampCra { id: String, secret: String },
}

impl SupportedAuthMethod {
    /// The corresponding [`AuthMethod`].
    pub fn auth_method(&self) -> AuthMethod {
        match self {
            Self::Ticket { .. } => AuthMethod::Ticket,
            Self::WampCra { .. } => AuthMethod::WampCra,
        }
    }

    /// Creates a new authenticator for the supported authentication method.
    pub fn new_authenticator(&self) -> Arc<dyn ClientAuthenticator> {
        match self {
            Self::Ticket { id, ticket } => {
                Arc::new(TicketAuthenticator::new(id.clone(), ticket.clone()))
            }
            Self::WampCra { id, secret } => {
                Arc::new(WampCraAuthenticator::new(id.clone(), secret.clone()))
            }
        }
    }
}

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionOptions {
    /// How the subscription should be matched for published events.
    pub match_style: MatchStyle,
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone)]
pub struct ProcedureOptions {
    /// How the procedure should be matched for procedure calls.
    pub match_style: MatchStyle,
    /// The caller's identity should be disclosed.
    pub disclose_caller: bool,
}

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// An opaque, pre-encoded application payload bypassing the session serializer. Mutually
    /// exclusive with `arguments` and `arguments_keyword`.
    pub payload: Option<Bytes>,
    /// A local bound on how long to await the result.
    pub timeout: Option<Duration>,
}

/// A result of a procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub payload: Option<Bytes>,
    pub progress: bool,
}

#[derive(Debug)]
struct PendingRpc {
    request_id: Id,
    result_rx: UnboundedReceiver<ChannelTransmittableResult<RpcResult>>,
    command_tx: UnboundedSender<SessionCommand>,
    timeout: Option<Duration>,
    timeout_cancel_mode: CallCancelMode,
}

impl PendingRpc {
    async fn next_result(&mut self) -> Result<RpcResult> {
        match self.timeout {
            Some(timeout) => {
                tokio::select! {
                    result = self.result_rx.recv() => Self::unwrap_result(result),
                    _ = tokio::time::sleep(timeout) => {
                        // The local timeout cancels the call; the pending entry resolves with a
                        // timeout error unless a response won the race.
                        self.command_tx
                            .send(SessionCommand::CancelCall {
                                request: self.request_id,
                                mode: self.timeout_cancel_mode,
                                reason: CancelReason::Timeout,
                            })
                            .ok();
                        Self::unwrap_result(self.result_rx.recv().await)
                    }
                }
            }
            None => Self::unwrap_result(self.result_rx.recv().await),
        }
    }

    fn unwrap_result(result: Option<ChannelTransmittableResult<RpcResult>>) -> Result<RpcResult> {
        match result {
            Some(result) => result.map_err(ChannelTransmittableError::into_error),
            None => Err(PeerNotConnectedError.into()),
        }
    }

    fn cancel(&self, mode: CallCancelMode) -> Result<()> {
        self.command_tx
            .send(SessionCommand::CancelCall {
                request: self.request_id,
                mode,
                reason: CancelReason::User,
            })
            .map_err(|_| PeerNotConnectedError.into())
    }
}

/// A simple pending RPC, which is expected to produce one result.
#[derive(Debug)]
pub struct SimplePendingRpc {
    pending: PendingRpc,
}

impl SimplePendingRpc {
    /// The request ID of the call.
    pub fn request_id(&self) -> Id {
        self.pending.request_id
    }

    /// Waits for the result of the procedure call.
    pub async fn result(mut self) -> Result<RpcResult> {
        self.pending.next_result().await
    }

    /// Cancels the pending call.
    pub fn cancel(&self) -> Result<()> {
        self.pending.cancel(CallCancelMode::KillNoWait)
    }

    /// Kills the pending call.
    ///
    /// The end error, or result, can still be read from [`Self::result`].
    pub fn kill(&self) -> Result<()> {
        self.pending.cancel(CallCancelMode::Kill)
    }
}

/// A progressive pending RPC, which is expected to produce one or more results.
#[derive(Debug)]
pub struct ProgressivePendingRpc {
    pending: PendingRpc,
    done: bool,
    canceled: bool,
}

impl ProgressivePendingRpc {
    /// Returns true if the RPC has received all of its results.
    pub fn done(&self) -> bool {
        self.done
    }

    /// The request ID of the call.
    pub fn request_id(&self) -> Id {
        self.pending.request_id
    }

    /// Waits for the next result of the procedure call.
    pub async fn next_result(&mut self) -> Result<Option<RpcResult>> {
        if self.done {
            return Ok(None);
        }
        match self.pending.next_result().await {
            Ok(result) => {
                self.done = self.canceled || !result.progress;
                Ok(Some(result))
            }
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }

    /// Cancels the pending call.
    pub fn cancel(&mut self) -> Result<()> {
        // Do not set the canceled flag, since we expect the router to send the final error.
        self.pending.cancel(CallCancelMode::KillNoWait)
    }

    /// Kills the pending call.
    ///
    /// The end error, or result, can still be read from [`Self::next_result`].
    pub fn kill(&mut self) -> Result<()> {
        // Whatever arrives next terminates this call, even if it is not an error (in the case
        // that the callee finishes the invocation).
        self.canceled = true;
        self.pending.cancel(CallCancelMode::Kill)
    }

    /// Wraps the pending RPC as a stream of results.
    ///
    /// The stream is finished on the last result or error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RpcResult>> {
        futures_util::stream::unfold(self, move |mut rpc| async {
            match rpc.next_result().await {
                Ok(Some(result)) => Some((Ok(result), rpc)),
                Ok(None) => None,
                Err(err) => Some((Err(err), rpc)),
            }
        })
        .boxed()
    }
}

/// A subscription to a topic.
///
/// The handle owns a receiver for published events and a non-owning back-reference to the session
/// for unsubscribing. The subscription deactivates when the session confirms unsubscription, when
/// the router revokes it, or when the session closes.
#[derive(Debug)]
pub struct Subscription {
    /// The subscription ID.
    pub id: Id,
    /// The subscribed topic (or topic pattern).
    pub topic: WildcardUri,
    /// The event receiver channel.
    pub event_rx: broadcast::Receiver<ReceivedEvent>,

    pub(crate) active: Arc<AtomicBool>,
    pub(crate) command_tx: UnboundedSender<SessionCommand>,
    pub(crate) id_allocator: Arc<SequentialIdAllocator>,
}

impl Subscription {
    /// Whether the subscription is still active.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes the subscription.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        let request = self.id_allocator.generate_id().await;
        let (unsubscribed_tx, unsubscribed_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Unsubscribe {
                request,
                subscription: self.id,
                unsubscribed_tx,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;
        match unsubscribed_rx.await {
            Ok(result) => result.map_err(ChannelTransmittableError::into_error),
            Err(_) => Err(PeerNotConnectedError.into()),
        }
    }
}

impl Clone for Subscription {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            topic: self.topic.clone(),
            event_rx: self.event_rx.resubscribe(),
            active: self.active.clone(),
            command_tx: self.command_tx.clone(),
            id_allocator: self.id_allocator.clone(),
        }
    }
}

/// A registration of a procedure.
///
/// Invocations (and interrupts) for the procedure arrive on the message receiver channel. The
/// registration deactivates when the session confirms unregistration, when the router revokes it,
/// or when the session closes.
#[derive(Debug)]
pub struct Procedure {
    /// The registration ID.
    pub id: Id,
    /// The registered procedure (or procedure pattern).
    pub procedure: WildcardUri,
    /// The message receiver channel.
    pub procedure_message_rx: broadcast::Receiver<ProcedureMessage>,

    pub(crate) active: Arc<AtomicBool>,
    pub(crate) command_tx: UnboundedSender<SessionCommand>,
    pub(crate) id_allocator: Arc<SequentialIdAllocator>,
}

impl Procedure {
    /// Whether the registration is still active.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Removes the registration.
    pub async fn unregister(&mut self) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        let request = self.id_allocator.generate_id().await;
        let (unregistered_tx, unregistered_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Unregister {
                request,
                registration: self.id,
                unregistered_tx,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;
        match unregistered_rx.await {
            Ok(result) => result.map_err(ChannelTransmittableError::into_error),
            Err(_) => Err(PeerNotConnectedError.into()),
        }
    }
}

impl Clone for Procedure {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            procedure: self.procedure.clone(),
            procedure_message_rx: self.procedure_message_rx.resubscribe(),
            active: self.active.clone(),
            command_tx: self.command_tx.clone(),
            id_allocator: self.id_allocator.clone(),
        }
    }
}

struct PeerState {
    service: ServiceHandle,
    command_tx: UnboundedSender<SessionCommand>,
    session: SessionHandle,
    id_allocator: Arc<SequentialIdAllocator>,
}

/// A WAMP peer (a.k.a., client) that connects to a WAMP router, establishes sessions in a realm,
/// and interacts with resources in the realm.
///
/// Role operations are exposed through the [`Caller`], [`Callee`], [`Publisher`], and
/// [`Subscriber`] capability interfaces, all implemented by this type.
pub struct Peer {
    config: PeerConfig,
    event_tx: broadcast::Sender<SessionEvent>,
    peer_state: Arc<Mutex<Option<PeerState>>>,
}

impl Peer {
    /// Creates a new peer.
    pub fn new(config: PeerConfig) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(16);
        Ok(Self {
            config,
            event_tx,
            peer_state: Arc::new(Mutex::new(None)),
        })
    }

    /// Receiver channel for session lifecycle events.
    pub fn session_event_rx(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// The serializer implementations available for transport negotiation.
    pub fn serializers(&self) -> SerializerRegistry {
        self.config.serializers.clone()
    }

    /// Connects to a router over the given transport.
    ///
    /// This method merely establishes a network connection with the router. It does not establish
    /// any WAMP session; see [`Self::join_realm`].
    pub async fn connect(&self, config: &TransportConfig) -> Result<()> {
        let connector = new_connector(config, self.config.serializers.clone())?;
        let connection = tokio::time::timeout(config.connect_timeout(), connector.connect())
            .await
            .map_err(|_| Error::msg("timed out connecting to the router"))??;
        info!(
            "WAMP connection established with {} for peer {}",
            connection.details.peer.as_deref().unwrap_or("router"),
            self.config.name
        );
        self.attach(connection.stream, connection.details).await
    }

    /// Directly connects to a router with the given message stream.
    ///
    /// Used for in-process connections that bypass framing and serialization.
    pub async fn direct_connect(&self, stream: Box<dyn MessageStream>) -> Result<()> {
        self.attach(stream, TransportDetails::default()).await
    }

    pub(crate) async fn attach(
        &self,
        stream: Box<dyn MessageStream>,
        details: TransportDetails,
    ) -> Result<()> {
        let service = Service::new(self.config.name.clone(), stream);
        let service_message_rx = service.message_rx();
        let end_rx = service.end_rx();
        let service_handle = service.start();

        let (command_tx, command_rx) = unbounded_channel();
        let id_allocator = Arc::new(SequentialIdAllocator::default());
        let session = Session::new(
            self.config.name.clone(),
            service_handle.message_tx(),
            command_tx.clone(),
            id_allocator.clone(),
            self.event_tx.clone(),
        );
        let session_handle = session.handle();

        let mut peer_state = self.peer_state.lock().await;
        // End any active connection.
        if let Some(previous) = peer_state.take() {
            previous.service.cancel().ok();
        }
        *peer_state = Some(PeerState {
            service: service_handle,
            command_tx: command_tx.clone(),
            session: session_handle,
            id_allocator,
        });

        tokio::spawn(Self::session_task(
            session,
            command_rx,
            service_message_rx,
            end_rx,
            command_tx,
            self.peer_state.clone(),
        ));

        self.event_tx
            .send(SessionEvent::Connect { transport: details })
            .ok();
        Ok(())
    }

    /// The task owning one session exclusively.
    ///
    /// All session state mutation happens here, strictly sequentially with respect to the
    /// connection.
    async fn session_task(
        mut session: Session,
        mut command_rx: UnboundedReceiver<SessionCommand>,
        mut service_message_rx: broadcast::Receiver<Message>,
        mut end_rx: broadcast::Receiver<()>,
        command_tx: UnboundedSender<SessionCommand>,
        peer_state: Arc<Mutex<Option<PeerState>>>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if let Err(err) = session.handle_command(command).await {
                            error!("Peer session {} failed to handle command: {err:#}", session.name());
                        }
                    }
                    // The peer (and every handle) is gone.
                    None => break,
                },
                message = service_message_rx.recv() => match message {
                    Ok(message) => {
                        let message_name = message.message_name();
                        if let Err(err) = session.handle_message(message).await {
                            error!(
                                "Peer session {} failed to handle {message_name} message: {err:#}",
                                session.name()
                            );
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        error!(
                            "Peer session {} lagged behind the service by {skipped} messages",
                            session.name()
                        );
                    }
                },
                _ = end_rx.recv() => break,
            }
        }

        session.handle_transport_lost();

        // Drop the connection state, unless a newer connection already replaced it, so that later
        // operations fail fast.
        let mut peer_state = peer_state.lock().await;
        if peer_state
            .as_ref()
            .is_some_and(|state| state.command_tx.same_channel(&command_tx))
        {
            if let Some(state) = peer_state.take() {
                state.service.cancel().ok();
            }
        }
    }

    async fn with_peer_state<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&PeerState) -> T,
    {
        match self.peer_state.lock().await.as_ref() {
            Some(peer_state) => Ok(f(peer_state)),
            None => Err(PeerNotConnectedError.into()),
        }
    }

    /// Joins the realm, establishing a WAMP session.
    ///
    /// The session exists for as long as the router allows it to. The session will be lost in the
    /// following scenarios:
    /// 1. [`Self::leave_realm`] is called.
    /// 1. The router terminates the session due to an error.
    /// 1. The underlying connection to the router is lost.
    pub async fn join_realm(&self, realm: &str) -> Result<SessionDetails> {
        self.join_realm_internal(realm, &[]).await
    }

    /// Joins the realm, establishing a WAMP session, with a list of supported authentication
    /// methods.
    ///
    /// Behaves the same as [`Self::join_realm`], but allows authentication to be used if
    /// challenged by the router.
    pub async fn join_realm_with_authentication(
        &self,
        realm: &str,
        auth_methods: &[SupportedAuthMethod],
    ) -> Result<SessionDetails> {
        self.join_realm_internal(realm, auth_methods).await
    }

    async fn join_realm_internal(
        &self,
        realm: &str,
        auth_methods: &[SupportedAuthMethod],
    ) -> Result<SessionDetails> {
        validate_realm_name(realm).map_err(Error::new)?;

        let (command_tx, mut established_session_rx) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.established_session_rx(),
                )
            })
            .await?;

        let mut details = Dictionary::default();
        details.insert("agent".to_owned(), Value::String(self.config.agent.clone()));
        let pub_sub_features = PubSubFeatures {
            subscriber_blackwhite_listing: true,
            publisher_exclusion: true,
        };
        let rpc_features = RpcFeatures {
            call_canceling: true,
            progressive_call_results: true,
            call_timeout: false,
            caller_identification: true,
            payload_transparency: true,
        };
        details.insert(
            "roles".to_owned(),
            PeerRoles::new(
                self.config.roles.iter().cloned(),
                pub_sub_features,
                rpc_features,
            )
            .wamp_serialize()
            .map_err(Error::new)?,
        );

        let authenticators = auth_methods
            .iter()
            .map(SupportedAuthMethod::new_authenticator)
            .collect();

        command_tx
            .send(SessionCommand::Hello {
                realm: Some(Uri::from_known(realm)),
                details,
                authenticators,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;

        loop {
            match established_session_rx.recv().await {
                Ok(Ok(details)) => {
                    self.event_tx.send(SessionEvent::Ready).ok();
                    return Ok(details);
                }
                Ok(Err(err)) => return Err(err.into_error()),
                Err(RecvError::Closed) => return Err(PeerNotConnectedError.into()),
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Leaves the realm, closing the WAMP session.
    ///
    /// Waits a bounded grace period for the router's GOODBYE; past it, the transport is
    /// force-closed.
    pub async fn leave_realm(&self) -> Result<()> {
        let (command_tx, mut closed_session_rx) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.closed_session_rx(),
                )
            })
            .await?;

        command_tx
            .send(SessionCommand::Goodbye {
                reason: CloseReason::Normal,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;

        match tokio::time::timeout(CLOSE_GRACE_PERIOD, closed_session_rx.recv()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PeerNotConnectedError.into()),
            Err(_) => {
                warn!(
                    "Peer {} did not receive GOODBYE from the router in time; dropping the connection",
                    self.config.name
                );
                self.disconnect().await
            }
        }
    }

    /// Disconnects from the router.
    pub async fn disconnect(&self) -> Result<()> {
        let mut peer_state = self.peer_state.lock().await;
        match peer_state.take() {
            Some(peer_state) => {
                info!(
                    "Peer {} was instructed to disconnect from the router",
                    self.config.name
                );
                peer_state.service.cancel()?;
                peer_state.service.join().await?;
            }
            None => (),
        }
        Ok(())
    }

    fn check_payload_exclusivity(
        payload: &Option<Bytes>,
        arguments: &List,
        arguments_keyword: &Dictionary,
        what: &str,
    ) -> Result<()> {
        if payload.is_some() && (!arguments.is_empty() || !arguments_keyword.is_empty()) {
            return Err(BasicError::InvalidArgument(format!(
                "{what} cannot carry both a transparent payload and arguments"
            ))
            .into());
        }
        Ok(())
    }

    async fn call_internal(
        &self,
        procedure: Uri,
        rpc_call: RpcCall,
        receive_progress: bool,
    ) -> Result<PendingRpc> {
        Self::check_payload_exclusivity(
            &rpc_call.payload,
            &rpc_call.arguments,
            &rpc_call.arguments_keyword,
            "a call",
        )?;
        let (command_tx, id_allocator) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.id_allocator.clone(),
                )
            })
            .await?;
        let request = id_allocator.generate_id().await;
        let (result_tx, result_rx) = unbounded_channel();
        let timeout = rpc_call.timeout;
        command_tx
            .send(SessionCommand::Call {
                request,
                procedure,
                call: rpc_call,
                receive_progress,
                result_tx,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;
        Ok(PendingRpc {
            request_id: request,
            result_rx,
            command_tx,
            timeout,
            timeout_cancel_mode: self.config.timeout_cancel_mode,
        })
    }

    async fn subscribe_internal(
        &self,
        topic: WildcardUri,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let (command_tx, id_allocator) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.id_allocator.clone(),
                )
            })
            .await?;
        let request = id_allocator.generate_id().await;
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        command_tx
            .send(SessionCommand::Subscribe {
                request,
                topic,
                options,
                subscribed_tx,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;
        match subscribed_rx.await {
            Ok(result) => result.map_err(ChannelTransmittableError::into_error),
            Err(_) => Err(PeerNotConnectedError.into()),
        }
    }

    async fn register_internal(
        &self,
        procedure: WildcardUri,
        options: ProcedureOptions,
    ) -> Result<Procedure> {
        let (command_tx, id_allocator) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.id_allocator.clone(),
                )
            })
            .await?;
        let request = id_allocator.generate_id().await;
        let (registered_tx, registered_rx) = oneshot::channel();
        command_tx
            .send(SessionCommand::Register {
                request,
                procedure,
                options,
                registered_tx,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;
        match registered_rx.await {
            Ok(result) => result.map_err(ChannelTransmittableError::into_error),
            Err(_) => Err(PeerNotConnectedError.into()),
        }
    }

    async fn publish_internal(
        &self,
        topic: Uri,
        options: PublishOptions,
        event: PublishedEvent,
    ) -> Result<Option<Id>> {
        Self::check_payload_exclusivity(
            &event.payload,
            &event.arguments,
            &event.arguments_keyword,
            "a publication",
        )?;
        let (command_tx, id_allocator) = self
            .with_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.id_allocator.clone(),
                )
            })
            .await?;
        let request = id_allocator.generate_id().await;
        let (published_tx, published_rx) = oneshot::channel();
        command_tx
            .send(SessionCommand::Publish {
                request,
                topic,
                options,
                event,
                published_tx,
            })
            .map_err(|_| Error::new(PeerNotConnectedError))?;
        match published_rx.await {
            Ok(result) => result.map_err(ChannelTransmittableError::into_error),
            Err(_) => Err(PeerNotConnectedError.into()),
        }
    }
}

/// The caller role: invokes procedures in the realm.
#[async_trait]
pub trait Caller {
    /// Calls a procedure, expecting a single result.
    async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<SimplePendingRpc>;

    /// Calls a procedure, receiving progressive results.
    async fn call_progressive(
        &self,
        procedure: Uri,
        rpc_call: RpcCall,
    ) -> Result<ProgressivePendingRpc>;
}

#[async_trait]
impl Caller for Peer {
    async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<SimplePendingRpc> {
        let pending = self.call_internal(procedure, rpc_call, false).await?;
        Ok(SimplePendingRpc { pending })
    }

    async fn call_progressive(
        &self,
        procedure: Uri,
        rpc_call: RpcCall,
    ) -> Result<ProgressivePendingRpc> {
        let pending = self.call_internal(procedure, rpc_call, true).await?;
        Ok(ProgressivePendingRpc {
            pending,
            done: false,
            canceled: false,
        })
    }
}

/// The callee role: provides procedures in the realm.
#[async_trait]
pub trait Callee {
    /// Registers a procedure.
    async fn register(&self, procedure: Uri) -> Result<Procedure>;

    /// Registers a procedure (or procedure pattern) with additional options.
    async fn register_with_options(
        &self,
        procedure: WildcardUri,
        options: ProcedureOptions,
    ) -> Result<Procedure>;
}

#[async_trait]
impl Callee for Peer {
    async fn register(&self, procedure: Uri) -> Result<Procedure> {
        self.register_internal(procedure.into(), ProcedureOptions::default())
            .await
    }

    async fn register_with_options(
        &self,
        procedure: WildcardUri,
        options: ProcedureOptions,
    ) -> Result<Procedure> {
        self.register_internal(procedure, options).await
    }
}

/// The publisher role: publishes events to topics in the realm.
#[async_trait]
pub trait Publisher {
    /// Publishes an event to a topic.
    async fn publish(&self, topic: Uri, event: PublishedEvent) -> Result<()>;

    /// Publishes an event to a topic with additional options.
    ///
    /// Returns the publication ID when the options ask for acknowledgement.
    async fn publish_with_options(
        &self,
        topic: Uri,
        options: PublishOptions,
        event: PublishedEvent,
    ) -> Result<Option<Id>>;
}

#[async_trait]
impl Publisher for Peer {
    async fn publish(&self, topic: Uri, event: PublishedEvent) -> Result<()> {
        self.publish_internal(topic, PublishOptions::default(), event)
            .await
            .map(|_| ())
    }

    async fn publish_with_options(
        &self,
        topic: Uri,
        options: PublishOptions,
        event: PublishedEvent,
    ) -> Result<Option<Id>> {
        self.publish_internal(topic, options, event).await
    }
}

/// The subscriber role: subscribes to topics in the realm.
#[async_trait]
pub trait Subscriber {
    /// Subscribes to a topic.
    ///
    /// The resulting subscription contains an event receiver stream for published events. The
    /// stream automatically closes when the peer unsubscribes from the topic or when the session
    /// ends.
    async fn subscribe(&self, topic: Uri) -> Result<Subscription>;

    /// Subscribes to a topic (or topic pattern) with additional options.
    async fn subscribe_with_options(
        &self,
        topic: WildcardUri,
        options: SubscriptionOptions,
    ) -> Result<Subscription>;
}

#[async_trait]
impl Subscriber for Peer {
    async fn subscribe(&self, topic: Uri) -> Result<Subscription> {
        self.subscribe_internal(topic.into(), SubscriptionOptions::default())
            .await
    }

    async fn subscribe_with_options(
        &self,
        topic: WildcardUri,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.subscribe_internal(topic, options).await
    }
}
